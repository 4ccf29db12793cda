use anyhow::Context;
use clap::Parser;
use robind::config::ServerConfig;
use robind::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use robind::lifecycle::LifeCycle;
use robind::listener::SmtpListener;
use robind::smtp_server::{ListenerKind, ServerRuntime};
use std::path::PathBuf;
use std::sync::Arc;

/// Robin SMTP server: a programmable testing MTA
#[derive(Clone, Debug, Parser)]
#[command(about)]
struct Opt {
    /// Path to the server configuration file
    #[arg(long, default_value = "robin.json")]
    config: PathBuf,

    /// Load and validate the configuration and keystore, then exit
    /// without starting any listeners
    #[arg(long)]
    validate: bool,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics go to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render; json outputs machine readable
    /// records
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(opts))
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        filter_env_var: "ROBIND_LOG",
        default_filter: "robind=info,rfc5321=info,mailparsing=info",
    }
    .init()?;

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    let config = ServerConfig::load(&opts.config)?;
    let runtime = Arc::new(ServerRuntime::new(config).context("resolving server runtime")?);

    if opts.validate {
        println!("configuration OK: {}", opts.config.display());
        return Ok(());
    }

    let mut life_cycle = LifeCycle::new();

    let listeners = [
        (ListenerKind::Smtp, runtime.config.smtp_port),
        (ListenerKind::Smtps, runtime.config.secure_port),
        (ListenerKind::Submission, runtime.config.submission_port),
    ];
    for (kind, port) in listeners {
        if port == 0 {
            continue;
        }
        let listener = SmtpListener::new(runtime.clone(), kind, port);
        tokio::spawn(async move {
            if let Err(err) = listener.run().await {
                tracing::error!("{kind:?} listener failed: {err:#}");
                LifeCycle::request_shutdown().await;
            }
        });
    }

    life_cycle.wait_for_shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}
