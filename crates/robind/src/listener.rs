use crate::lifecycle::{Activity, ShutdownSubscription};
use crate::session::TlsParams;
use crate::smtp_server::{ListenerKind, ServerRuntime, SmtpServer};
use anyhow::Context;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One bound socket with its accept loop. Plain, implicit-TLS and
/// submission listeners coexist, each with its own flavor; session
/// state and scenario bindings come from the shared runtime.
pub struct SmtpListener {
    runtime: Arc<ServerRuntime>,
    kind: ListenerKind,
    port: u16,
}

impl SmtpListener {
    pub fn new(runtime: Arc<ServerRuntime>, kind: ListenerKind, port: u16) -> Self {
        Self {
            runtime,
            kind,
            port,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr: IpAddr = self
            .runtime
            .config
            .bind
            .parse()
            .with_context(|| format!("parsing bind address {:?}", self.runtime.config.bind))?;
        let addr = SocketAddr::new(addr, self.port);

        let socket = match &addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .context("creating listener socket")?;
        socket
            .bind(addr)
            .with_context(|| format!("binding {addr}"))?;
        let listener = socket
            .listen(self.runtime.config.backlog)
            .with_context(|| format!("listening on {addr}"))?;

        tracing::info!("{:?} listener ready on {addr}", self.kind);

        // the session cap doubles as the worker pool bound: beyond it,
        // accepts queue in the OS backlog and the overflow gets a 421
        let sessions = Arc::new(Semaphore::new(self.runtime.config.maximum_pool_size));
        let mut shutdown = ShutdownSubscription::get();

        loop {
            tokio::select! {
                _ = shutdown.shutting_down() => {
                    tracing::info!("{:?} listener on {addr} stopping", self.kind);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!("accept failed on {addr}: {err:#}");
                            continue;
                        }
                    };
                    stream.set_nodelay(true).ok();

                    let Ok(activity) = Activity::get() else {
                        return Ok(());
                    };
                    match sessions.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let runtime = self.runtime.clone();
                            let kind = self.kind;
                            tokio::spawn(async move {
                                handle_connection(stream, peer, runtime, kind, permit).await;
                                drop(activity);
                            });
                        }
                        Err(_) => {
                            tokio::spawn(async move {
                                refuse_connection(stream).await;
                                drop(activity);
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Session cap reached: tell the peer to come back later
async fn refuse_connection(mut stream: TcpStream) {
    let _ = stream
        .write_all(b"421 4.3.2 Too many concurrent sessions, try again later\r\n")
        .await;
    let _ = stream.shutdown().await;
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    runtime: Arc<ServerRuntime>,
    kind: ListenerKind,
    _permit: OwnedSemaphorePermit,
) {
    tracing::debug!("accepted {peer} on {kind:?}");

    if kind.implicit_tls() {
        let Some(tls) = runtime.tls.clone() else {
            tracing::warn!("implicit TLS listener without a TLS context, dropping {peer}");
            return;
        };
        let stream = match tls.acceptor().accept(stream).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::info!("implicit TLS handshake with {peer} failed: {err:#}");
                return;
            }
        };
        let params = {
            let (_, conn) = stream.get_ref();
            TlsParams {
                protocol: conn
                    .protocol_version()
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN")
                    .to_string(),
                cipher: conn
                    .negotiated_cipher_suite()
                    .and_then(|s| s.suite().as_str())
                    .unwrap_or("UNKNOWN")
                    .to_string(),
            }
        };
        let mut server = SmtpServer::with_stream(stream, Some(peer), runtime, kind);
        server.set_tls_params(params);
        run_session(server, peer).await;
    } else {
        let server = SmtpServer::with_stream(stream, Some(peer), runtime, kind);
        run_session(server, peer).await;
    }
}

async fn run_session(server: SmtpServer, peer: SocketAddr) {
    match server.run().await {
        Ok(session) => tracing::debug!(
            "session {} with {peer} finished after {} transactions",
            session.uid(),
            session.log.len()
        ),
        Err(err) => tracing::info!("session with {peer} failed: {err:#}"),
    }
}
