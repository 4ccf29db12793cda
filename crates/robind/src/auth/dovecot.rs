use crate::auth::CredentialStore;
use anyhow::Context;
use async_trait::async_trait;
use data_encoding::BASE64;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Credential backend speaking the Dovecot authentication protocol
/// over a Unix-domain socket. Each verification runs one PLAIN request
/// on a fresh connection; Dovecot never reveals stored passwords, so
/// the digest mechanisms are unavailable with this backend.
#[derive(Debug)]
pub struct DovecotCredentialStore {
    socket_path: PathBuf,
}

impl DovecotCredentialStore {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

#[async_trait]
impl CredentialStore for DovecotCredentialStore {
    async fn verify(&self, username: &str, password: &str) -> anyhow::Result<bool> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!("connecting to dovecot auth socket {}", self.socket_path.display())
            })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("VERSION\t1\t1\nCPID\t{}\n", std::process::id()).as_bytes())
            .await?;

        // the server announces VERSION/MECH/SPID/CUID and closes its
        // handshake with DONE
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                anyhow::bail!("dovecot auth socket closed during handshake");
            }
            if line.trim_end() == "DONE" {
                break;
            }
        }

        let resp = BASE64.encode(format!("\0{username}\0{password}").as_bytes());
        write_half
            .write_all(format!("AUTH\t1\tPLAIN\tservice=smtp\tresp={resp}\n").as_bytes())
            .await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                anyhow::bail!("dovecot auth socket closed before a verdict");
            }
            let line = line.trim_end();
            if line.starts_with("OK\t") {
                return Ok(true);
            }
            if line.starts_with("FAIL\t") {
                return Ok(false);
            }
            // CONT would mean a multi-round mechanism, which PLAIN is not
            if line.starts_with("CONT\t") {
                anyhow::bail!("unexpected continuation from dovecot for PLAIN");
            }
        }
    }

    async fn lookup(&self, _username: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn supports_lookup(&self) -> bool {
        false
    }
}
