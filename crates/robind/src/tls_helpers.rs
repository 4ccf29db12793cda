use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Server-side TLS state, built once at startup and shared by every
/// listener; there is no process-global TLS configuration.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("TlsContext").finish()
    }
}

impl TlsContext {
    /// Build the acceptor from the configured keystore, a PEM bundle
    /// holding the certificate chain and private key. With no keystore
    /// configured a self-signed certificate for `hostname` is
    /// generated, which is what a testing MTA usually wants.
    pub fn load(
        hostname: &str,
        keystore: Option<&Path>,
        keystore_password: &str,
    ) -> anyhow::Result<Self> {
        let (certificates, private_key) = match keystore {
            Some(path) => {
                let password = resolve_keystore_password(keystore_password);
                let data = std::fs::read(path)
                    .with_context(|| format!("reading keystore {}", path.display()))?;
                let certificates = load_certs(&data)
                    .with_context(|| format!("loading certificates from {}", path.display()))?;
                let private_key = load_private_key(&data, &password)
                    .with_context(|| format!("loading private key from {}", path.display()))?;
                (certificates, private_key)
            }
            None => self_signed(hostname)?,
        };

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certificates, private_key)
            .context("building TLS server config")?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}

/// The configured password is either the literal value or the name of
/// a file whose contents hold it
pub fn resolve_keystore_password(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    match std::fs::read_to_string(value) {
        Ok(contents) => contents.trim_end().to_string(),
        Err(_) => value.to_string(),
    }
}

fn self_signed(hostname: &str) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .context("generating self-signed certificate")?;
    let certificates = vec![cert.der().clone()];
    let private_key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
    Ok((certificates, private_key))
}

fn load_certs(data: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(data);
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("reading PEM encoded certificates")?;
    if certificates.is_empty() {
        anyhow::bail!("keystore holds no certificates");
    }
    Ok(certificates)
}

fn load_private_key(data: &[u8], password: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(data);
    match rustls_pemfile::private_key(&mut reader).context("reading PEM encoded private key")? {
        Some(key) => Ok(key),
        None if !password.is_empty() => anyhow::bail!(
            "no usable key found in keystore; encrypted keys are not supported, \
             provide an unencrypted PEM"
        ),
        None => anyhow::bail!("no keys found in keystore"),
    }
}
