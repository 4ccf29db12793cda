use crate::config::StorageConfig;
use crate::session::Envelope;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use mailparsing::MimeHeaders;
use std::path::{Path, PathBuf};

/// Where received messages go. The storage collaborator is free to
/// save or discard; either way the state machine keeps working.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Persist the envelope's message bytes. Returns the final path
    /// when something was written.
    async fn store(
        &self,
        session_uid: u64,
        envelope: &Envelope,
        headers: &MimeHeaders,
    ) -> anyhow::Result<Option<PathBuf>>;
}

/// Swallow everything; used when storage is disabled
#[derive(Debug)]
pub struct DiscardMessageStore;

#[async_trait]
impl MessageStore for DiscardMessageStore {
    async fn store(
        &self,
        _session_uid: u64,
        _envelope: &Envelope,
        _headers: &MimeHeaders,
    ) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Save each message under
/// `<root>/<first-rcpt-domain>/<first-rcpt-local>/<YYYYMMDD>.<uid>.eml`.
/// An `X-Robin-Filename` header requests a rename to the supplied
/// value, overwriting any preexisting target.
#[derive(Debug)]
pub struct LocalMessageStore {
    root: PathBuf,
}

impl LocalMessageStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.path.clone(),
        }
    }
}

/// Reduce a path component to characters safe for the filesystem
fn normalize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn directory_for(root: &Path, envelope: &Envelope) -> PathBuf {
    match envelope.recipients.first() {
        Some(rcpt) => match (rcpt.domain(), rcpt.local()) {
            (Some(domain), Some(local)) => root
                .join(normalize_component(domain))
                .join(normalize_component(local)),
            _ => root.to_path_buf(),
        },
        None => root.to_path_buf(),
    }
}

#[async_trait]
impl MessageStore for LocalMessageStore {
    async fn store(
        &self,
        session_uid: u64,
        envelope: &Envelope,
        headers: &MimeHeaders,
    ) -> anyhow::Result<Option<PathBuf>> {
        let dir = directory_for(&self.root, envelope);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating storage directory {}", dir.display()))?;

        let file_name = format!("{}.{}.eml", Utc::now().format("%Y%m%d"), session_uid);
        let mut path = dir.join(&file_name);
        tokio::fs::write(&path, &envelope.data)
            .await
            .with_context(|| format!("writing message to {}", path.display()))?;

        // The rename target is reduced to its final component so a
        // hostile message cannot escape the storage directory
        if let Some(requested) = headers
            .get_first("X-Robin-Filename")
            .map(|h| h.value().trim().to_string())
            .filter(|v| !v.is_empty())
        {
            let requested = Path::new(&requested)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or(requested);
            let target = dir.join(&requested);
            tokio::fs::rename(&path, &target)
                .await
                .with_context(|| format!("renaming message to {}", target.display()))?;
            tracing::info!("storage moved file to {}", target.display());
            path = target;
        }

        tracing::info!("storage file saved to {}", path.display());
        Ok(Some(path))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use mailparsing::MimeHeader;
    use rfc5321::EnvelopeAddress;

    fn envelope(rcpt: &str, data: &[u8]) -> Envelope {
        let mut session = crate::session::SmtpSession::new(None);
        let envelope = session.current_envelope();
        envelope.sender = Some(EnvelopeAddress::parse("a@b").unwrap());
        envelope.add_recipient(EnvelopeAddress::parse(rcpt).unwrap());
        envelope.data = data.to_vec();
        envelope.clone()
    }

    #[tokio::test]
    async fn saves_under_recipient_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMessageStore {
            root: dir.path().to_path_buf(),
        };
        let envelope = envelope("c@d.example", b"Subject: x\r\n\r\nhi\r\n");
        let path = store
            .store(42, &envelope, &MimeHeaders::new())
            .await
            .unwrap()
            .unwrap();
        assert!(path.starts_with(dir.path().join("d.example").join("c")));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".42.eml"));
        assert_equal!(
            std::fs::read(&path).unwrap(),
            b"Subject: x\r\n\r\nhi\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn rename_header_overwrites_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMessageStore {
            root: dir.path().to_path_buf(),
        };
        let target = dir.path().join("d.example").join("c").join("fixed.eml");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"old contents").unwrap();

        let mut headers = MimeHeaders::new();
        headers.push(MimeHeader::new("X-Robin-Filename", "fixed.eml"));
        let envelope = envelope("c@d.example", b"new contents");
        let path = store.store(7, &envelope, &headers).await.unwrap().unwrap();
        assert_equal!(path, target);
        assert_equal!(std::fs::read(&target).unwrap(), b"new contents".to_vec());
    }

    #[tokio::test]
    async fn rename_cannot_escape_storage_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMessageStore {
            root: dir.path().to_path_buf(),
        };
        let mut headers = MimeHeaders::new();
        headers.push(MimeHeader::new("X-Robin-Filename", "../../escape.eml"));
        let envelope = envelope("c@d.example", b"data");
        let path = store.store(9, &envelope, &headers).await.unwrap().unwrap();
        assert_equal!(path.file_name().unwrap().to_string_lossy(), "escape.eml");
        assert!(path.starts_with(dir.path().join("d.example").join("c")));
    }

    #[test]
    fn component_normalization() {
        assert_equal!(normalize_component("d.example"), "d.example");
        assert_equal!(normalize_component("we ird/../na me"), "we_ird_.._na_me");
    }
}
