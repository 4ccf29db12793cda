use chrono::{DateTime, Utc};
use rfc5321::{EnvelopeAddress, TransactionLog};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static SESSION_UID: AtomicU64 = AtomicU64::new(1);

/// The greeting the peer introduced itself with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub verb: String,
    pub name: String,
}

/// Negotiated TLS parameters once a session has been upgraded or was
/// accepted on an implicit-TLS listener
#[derive(Debug, Clone, Default)]
pub struct TlsParams {
    pub protocol: String,
    pub cipher: String,
}

/// Which extensions were offered to this peer and which it used
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionState {
    pub starttls_offered: bool,
    pub starttls_used: bool,
    pub chunking_offered: bool,
    pub chunking_used: bool,
    pub auth_offered: bool,
    pub auth_used: bool,
}

/// One mail transaction inside a session: sender, recipients and the
/// received message data, plus where it ended up on disk
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Option<EnvelopeAddress>,
    pub recipients: Vec<EnvelopeAddress>,
    pub data: Vec<u8>,
    pub message_id: Option<String>,
    pub file: Option<PathBuf>,
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    fn new() -> Self {
        Self {
            sender: None,
            recipients: Vec::new(),
            data: Vec::new(),
            message_id: None,
            file: None,
            received_at: Utc::now(),
        }
    }

    /// Recipients are kept unique and in arrival order
    pub fn add_recipient(&mut self, address: EnvelopeAddress) {
        if !self.recipients.contains(&address) {
            self.recipients.push(address);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_none() && self.recipients.is_empty() && self.data.is_empty()
    }
}

/// All per-connection state. A session is owned by exactly one worker
/// for its whole life, so nothing here needs locking.
#[derive(Debug)]
pub struct SmtpSession {
    uid: u64,
    pub peer: Option<SocketAddr>,
    pub greeting: Option<Greeting>,
    pub tls: Option<TlsParams>,
    pub authenticated: Option<String>,
    pub extensions: ExtensionState,
    envelopes: Vec<Envelope>,
    magic: HashMap<String, String>,
    pub log: TransactionLog,
    pub error_count: u32,
    pub transaction_count: u32,
}

impl SmtpSession {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        let uid = SESSION_UID.fetch_add(1, Ordering::SeqCst);
        let mut magic = HashMap::new();
        magic.insert("uid".to_string(), uid.to_string());
        Self {
            uid,
            peer,
            greeting: None,
            tls: None,
            authenticated: None,
            extensions: ExtensionState::default(),
            envelopes: Vec::new(),
            magic,
            log: TransactionLog::new(),
            error_count: 0,
            transaction_count: 0,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// The most recently opened envelope, created on demand at the
    /// first MAIL FROM
    pub fn current_envelope(&mut self) -> &mut Envelope {
        if self.envelopes.is_empty() {
            self.envelopes.push(Envelope::new());
        }
        self.envelopes.last_mut().expect("just ensured non-empty")
    }

    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.envelopes.last()
    }

    /// Start a new envelope, as RSET and a completed DATA/BDAT do.
    /// The authenticated user survives; only STARTTLS clears it.
    pub fn reset(&mut self) {
        match self.envelopes.last() {
            Some(envelope) if envelope.is_empty() => {}
            _ => self.envelopes.push(Envelope::new()),
        }
    }

    pub fn put_magic<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.magic.insert(key.into(), value.into());
    }

    pub fn get_magic(&self, key: &str) -> Option<&str> {
        self.magic.get(key).map(|v| v.as_str())
    }

    pub fn magic(&self) -> &HashMap<String, String> {
        &self.magic
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn uids_are_unique_and_monotonic() {
        let a = SmtpSession::new(None);
        let b = SmtpSession::new(None);
        assert!(b.uid() > a.uid());
    }

    #[test]
    fn current_envelope_created_on_demand() {
        let mut session = SmtpSession::new(None);
        assert_equal!(session.envelopes().len(), 0);
        session.current_envelope().sender = Some(EnvelopeAddress::parse("a@b").unwrap());
        assert_equal!(session.envelopes().len(), 1);
    }

    #[test]
    fn reset_opens_a_fresh_envelope() {
        let mut session = SmtpSession::new(None);
        session.current_envelope().sender = Some(EnvelopeAddress::parse("a@b").unwrap());
        session.reset();
        assert_equal!(session.envelopes().len(), 2);
        assert!(session.current_envelope().sender.is_none());
        // resetting an already-empty envelope doesn't pile up empties
        session.reset();
        assert_equal!(session.envelopes().len(), 2);
    }

    #[test]
    fn recipients_are_unique_and_ordered() {
        let mut session = SmtpSession::new(None);
        let envelope = session.current_envelope();
        envelope.add_recipient(EnvelopeAddress::parse("a@b").unwrap());
        envelope.add_recipient(EnvelopeAddress::parse("c@d").unwrap());
        envelope.add_recipient(EnvelopeAddress::parse("a@b").unwrap());
        let rcpts: Vec<String> = envelope.recipients.iter().map(|r| r.to_string()).collect();
        assert_equal!(rcpts, vec!["a@b".to_string(), "c@d".to_string()]);
    }

    #[test]
    fn magic_variables() {
        let mut session = SmtpSession::new(None);
        session.put_magic("campaign", "smoke-42");
        assert_equal!(session.get_magic("campaign"), Some("smoke-42"));
        assert_equal!(session.get_magic("uid").unwrap(), session.uid().to_string());
        assert_equal!(session.get_magic("missing"), None);
    }
}
