//! End-to-end dialog tests: a real session state machine driven over
//! an in-memory duplex stream, asserting on the wire replies, the
//! transaction log and the resulting envelopes.
use data_encoding::BASE64;
use k9::assert_equal;
use robind::config::ServerConfig;
use robind::session::SmtpSession;
use robind::smtp_server::{ListenerKind, ServerRuntime, SmtpServer};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

struct TestPeer<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestPeer<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    async fn send(&mut self, text: &str) {
        self.stream.write_all(text.as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn read_line(&mut self) -> Option<String> {
        loop {
            if let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=i).collect();
                return Some(String::from_utf8(line).unwrap());
            }
            let mut chunk = [0u8; 4096];
            let size = self.stream.read(&mut chunk).await.unwrap();
            if size == 0 {
                return None;
            }
            self.buffer.extend_from_slice(&chunk[..size]);
        }
    }

    /// One complete (possibly multi-line) reply
    async fn read_reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let line = self.read_line().await.expect("peer closed mid-reply");
            let done = line.len() < 4 || line.as_bytes()[3] == b' ';
            reply.push_str(&line);
            if done {
                return reply;
            }
        }
    }

    async fn expect(&mut self, prefix: &str) -> String {
        let reply = self.read_reply().await;
        assert!(
            reply.starts_with(prefix),
            "expected reply starting {prefix:?}, got {reply:?}"
        );
        reply
    }

    async fn expect_eof(&mut self) {
        assert_equal!(self.read_line().await, None);
    }
}

fn runtime(config: serde_json::Value) -> Arc<ServerRuntime> {
    let config: ServerConfig = serde_json::from_value(config).unwrap();
    Arc::new(ServerRuntime::new(config).unwrap())
}

fn start(
    config: serde_json::Value,
    kind: ListenerKind,
) -> (TestPeer<DuplexStream>, JoinHandle<SmtpSession>) {
    let runtime = runtime(config);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(async move {
        SmtpServer::with_stream(server, None, runtime, kind)
            .run()
            .await
            .expect("session run")
    });
    (TestPeer::new(client), handle)
}

#[tokio::test]
async fn plain_delivery() {
    let store_dir = tempfile::tempdir().unwrap();
    let (mut peer, handle) = start(
        serde_json::json!({
            "hostname": "mx.test",
            "storage": {"enabled": true, "path": store_dir.path()},
        }),
        ListenerKind::Smtp,
    );

    peer.expect("220 mx.test").await;
    peer.send("HELO mx.client\r\n").await;
    peer.expect("250").await;
    peer.send("MAIL FROM:<a@b>\r\n").await;
    peer.expect("250").await;
    peer.send("RCPT TO:<c@d>\r\n").await;
    peer.expect("250").await;
    peer.send("DATA\r\n").await;
    peer.expect("354").await;
    peer.send("Subject: x\r\n\r\nhello\r\n.\r\n").await;
    peer.expect("250").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    let verbs: Vec<&str> = session
        .log
        .transactions()
        .iter()
        .map(|t| t.command())
        .collect();
    assert_equal!(verbs, vec!["SMTP", "HELO", "MAIL", "RCPT", "DATA", "QUIT"]);
    assert!(session.log.errors().is_empty());

    let envelope = &session.envelopes()[0];
    assert_equal!(envelope.sender.as_ref().unwrap().to_string(), "a@b");
    assert_equal!(envelope.recipients[0].to_string(), "c@d");
    assert_equal!(envelope.data.clone(), b"Subject: x\r\n\r\nhello\r\n".to_vec());

    let stored = envelope.file.as_ref().expect("message stored");
    assert!(stored.starts_with(store_dir.path().join("d").join("c")));
    assert_equal!(
        std::fs::read(stored).unwrap(),
        b"Subject: x\r\n\r\nhello\r\n".to_vec()
    );
}

#[tokio::test]
async fn scenario_rejects_recipient() {
    let (mut peer, handle) = start(
        serde_json::json!({
            "hostname": "mx.test",
            "scenarios": {
                "block": {
                    "helo": "bad.example",
                    "rcpt": [{"value": "c@d", "response": "550 Blocked"}],
                }
            },
        }),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("HELO bad.example\r\n").await;
    peer.expect("250").await;
    peer.send("MAIL FROM:<a@b>\r\n").await;
    peer.expect("250").await;
    peer.send("RCPT TO:<c@d>\r\n").await;
    peer.expect("550 Blocked").await;
    peer.send("DATA\r\n").await;
    peer.expect("503").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    assert_equal!(session.log.failed_recipients(), vec!["c@d".to_string()]);
    assert!(session.log.has_data_error());
    // the canned rejection is a test fixture, not a client error
    assert_equal!(session.error_count, 1);
    assert!(session.envelopes()[0].recipients.is_empty());
}

#[tokio::test]
async fn auth_plain_success() {
    let (mut peer, handle) = start(
        serde_json::json!({
            "hostname": "mx.test",
            "auth": true,
            "users": [{"name": "alice", "pass": "s3cret"}],
        }),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("EHLO mx.client\r\n").await;
    let reply = peer.expect("250").await;
    assert!(reply.contains("AUTH PLAIN LOGIN CRAM-MD5 DIGEST-MD5"));

    let payload = BASE64.encode(b"\x00alice\x00s3cret");
    peer.send(&format!("AUTH PLAIN {payload}\r\n")).await;
    peer.expect("235").await;
    peer.send("MAIL FROM:<alice@b>\r\n").await;
    peer.expect("250").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    assert_equal!(session.authenticated.as_deref(), Some("alice"));
    assert!(session.extensions.auth_used);
}

#[tokio::test]
async fn auth_failure_is_an_error() {
    let (mut peer, handle) = start(
        serde_json::json!({
            "hostname": "mx.test",
            "auth": true,
            "users": [{"name": "alice", "pass": "s3cret"}],
        }),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("EHLO mx.client\r\n").await;
    peer.expect("250").await;
    let payload = BASE64.encode(b"\x00alice\x00wrong");
    peer.send(&format!("AUTH PLAIN {payload}\r\n")).await;
    peer.expect("535").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    assert_equal!(session.error_count, 1);
    assert_equal!(session.authenticated, None);
}

#[tokio::test]
async fn submission_requires_auth() {
    let (mut peer, handle) = start(
        serde_json::json!({
            "hostname": "mx.test",
            "users": [{"name": "alice", "pass": "s3cret"}],
        }),
        ListenerKind::Submission,
    );

    peer.expect("220").await;
    peer.send("EHLO mx.client\r\n").await;
    let reply = peer.expect("250").await;
    assert!(reply.contains("AUTH "));
    peer.send("MAIL FROM:<a@b>\r\n").await;
    peer.expect("530").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;
    handle.await.unwrap();
}

#[tokio::test]
async fn starttls_requires_fresh_greeting() {
    let (mut peer, handle) = start(
        serde_json::json!({"hostname": "mx.test"}),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("EHLO mx.client\r\n").await;
    let reply = peer.expect("250").await;
    assert!(reply.contains("250-STARTTLS") || reply.contains("250 STARTTLS"));
    peer.send("STARTTLS\r\n").await;
    peer.expect("220").await;

    // complete the handshake as a client that tolerates the
    // self-signed certificate
    let connector = rfc5321::TlsOptions { insecure: true }.build_tls_connector();
    let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(
        "mx.test".to_string(),
    )
    .unwrap();
    let tls_stream = connector.connect(server_name, peer.stream).await.unwrap();
    let mut peer = TestPeer::new(tls_stream);

    // the session was downgraded to the pre-greeting state
    peer.send("MAIL FROM:<a@b>\r\n").await;
    peer.expect("503").await;
    peer.send("EHLO mx.client\r\n").await;
    let reply = peer.expect("250").await;
    assert!(!reply.contains("STARTTLS"));
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    assert!(session.tls.is_some());
    assert!(session.extensions.starttls_used);
}

#[tokio::test]
async fn scenario_can_refuse_starttls() {
    let (mut peer, handle) = start(
        serde_json::json!({
            "hostname": "mx.test",
            "scenarios": {
                "no-tls": {
                    "ehlo": "shy.example",
                    "starttls": "454 4.7.0 Not today",
                }
            },
        }),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("EHLO shy.example\r\n").await;
    peer.expect("250").await;
    peer.send("STARTTLS\r\n").await;
    peer.expect("454").await;
    // no handshake happened; the plaintext dialog continues
    peer.send("NOOP\r\n").await;
    peer.expect("250").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    assert!(session.tls.is_none());
    // the canned refusal does not count against the error limit
    assert_equal!(session.error_count, 0);
}

#[tokio::test]
async fn bdat_chunked_delivery() {
    let (mut peer, handle) = start(
        serde_json::json!({"hostname": "mx.test"}),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("EHLO mx.client\r\n").await;
    let reply = peer.expect("250").await;
    assert!(reply.contains("CHUNKING"));
    peer.send("MAIL FROM:<a@b>\r\n").await;
    peer.expect("250").await;
    peer.send("RCPT TO:<c@d>\r\n").await;
    peer.expect("250").await;
    peer.send("BDAT 10\r\n0123456789").await;
    peer.expect("250").await;
    peer.send("BDAT 5 LAST\r\nabcde").await;
    peer.expect("250").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    assert_equal!(session.envelopes()[0].data.clone(), b"0123456789abcde".to_vec());
    assert_equal!(session.log.transactions_for("BDAT").len(), 2);
    assert!(session.extensions.chunking_used);
}

#[tokio::test]
async fn rcpt_rejected_between_bdat_chunks() {
    let (mut peer, handle) = start(
        serde_json::json!({"hostname": "mx.test"}),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("EHLO mx.client\r\n").await;
    peer.expect("250").await;
    peer.send("MAIL FROM:<a@b>\r\n").await;
    peer.expect("250").await;
    peer.send("RCPT TO:<c@d>\r\n").await;
    peer.expect("250").await;
    peer.send("BDAT 10\r\n0123456789").await;
    peer.expect("250").await;
    // the envelope is mid-chunk-transfer; no new recipients now
    peer.send("RCPT TO:<e@f>\r\n").await;
    peer.expect("503").await;
    peer.send("BDAT 5 LAST\r\nabcde").await;
    peer.expect("250").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    let envelope = &session.envelopes()[0];
    assert_equal!(envelope.data.clone(), b"0123456789abcde".to_vec());
    let rcpts: Vec<String> = envelope.recipients.iter().map(|r| r.to_string()).collect();
    assert_equal!(rcpts, vec!["c@d".to_string()]);
    assert_equal!(session.error_count, 1);
}

#[tokio::test]
async fn garbage_beyond_error_limit_closes_with_421() {
    let (mut peer, handle) = start(
        serde_json::json!({"hostname": "mx.test", "errorLimit": 3}),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    for _ in 0..3 {
        peer.send("BLURGH\r\n").await;
        peer.expect("500").await;
    }
    peer.send("BLURGH\r\n").await;
    peer.expect("421").await;
    peer.expect_eof().await;

    let session = handle.await.unwrap();
    assert_equal!(session.error_count, 4);
}

#[tokio::test]
async fn transaction_limit_closes_with_421() {
    let (mut peer, handle) = start(
        serde_json::json!({"hostname": "mx.test", "transactionsLimit": 2}),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("NOOP\r\n").await;
    peer.expect("250").await;
    peer.send("NOOP\r\n").await;
    peer.expect("250").await;
    peer.send("NOOP\r\n").await;
    peer.expect("421").await;
    peer.expect_eof().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn rset_opens_fresh_envelope_and_auth_sticks() {
    let (mut peer, handle) = start(
        serde_json::json!({
            "hostname": "mx.test",
            "auth": true,
            "users": [{"name": "alice", "pass": "s3cret"}],
        }),
        ListenerKind::Smtp,
    );

    peer.expect("220").await;
    peer.send("EHLO mx.client\r\n").await;
    peer.expect("250").await;
    let payload = BASE64.encode(b"\x00alice\x00s3cret");
    peer.send(&format!("AUTH PLAIN {payload}\r\n")).await;
    peer.expect("235").await;
    peer.send("MAIL FROM:<a@b>\r\n").await;
    peer.expect("250").await;
    peer.send("RSET\r\n").await;
    peer.expect("250").await;
    peer.send("MAIL FROM:<e@f>\r\n").await;
    peer.expect("250").await;
    peer.send("QUIT\r\n").await;
    peer.expect("221").await;

    let session = handle.await.unwrap();
    // auth survives RSET
    assert_equal!(session.authenticated.as_deref(), Some("alice"));
    assert_equal!(session.envelopes().len(), 2);
    assert_equal!(
        session.envelopes()[1].sender.as_ref().unwrap().to_string(),
        "e@f"
    );
}

#[tokio::test]
async fn relay_client_round_trip() {
    use rfc5321::{EnvelopeAddress, SmtpClient, SmtpClientTimeouts};

    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let runtime = runtime(serde_json::json!({"hostname": "mx.test"}));
    let handle = tokio::spawn(async move {
        SmtpServer::with_stream(server_end, None, runtime, ListenerKind::Smtp)
            .run()
            .await
            .expect("session run")
    });

    let mut client =
        SmtpClient::with_stream(client_end, "mx.test", SmtpClientTimeouts::short_timeouts());
    client.read_banner().await.unwrap();
    let caps = client.ehlo("relay.client").await.unwrap();
    assert!(caps.contains_key("PIPELINING"));

    let response = client
        .send_mail(
            EnvelopeAddress::parse("a@b").unwrap(),
            &[
                EnvelopeAddress::parse("c@d").unwrap(),
                EnvelopeAddress::parse("e@f").unwrap(),
            ],
            b"Subject: relayed\r\n\r\n.leading dot needs stuffing\r\n",
        )
        .await
        .unwrap();
    assert_equal!(response.code, 250);
    client.quit().await.unwrap();

    let session = handle.await.unwrap();
    let envelope = &session.envelopes()[0];
    assert_equal!(envelope.recipients.len(), 2);
    // the server strips the dot stuffing the client applied
    assert_equal!(
        envelope.data.clone(),
        b"Subject: relayed\r\n\r\n.leading dot needs stuffing\r\n".to_vec()
    );

    let verbs: Vec<&str> = client
        .transaction_log()
        .transactions()
        .iter()
        .map(|t| t.command())
        .collect();
    assert_equal!(verbs, vec!["SMTP", "EHLO", "MAIL", "RCPT", "RCPT", "DATA", "QUIT"]);
}
