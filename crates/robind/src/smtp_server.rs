use crate::auth::{self, AuthStep, CredentialStore};
use crate::config::{ScenarioConfig, ServerConfig};
use crate::relay;
use crate::scenario::{match_scenario, render};
use crate::session::{Greeting, SmtpSession, TlsParams};
use crate::storage::{DiscardMessageStore, LocalMessageStore, MessageStore};
use crate::tls_helpers::TlsContext;
use anyhow::Context;
use mailparsing::EmailParser;
use rfc5321::{
    AsyncReadAndWrite, BoxedAsyncReadAndWrite, Command, EsmtpParameter, Transaction,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const MAX_LINE_LEN: usize = 4096;

/// Which listener flavor accepted the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Plain ESMTP, classically port 25
    Smtp,
    /// Implicit TLS at accept, classically port 465
    Smtps,
    /// Message submission, classically port 587; requires AUTH
    Submission,
}

impl ListenerKind {
    pub fn implicit_tls(&self) -> bool {
        matches!(self, Self::Smtps)
    }

    pub fn requires_auth(&self) -> bool {
        matches!(self, Self::Submission)
    }
}

/// Immutable state shared by every session: resolved configuration,
/// the TLS context, and the storage/credential collaborators
#[derive(Debug)]
pub struct ServerRuntime {
    pub config: ServerConfig,
    pub tls: Option<TlsContext>,
    pub storage: Arc<dyn MessageStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl ServerRuntime {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let tls = if config.starttls || config.secure_port != 0 {
            Some(
                TlsContext::load(
                    &config.hostname,
                    config.keystore.as_deref(),
                    &config.keystore_password,
                )
                .context("loading TLS keystore")?,
            )
        } else {
            None
        };

        let storage: Arc<dyn MessageStore> = if config.storage.enabled {
            Arc::new(LocalMessageStore::new(&config.storage))
        } else {
            Arc::new(DiscardMessageStore)
        };

        let credentials: Arc<dyn CredentialStore> = if config.dovecot_auth {
            Arc::new(auth::dovecot::DovecotCredentialStore::new(
                config.dovecot_auth_socket.clone(),
            ))
        } else {
            Arc::new(auth::ConfigCredentialStore::new(config.users.clone()))
        };

        Ok(Self {
            config,
            tls,
            storage,
            credentials,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

enum LineOutcome {
    Line(Vec<u8>),
    Eof,
    TimedOut,
}

/// Server side of one SMTP connection: owns the socket, the session
/// state and the command state machine. The dialog is strictly
/// sequential, so no locking is needed anywhere in here.
pub struct SmtpServer {
    socket: Option<BoxedAsyncReadAndWrite>,
    read_buffer: Vec<u8>,
    runtime: Arc<ServerRuntime>,
    kind: ListenerKind,
    pub session: SmtpSession,
    state: SmtpState,
    scenario: Option<ScenarioConfig>,
    bdat_active: bool,
}

impl SmtpServer {
    pub fn with_stream<S: AsyncReadAndWrite + 'static>(
        stream: S,
        peer: Option<SocketAddr>,
        runtime: Arc<ServerRuntime>,
        kind: ListenerKind,
    ) -> Self {
        let mut session = SmtpSession::new(peer);
        session.put_magic("hostname", runtime.config.hostname.clone());
        Self {
            socket: Some(Box::new(stream)),
            read_buffer: Vec::with_capacity(1024),
            runtime,
            kind,
            session,
            state: SmtpState::Connected,
            scenario: None,
            bdat_active: false,
        }
    }

    /// Implicit-TLS listeners record the handshake parameters before
    /// the dialog starts
    pub fn set_tls_params(&mut self, params: TlsParams) {
        self.session.tls = Some(params);
    }

    /// Drive the dialog to completion and hand back the session so the
    /// caller (or a test) can inspect envelopes and the transaction log
    pub async fn run(mut self) -> anyhow::Result<SmtpSession> {
        let result = self.process().await;
        if let Err(err) = result {
            tracing::info!("session {} ended: {err:#}", self.session.uid());
        }
        Ok(self.session)
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        let banner = format!("220 {} Robin ESMTP service ready", self.hostname());
        self.reply(&banner).await?;
        self.session
            .log
            .add(Transaction::new("SMTP").with_response(banner.clone()));

        loop {
            let line = match self.next_line().await? {
                LineOutcome::Line(line) => line,
                LineOutcome::Eof => {
                    tracing::info!("session {}: peer closed connection", self.session.uid());
                    return Ok(());
                }
                LineOutcome::TimedOut => {
                    self.reply("421 4.4.2 Idle timeout, closing connection")
                        .await
                        .ok();
                    return Ok(());
                }
            };

            self.session.transaction_count += 1;
            if self.session.transaction_count > self.runtime.config.transactions_limit {
                self.reply("421 4.7.0 Too many transactions, closing connection")
                    .await?;
                return Ok(());
            }

            let text = String::from_utf8_lossy(&line)
                .trim_end_matches(&['\r', '\n'][..])
                .to_string();
            if text.len() > MAX_LINE_LEN {
                if self.command_error(verb_of(&text), "500 5.5.2 Line too long").await? == Flow::Close {
                    return Ok(());
                }
                continue;
            }

            let flow = match Command::parse(&text) {
                Err(err) => {
                    tracing::debug!("unparseable command {text:?}: {err}");
                    self.command_error(verb_of(&text), "501 5.5.2 Syntax error in parameters")
                        .await?
                }
                Ok(Command::Unknown(_)) => {
                    self.command_error(verb_of(&text), "500 5.5.1 Syntax error, command unrecognized")
                        .await?
                }
                Ok(Command::Helo(name)) => self.cmd_greeting("HELO", name).await?,
                Ok(Command::Ehlo(name)) => self.cmd_greeting("EHLO", name).await?,
                Ok(Command::Lhlo(name)) => self.cmd_greeting("LHLO", name).await?,
                Ok(Command::StartTls) => self.cmd_starttls().await?,
                Ok(Command::Auth {
                    mechanism,
                    initial_response,
                }) => self.cmd_auth(mechanism, initial_response).await?,
                Ok(Command::MailFrom {
                    address,
                    parameters,
                }) => self.cmd_mail(address, parameters).await?,
                Ok(Command::RcptTo { address, .. }) => self.cmd_rcpt(address).await?,
                Ok(Command::Data) => self.cmd_data().await?,
                Ok(Command::Bdat { size, last }) => self.cmd_bdat(size, last).await?,
                Ok(Command::Rset) => self.cmd_rset().await?,
                Ok(Command::Noop(_)) => {
                    self.reply_and_log("NOOP", None, "250 2.0.0 OK", false).await?;
                    Flow::Continue
                }
                Ok(Command::Quit) => {
                    let reply = format!("221 2.0.0 {} closing connection", self.hostname());
                    self.reply_and_log("QUIT", None, &reply, false).await?;
                    return Ok(());
                }
                Ok(Command::DataDot) => {
                    // a lone dot outside of DATA is just noise
                    self.command_error(Some("DATA".to_string()), "503 5.5.1 Bad sequence of commands")
                        .await?
                }
            };

            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    fn hostname(&self) -> &str {
        &self.runtime.config.hostname
    }

    fn auth_enabled(&self) -> bool {
        self.runtime.config.auth || self.kind.requires_auth()
    }

    // ==== replies and transaction recording ====

    /// Write a reply, continuation-splitting multi-line text on `\n`
    /// with the `NNN-` convention
    async fn reply(&mut self, text: &str) -> anyhow::Result<()> {
        let mut wire = String::new();
        if text.len() >= 4 && text.as_bytes()[..3].iter().all(|b| b.is_ascii_digit()) {
            let code = &text[..3];
            let body = &text[4..];
            let mut lines = body.lines().peekable();
            if lines.peek().is_none() {
                wire.push_str(text);
                wire.push_str("\r\n");
            }
            while let Some(line) = lines.next() {
                let sep = if lines.peek().is_none() { ' ' } else { '-' };
                wire.push_str(&format!("{code}{sep}{line}\r\n"));
            }
        } else {
            wire.push_str(text);
            wire.push_str("\r\n");
        }

        let socket = self.socket.as_mut().ok_or_else(|| anyhow::anyhow!("socket closed"))?;
        socket
            .write_all(wire.as_bytes())
            .await
            .context("writing reply")?;
        socket.flush().await.context("flushing reply")?;
        tracing::trace!("send->{:?}: {}", self.session.peer, wire.trim_end());
        Ok(())
    }

    /// Reply and record the exchange. `scenario_injected` marks canned
    /// rejections which are recorded as errors but never counted
    /// against the client's error limit.
    async fn reply_and_log(
        &mut self,
        verb: &str,
        payload: Option<String>,
        reply_text: &str,
        _scenario_injected: bool,
    ) -> anyhow::Result<()> {
        self.reply(reply_text).await?;
        let mut txn = Transaction::new(verb)
            .with_response(rfc5321::flatten_line_breaks(reply_text));
        if let Some(payload) = payload {
            txn = txn.with_payload(payload);
        }
        self.session.log.add(txn);
        Ok(())
    }

    /// A protocol or sequence error: reply, count it, and hang up with
    /// 421 once the client has worn out its welcome
    async fn command_error(
        &mut self,
        verb: Option<String>,
        reply_text: &str,
    ) -> anyhow::Result<Flow> {
        self.session.error_count += 1;
        if self.session.error_count > self.runtime.config.error_limit {
            let text = "421 4.7.0 Too many errors, closing connection";
            self.reply(text).await?;
            if let Some(verb) = verb {
                self.session
                    .log
                    .add(Transaction::new(verb).with_response(text));
            }
            return Ok(Flow::Close);
        }
        self.reply(reply_text).await?;
        if let Some(verb) = verb {
            self.session
                .log
                .add(Transaction::new(verb).with_response(reply_text));
        }
        Ok(Flow::Continue)
    }

    // ==== verb handlers ====

    async fn cmd_greeting(&mut self, verb: &str, name: String) -> anyhow::Result<Flow> {
        self.session.greeting = Some(Greeting {
            verb: verb.to_string(),
            name: name.clone(),
        });
        self.scenario = match_scenario(&self.runtime.config, verb, &name).cloned();
        if self.scenario.is_some() {
            tracing::debug!("session {}: scenario engaged for {name}", self.session.uid());
        }
        self.session.reset();
        self.bdat_active = false;
        self.state = SmtpState::Greeted;

        let reply = if verb == "HELO" {
            format!("250 {} Hello {name}", self.hostname())
        } else {
            let mut lines = vec![format!("{} Hello {name}", self.hostname())];
            lines.extend(self.extension_lines());
            format!("250 {}", lines.join("\n"))
        };
        self.reply_and_log(verb, Some(name), &reply, false).await?;
        Ok(Flow::Continue)
    }

    fn extension_lines(&mut self) -> Vec<String> {
        let mut lines = vec![];
        if self.runtime.config.starttls
            && self.runtime.tls.is_some()
            && self.session.tls.is_none()
        {
            lines.push("STARTTLS".to_string());
            self.session.extensions.starttls_offered = true;
        }
        if self.auth_enabled() {
            let names = auth::mechanism_names(self.runtime.credentials.as_ref());
            lines.push(format!("AUTH {}", names.join(" ")));
            self.session.extensions.auth_offered = true;
        }
        if self.runtime.config.chunking {
            lines.push("CHUNKING".to_string());
            self.session.extensions.chunking_offered = true;
        }
        if let Some(limit) = self.runtime.config.size_limit {
            lines.push(format!("SIZE {limit}"));
        }
        lines.push("8BITMIME".to_string());
        lines.push("PIPELINING".to_string());
        lines.push("ENHANCEDSTATUSCODES".to_string());
        lines
    }

    async fn cmd_starttls(&mut self) -> anyhow::Result<Flow> {
        if self.session.tls.is_some() {
            return self
                .command_error(Some("STARTTLS".to_string()), "503 5.5.1 Already using TLS")
                .await;
        }
        if self.state == SmtpState::Connected {
            return self
                .command_error(Some("STARTTLS".to_string()), "503 5.5.1 Say hello first")
                .await;
        }
        let Some(tls) = self.runtime.tls.clone() else {
            return self
                .command_error(Some("STARTTLS".to_string()), "454 4.7.0 TLS not available")
                .await;
        };

        // a scenario can refuse the upgrade with a canned reply, in
        // which case no handshake happens
        let canned = self.scenario.as_ref().and_then(|s| s.starttls.clone());
        let reply = match canned {
            Some(canned) => render(&canned, self.session.magic()),
            None => "220 2.0.0 Ready to start TLS".to_string(),
        };
        let skip_handshake = !reply.starts_with('2');
        self.reply_and_log("STARTTLS", None, &reply, skip_handshake)
            .await?;
        if skip_handshake {
            return Ok(Flow::Continue);
        }

        let stream = self
            .socket
            .take()
            .ok_or_else(|| anyhow::anyhow!("socket closed"))?;
        // anything the peer pipelined before the handshake is void
        self.read_buffer.clear();

        match tls.acceptor().accept(stream).await {
            Ok(stream) => {
                let (_, conn) = stream.get_ref();
                let params = TlsParams {
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
                };
                tracing::debug!(
                    "session {}: TLS established {params:?}",
                    self.session.uid()
                );
                self.socket.replace(Box::new(stream));
                self.session.tls = Some(params);
                self.session.extensions.starttls_used = true;
                // the peer must start over: greeting, auth, envelopes
                self.session.greeting = None;
                self.session.authenticated = None;
                self.scenario = None;
                self.session.reset();
                self.state = SmtpState::Connected;
                Ok(Flow::Continue)
            }
            Err(err) => {
                // handshake failure closes the connection without a reply
                tracing::info!(
                    "session {}: TLS handshake failed: {err:#}",
                    self.session.uid()
                );
                Ok(Flow::Close)
            }
        }
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        initial_response: Option<String>,
    ) -> anyhow::Result<Flow> {
        if !self.auth_enabled() {
            return self
                .command_error(Some("AUTH".to_string()), "503 5.5.1 AUTH not enabled")
                .await;
        }
        if self.state != SmtpState::Greeted {
            return self
                .command_error(Some("AUTH".to_string()), "503 5.5.1 Bad sequence of commands")
                .await;
        }
        if self.session.authenticated.is_some() {
            return self
                .command_error(Some("AUTH".to_string()), "503 5.5.1 Already authenticated")
                .await;
        }
        let Some(mut mech) = auth::create_mechanism(
            &mechanism,
            &self.runtime.config.hostname,
            self.runtime.credentials.clone(),
        ) else {
            return self
                .command_error(
                    Some("AUTH".to_string()),
                    "504 5.5.4 Unrecognized authentication type",
                )
                .await;
        };

        let mut step = mech.initial(initial_response).await;
        loop {
            match step {
                Err(err) => {
                    tracing::warn!("authentication backend failure: {err:#}");
                    self.reply_and_log(
                        "AUTH",
                        Some(mechanism),
                        "454 4.7.0 Temporary authentication failure",
                        false,
                    )
                    .await?;
                    return Ok(Flow::Continue);
                }
                Ok(AuthStep::Challenge(challenge)) => {
                    self.reply(&format!("334 {challenge}")).await?;
                    let line = match self.next_line().await? {
                        LineOutcome::Line(line) => String::from_utf8_lossy(&line)
                            .trim_end_matches(&['\r', '\n'][..])
                            .to_string(),
                        LineOutcome::Eof | LineOutcome::TimedOut => return Ok(Flow::Close),
                    };
                    if line == "*" {
                        return self
                            .command_error(
                                Some("AUTH".to_string()),
                                "501 5.7.0 Authentication cancelled",
                            )
                            .await;
                    }
                    step = mech.respond(line).await;
                }
                Ok(AuthStep::Success { username }) => {
                    self.session.authenticated = Some(username.clone());
                    self.session.extensions.auth_used = true;
                    tracing::info!(
                        "session {}: authenticated as {username}",
                        self.session.uid()
                    );
                    self.reply_and_log(
                        "AUTH",
                        Some(mechanism),
                        "235 2.7.0 Authentication succeeded",
                        false,
                    )
                    .await?;
                    return Ok(Flow::Continue);
                }
                Ok(AuthStep::Failed) => {
                    self.session.error_count += 1;
                    if self.session.error_count > self.runtime.config.error_limit {
                        self.reply("421 4.7.0 Too many errors, closing connection")
                            .await?;
                        return Ok(Flow::Close);
                    }
                    self.reply_and_log(
                        "AUTH",
                        Some(mechanism),
                        "535 5.7.8 Authentication credentials invalid",
                        false,
                    )
                    .await?;
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    async fn cmd_mail(
        &mut self,
        address: rfc5321::EnvelopeAddress,
        parameters: Vec<EsmtpParameter>,
    ) -> anyhow::Result<Flow> {
        if self.state != SmtpState::Greeted {
            return self
                .command_error(Some("MAIL".to_string()), "503 5.5.1 Bad sequence of commands")
                .await;
        }
        if self.kind.requires_auth() && self.session.authenticated.is_none() {
            return self
                .command_error(Some("MAIL".to_string()), "530 5.7.0 Authentication required")
                .await;
        }
        if let Some(limit) = self.runtime.config.size_limit {
            let declared = parameters
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case("SIZE"))
                .and_then(|p| p.value.as_ref())
                .and_then(|v| v.parse::<u64>().ok());
            if matches!(declared, Some(size) if size > limit) {
                self.reply_and_log(
                    "MAIL",
                    Some(address.to_string()),
                    "552 5.3.4 Message size exceeds fixed limit",
                    false,
                )
                .await?;
                return Ok(Flow::Continue);
            }
        }

        let canned = self.scenario.as_ref().and_then(|s| s.mail.clone());
        let injected = canned.is_some();
        let reply = match canned {
            Some(canned) => render(&canned, self.session.magic()),
            None => "250 2.1.0 Sender OK".to_string(),
        };

        if reply.starts_with('2') {
            let envelope = self.session.current_envelope();
            envelope.sender = Some(address.clone());
            self.state = SmtpState::MailFrom;
        }
        self.reply_and_log("MAIL", Some(address.to_string()), &reply, injected)
            .await?;
        Ok(Flow::Continue)
    }

    /// RCPT rejections record the offending mailbox so that
    /// failed-recipient queries always have an address to report
    async fn rcpt_error(&mut self, mailbox: String, reply_text: &str) -> anyhow::Result<Flow> {
        self.session.error_count += 1;
        let (reply, flow) = if self.session.error_count > self.runtime.config.error_limit {
            ("421 4.7.0 Too many errors, closing connection", Flow::Close)
        } else {
            (reply_text, Flow::Continue)
        };
        self.reply(reply).await?;
        self.session.log.add(
            Transaction::new("RCPT")
                .with_payload(mailbox.clone())
                .with_response(reply)
                .with_address(mailbox),
        );
        Ok(flow)
    }

    async fn cmd_rcpt(&mut self, address: rfc5321::EnvelopeAddress) -> anyhow::Result<Flow> {
        if self.bdat_active {
            return self
                .rcpt_error(address.to_string(), "503 5.5.1 BDAT in progress")
                .await;
        }
        if !matches!(self.state, SmtpState::MailFrom | SmtpState::RcptTo) {
            return self
                .rcpt_error(address.to_string(), "503 5.5.1 Need MAIL before RCPT")
                .await;
        }

        let mailbox = address.to_string();
        let canned = self.scenario.as_ref().and_then(|s| {
            s.rcpt
                .iter()
                .find(|r| r.value.eq_ignore_ascii_case(&mailbox))
                .map(|r| r.response.clone())
        });
        let injected = canned.is_some();
        let reply = match canned {
            Some(canned) => render(&canned, self.session.magic()),
            None => "250 2.1.5 Recipient OK".to_string(),
        };

        if reply.starts_with('2') {
            self.session.current_envelope().add_recipient(address.clone());
            self.state = SmtpState::RcptTo;
        }

        self.reply(&reply).await?;
        self.session.log.add(
            Transaction::new("RCPT")
                .with_payload(mailbox.clone())
                .with_response(reply.clone())
                .with_address(mailbox),
        );
        Ok(Flow::Continue)
    }

    async fn cmd_data(&mut self) -> anyhow::Result<Flow> {
        if self.bdat_active {
            return self
                .command_error(Some("DATA".to_string()), "503 5.5.1 BDAT in progress")
                .await;
        }
        if self.state != SmtpState::RcptTo {
            return self
                .command_error(Some("DATA".to_string()), "503 5.5.1 Need RCPT before DATA")
                .await;
        }

        self.reply("354 Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let mut data: Vec<u8> = Vec::new();
        loop {
            let line = match self.next_line().await? {
                LineOutcome::Line(line) => line,
                LineOutcome::Eof | LineOutcome::TimedOut => {
                    // an interrupted body is a failed transaction and
                    // is recorded as such
                    self.session.log.add(
                        Transaction::new("DATA")
                            .with_response("451 4.3.0 Message receipt interrupted"),
                    );
                    return Ok(Flow::Close);
                }
            };
            if line == b".\r\n" || line == b".\n" {
                break;
            }
            // strip dot stuffing
            if line.first() == Some(&b'.') {
                data.extend_from_slice(&line[1..]);
            } else {
                data.extend_from_slice(&line);
            }
        }

        if let Some(limit) = self.runtime.config.size_limit {
            if data.len() as u64 > limit {
                self.reply_and_log(
                    "DATA",
                    None,
                    "552 5.3.4 Message size exceeds fixed limit",
                    false,
                )
                .await?;
                self.session.reset();
                self.state = SmtpState::Greeted;
                return Ok(Flow::Continue);
            }
        }

        self.session.current_envelope().data = data;

        let canned = self.scenario.as_ref().and_then(|s| s.data.clone());
        let injected = canned.is_some();
        let reply = match canned {
            Some(canned) => render(&canned, self.session.magic()),
            None => "250 2.6.0 Message received".to_string(),
        };
        let accepted = reply.starts_with('2');
        self.reply_and_log("DATA", None, &reply, injected).await?;

        if accepted {
            self.finalize_envelope().await;
        } else {
            self.session.reset();
        }
        self.state = SmtpState::Greeted;
        Ok(Flow::Continue)
    }

    async fn cmd_bdat(&mut self, size: usize, last: bool) -> anyhow::Result<Flow> {
        if !self.runtime.config.chunking {
            return self
                .command_error(Some("BDAT".to_string()), "500 5.5.1 CHUNKING not enabled")
                .await;
        }
        if self.state != SmtpState::RcptTo {
            return self
                .command_error(Some("BDAT".to_string()), "503 5.5.1 Need RCPT before BDAT")
                .await;
        }

        let Some(chunk) = self.read_exact(size).await? else {
            self.session.log.add(
                Transaction::new("BDAT").with_response("451 4.3.0 Chunk receipt interrupted"),
            );
            return Ok(Flow::Close);
        };
        self.bdat_active = true;
        self.session.extensions.chunking_used = true;
        self.session.current_envelope().data.extend_from_slice(&chunk);

        if let Some(limit) = self.runtime.config.size_limit {
            if self.session.current_envelope().data.len() as u64 > limit {
                self.reply_and_log(
                    "BDAT",
                    Some(format!("{size}{}", if last { " LAST" } else { "" })),
                    "552 5.3.4 Message size exceeds fixed limit",
                    false,
                )
                .await?;
                self.session.reset();
                self.bdat_active = false;
                self.state = SmtpState::Greeted;
                return Ok(Flow::Continue);
            }
        }

        let payload = format!("{size}{}", if last { " LAST" } else { "" });
        if !last {
            self.reply_and_log(
                "BDAT",
                Some(payload),
                &format!("250 2.0.0 Received {size} octets"),
                false,
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let canned = self.scenario.as_ref().and_then(|s| s.data.clone());
        let injected = canned.is_some();
        let reply = match canned {
            Some(canned) => render(&canned, self.session.magic()),
            None => "250 2.0.0 Message received".to_string(),
        };
        let accepted = reply.starts_with('2');
        self.reply_and_log("BDAT", Some(payload), &reply, injected)
            .await?;

        if accepted {
            self.finalize_envelope().await;
        } else {
            self.session.reset();
        }
        self.bdat_active = false;
        self.state = SmtpState::Greeted;
        Ok(Flow::Continue)
    }

    async fn cmd_rset(&mut self) -> anyhow::Result<Flow> {
        self.session.reset();
        self.bdat_active = false;
        if self.state != SmtpState::Connected {
            self.state = SmtpState::Greeted;
        }
        self.reply_and_log("RSET", None, "250 2.0.0 OK", false).await?;
        Ok(Flow::Continue)
    }

    /// After a message has been acknowledged: derive the message id,
    /// hand the bytes to the storage collaborator, then relay if the
    /// message or the configuration asks for it
    async fn finalize_envelope(&mut self) {
        let headers = {
            let envelope = self.session.current_envelope();
            match EmailParser::new(&envelope.data[..]).parse_headers_only() {
                Ok(headers) => headers,
                Err(err) => {
                    tracing::warn!("unable to parse message headers: {err:#}");
                    mailparsing::MimeHeaders::new()
                }
            }
        };
        self.session.current_envelope().message_id = headers
            .get_first("Message-ID")
            .map(|h| h.value().trim().trim_matches(&['<', '>'][..]).to_string());

        let uid = self.session.uid();
        let storage = self.runtime.storage.clone();
        let envelope = self
            .session
            .last_envelope()
            .cloned()
            .expect("finalize implies an open envelope");

        match storage.store(uid, &envelope, &headers).await {
            Ok(Some(path)) => self.session.current_envelope().file = Some(path),
            Ok(None) => {}
            Err(err) => tracing::warn!("storage failed for session {uid}: {err:#}"),
        }

        if let Some(target) = relay::relay_target(&self.runtime.config.relay, &headers) {
            let hostname = self.runtime.config.hostname.clone();
            if let Err(err) = relay::relay_message(&target, &hostname, &envelope).await {
                tracing::warn!("relay to {target} failed for session {uid}: {err:#}");
            }
        }

        self.session.reset();
    }

    // ==== socket primitives ====

    /// Pull more bytes into the read buffer, honoring the per-socket
    /// read timeout
    async fn fill_buffer(&mut self) -> anyhow::Result<Option<usize>> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(Some(0));
        };
        let mut chunk = [0u8; 4096];
        match timeout(self.runtime.config.read_timeout, socket.read(&mut chunk)).await {
            Ok(Ok(0)) => Ok(Some(0)),
            Ok(Ok(size)) => {
                self.read_buffer.extend_from_slice(&chunk[..size]);
                Ok(Some(size))
            }
            Ok(Err(err)) => Err(err).context("reading from peer"),
            Err(_) => Ok(None),
        }
    }

    /// The next raw line including its terminator; tolerates bare LF
    async fn next_line(&mut self) -> anyhow::Result<LineOutcome> {
        loop {
            if let Some(i) = memchr::memchr(b'\n', &self.read_buffer) {
                let line: Vec<u8> = self.read_buffer.drain(..=i).collect();
                return Ok(LineOutcome::Line(line));
            }
            match self.fill_buffer().await? {
                Some(0) => {
                    if self.read_buffer.is_empty() {
                        return Ok(LineOutcome::Eof);
                    }
                    let line = std::mem::take(&mut self.read_buffer);
                    return Ok(LineOutcome::Line(line));
                }
                Some(_) => {}
                None => return Ok(LineOutcome::TimedOut),
            }
        }
    }

    /// Exactly `needed` bytes for a BDAT chunk, or None if the peer
    /// went away first
    async fn read_exact(&mut self, needed: usize) -> anyhow::Result<Option<Vec<u8>>> {
        loop {
            if self.read_buffer.len() >= needed {
                let chunk: Vec<u8> = self.read_buffer.drain(..needed).collect();
                return Ok(Some(chunk));
            }
            match self.fill_buffer().await? {
                Some(0) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }
}

fn verb_of(line: &str) -> Option<String> {
    line.split_ascii_whitespace()
        .next()
        .map(|w| w.to_ascii_uppercase())
}
