use crate::{
    parse_response_line, AsyncReadAndWrite, BoxedAsyncReadAndWrite, Command, EnvelopeAddress,
    EsmtpParameter, Response, ResponseBuilder, SmtpClientTimeouts, TlsOptions, Transaction,
    TransactionLog,
};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("malformed response line: {0}")]
    MalformedResponseLine(String),
    #[error("response line is too long")]
    ResponseTooLong,
    #[error("not connected")]
    NotConnected,
    #[error("command rejected {0:?}")]
    Rejected(Response),
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("timed out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("timed out writing {command:?} after {duration:?}")]
    TimeOutRequest {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("error {error} reading response to {command:?}")]
    ReadError {
        command: Option<Command>,
        error: String,
    },
    #[error("error {error} writing {command:?}")]
    WriteError {
        command: Option<Command>,
        error: String,
    },
    #[error("STARTTLS handshake failed: {0}")]
    TlsHandshake(String),
}

/// One advertised EHLO keyword, e.g. `SIZE 1048576`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

/// Outbound SMTP dialog, used both by the relay step and by scripted
/// test cases. Every exchange is recorded in a `TransactionLog` so the
/// harness can assert on the dialog after the fact.
#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
    log: TransactionLog,
    enable_pipelining: bool,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    let hostname = if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    };

    hostname.strip_suffix('.').unwrap_or(hostname)
}

/// Double any line-leading dot in the message body, per RFC 5321 4.5.2.
/// Returns None when the data needs no stuffing.
pub fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    let needs_stuffing =
        data.starts_with(b".") || memchr::memmem::find(data, b"\n.").is_some();
    if !needs_stuffing {
        return None;
    }
    let mut stuffed = Vec::with_capacity(data.len() + 16);
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for idx in memchr::memmem::find_iter(data, b"\n.") {
        stuffed.extend_from_slice(&data[last_idx..=idx]);
        stuffed.push(b'.');
        last_idx = idx + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}

impl SmtpClient {
    pub async fn connect<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        timeouts: SmtpClientTimeouts,
    ) -> std::io::Result<Self> {
        let stream = timeout(timeouts.connect_timeout, TcpStream::connect(addr.clone()))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {}", addr.to_string()),
                )
            })??;
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream, addr.to_string(), timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        Self {
            socket: Some(Box::new(stream)),
            hostname: extract_hostname(peer_hostname.as_ref()).to_string(),
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
            log: TransactionLog::new(),
            enable_pipelining: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn set_enable_pipelining(&mut self, enable: bool) {
        self.enable_pipelining = enable;
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    pub fn capabilities(&self) -> &HashMap<String, EsmtpCapability> {
        &self.capabilities
    }

    pub fn transaction_log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn take_transaction_log(&mut self) -> TransactionLog {
        std::mem::take(&mut self.log)
    }

    fn record(&mut self, command: Option<&Command>, response: &Response) {
        let Some(command) = command else {
            self.log
                .add(Transaction::new("SMTP").with_response(response.to_single_line()));
            return;
        };
        // DATA is recorded once, with the reply to the terminating dot;
        // the 354 go-ahead is not a completed exchange
        if matches!(command, Command::Data) {
            return;
        }
        let mut txn = Transaction::new(command.verb())
            .with_payload(command.encode().trim_end().to_string())
            .with_response(response.to_single_line());
        if let Command::RcptTo { address, .. } = command {
            txn = txn.with_address(address.to_string());
        }
        self.log.add(txn);
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            if let Some(i) = memchr::memchr(b'\n', &self.read_buffer) {
                if too_long {
                    self.read_buffer.drain(0..=i);
                    return Err(ClientError::ResponseTooLong);
                }
                let mut line = self.read_buffer[0..i].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.read_buffer.drain(0..=i);
                return Ok(String::from_utf8(line)?);
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line; fill up the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ClientError::ReadError {
                            command: cmd.cloned(),
                            error: format!("{err:#}"),
                        });
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        });
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::ReadError {
                    command: cmd.cloned(),
                    error: "connection closed by peer".to_string(),
                });
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            if let Err(err) = sock.flush().await {
                self.socket.take();
                return Err(ClientError::WriteError {
                    command: command.cloned(),
                    error: format!("flush: {err:#}"),
                });
            }
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed =
            parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self.read_line(subsequent_line_timeout, command).await?;
            parsed = parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
            builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        let response = builder.build(command.map(|cmd| cmd.encode()));
        self.record(command, &response);
        Ok(response)
    }

    async fn write_with_timeout(
        &mut self,
        bytes: &[u8],
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<(), ClientError> {
        match self.socket.as_mut() {
            Some(socket) => match timeout(timeout_duration, socket.write_all(bytes)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    self.socket.take();
                    Err(ClientError::WriteError {
                        command: command.cloned(),
                        error: format!("{err:#}"),
                    })
                }
                Err(_) => {
                    self.socket.take();
                    Err(ClientError::TimeOutRequest {
                        command: command.cloned(),
                        duration: timeout_duration,
                    })
                }
            },
            None => Err(ClientError::NotConnected),
        }
    }

    async fn write_command_request(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {line}", self.hostname);
        let timeout_duration = command.client_timeout_request(&self.timeouts);
        self.write_with_timeout(line.as_bytes(), Some(command), timeout_duration)
            .await
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let timeout_duration = Command::Data.client_timeout_request(&self.timeouts);
        self.write_with_timeout(data, None, timeout_duration).await
    }

    /// Read the 220 greeting that the server sends on connect
    pub async fn read_banner(&mut self) -> Result<Response, ClientError> {
        let response = self.read_response(None, self.timeouts.banner_timeout).await?;
        if response.code != 220 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command_request(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Issue a series of commands and return the responses.
    ///
    /// When the server advertised PIPELINING the commands are written
    /// back to back before any response is read, saving round trips.
    /// A transport error partway through synthesizes failures for the
    /// remaining commands so the result is always commands.len() long.
    pub async fn pipeline_commands(
        &mut self,
        commands: Vec<Command>,
    ) -> Vec<Result<Response, ClientError>> {
        let mut results: Vec<Result<Response, ClientError>> = vec![];

        let pipeline = self.enable_pipelining && self.capabilities.contains_key("PIPELINING");
        if pipeline {
            let mut all = String::new();
            for cmd in &commands {
                all.push_str(&cmd.encode());
            }
            tracing::trace!("send->{}: (PIPELINE) {all}", self.hostname);
            let total_timeout: Duration = commands
                .iter()
                .map(|cmd| cmd.client_timeout_request(&self.timeouts))
                .sum();
            if let Err(err) = self
                .write_with_timeout(all.as_bytes(), commands.first(), total_timeout)
                .await
            {
                while results.len() < commands.len() {
                    results.push(Err(err.clone()));
                }
                return results;
            }

            for cmd in &commands {
                results.push(
                    self.read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                        .await,
                );
            }
            return results;
        }

        for cmd in &commands {
            if let Err(err) = self.write_command_request(cmd).await {
                while results.len() < commands.len() {
                    results.push(Err(err.clone()));
                }
                return results;
            }
            results.push(
                self.read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                    .await,
            );
        }
        results
    }

    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let response = self
            .send_command(&Command::Ehlo(ehlo_name.to_string()))
            .await?;
        self.ehlo_common(response)
    }

    pub async fn lhlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let response = self
            .send_command(&Command::Lhlo(ehlo_name.to_string()))
            .await?;
        self.ehlo_common(response)
    }

    fn ehlo_common(
        &mut self,
        response: Response,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();
        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param: fields.next().map(|s| s.to_string()),
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }
        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    pub async fn auth_plain(
        &mut self,
        username: &str,
        password: Option<&str>,
    ) -> Result<(), ClientError> {
        // RFC 4616: [authzid] NUL authcid NUL passwd
        let password = password.unwrap_or("");
        let payload = format!("\x00{username}\x00{password}");
        let payload = data_encoding::BASE64.encode(payload.as_bytes());

        let response = self
            .send_command(&Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: Some(payload),
            })
            .await?;

        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }
        Ok(())
    }

    /// Upgrade the connection via STARTTLS. The capability set is
    /// cleared; the peer must be re-greeted before the next mail
    /// transaction.
    pub async fn starttls(&mut self, options: TlsOptions) -> Result<(), ClientError> {
        let response = self.send_command(&Command::StartTls).await?;
        if response.code != 220 {
            return Err(ClientError::Rejected(response));
        }

        let connector = options.build_tls_connector();
        let server_name = ServerName::try_from(self.hostname.clone())
            .map_err(|_| ClientError::InvalidDnsName(self.hostname.clone()))?;

        let stream = self.socket.take().ok_or(ClientError::NotConnected)?;
        match connector.connect(server_name, stream).await {
            Ok(stream) => {
                self.socket.replace(Box::new(stream));
                self.capabilities.clear();
                Ok(())
            }
            Err(err) => Err(ClientError::TlsHandshake(format!("{err:#}"))),
        }
    }

    /// Run one complete mail transaction: MAIL FROM, RCPT TO for each
    /// recipient, DATA, dot-stuffed body, terminating dot. Commands are
    /// pipelined when the server allows it. Returns the reply to the
    /// terminating dot. At least one accepted recipient is required;
    /// otherwise the first recipient rejection is surfaced.
    pub async fn send_mail<B: AsRef<[u8]>>(
        &mut self,
        sender: EnvelopeAddress,
        recipients: &[EnvelopeAddress],
        data: B,
    ) -> Result<Response, ClientError> {
        let data: &[u8] = data.as_ref();
        let stuffed;
        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };

        let data_is_8bit = data.iter().any(|&b| b >= 0x80);
        let mut mail_params = vec![];
        if data_is_8bit && self.capabilities.contains_key("8BITMIME") {
            mail_params.push(EsmtpParameter {
                name: "BODY".to_string(),
                value: Some("8BITMIME".to_string()),
            });
        }

        let mut commands = vec![Command::MailFrom {
            address: sender,
            parameters: mail_params,
        }];
        for recipient in recipients {
            commands.push(Command::RcptTo {
                address: recipient.clone(),
                parameters: vec![],
            });
        }
        commands.push(Command::Data);

        let mut responses = self.pipeline_commands(commands).await;

        let mail_resp = responses.remove(0)?;
        if mail_resp.code != 250 {
            return Err(ClientError::Rejected(mail_resp));
        }

        let mut accepted = 0usize;
        let mut first_rejection = None;
        for _ in recipients {
            let rcpt_resp = responses.remove(0)?;
            if rcpt_resp.code == 250 {
                accepted += 1;
            } else if first_rejection.is_none() {
                first_rejection = Some(rcpt_resp);
            }
        }

        let data_resp = responses.remove(0)?;

        if data_resp.code == 354 && accepted == 0 {
            // RFC 2920 3.1: the server may still accept DATA after
            // rejecting every recipient; send a lone dot to close out
            // the transaction, then surface the recipient failure
            self.write_data(b".\r\n").await?;
            let data_dot = Command::DataDot;
            let _ = self
                .read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
                .await?;
            return Err(ClientError::Rejected(
                first_rejection.expect("no recipients were accepted"),
            ));
        }
        if accepted == 0 {
            return Err(ClientError::Rejected(
                first_rejection.expect("no recipients were accepted"),
            ));
        }
        if data_resp.code != 354 {
            return Err(ClientError::Rejected(data_resp));
        }

        tracing::trace!("message data is {} bytes", data.len());
        self.write_data(data).await?;

        let needs_newline = data.last().map(|&b| b != b'\n').unwrap_or(true);
        let marker = if needs_newline { "\r\n.\r\n" } else { ".\r\n" };
        self.write_data(marker.as_bytes()).await?;

        let data_dot = Command::DataDot;
        let response = self
            .read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    pub async fn quit(&mut self) -> Result<Response, ClientError> {
        let response = self.send_command(&Command::Quit).await?;
        self.socket.take();
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn hostname_extraction() {
        assert_equal!(extract_hostname("example.com"), "example.com");
        assert_equal!(extract_hostname("example.com:25"), "example.com");
        assert_equal!(extract_hostname("example.com."), "example.com");
        assert_equal!(extract_hostname("[10.0.0.1]:25"), "10.0.0.1");
    }

    #[test]
    fn dot_stuffing() {
        assert_equal!(apply_dot_stuffing(b"hello\r\nworld\r\n"), None);
        assert_equal!(
            apply_dot_stuffing(b".hello\r\n").unwrap(),
            b"..hello\r\n".to_vec()
        );
        assert_equal!(
            apply_dot_stuffing(b"a\r\n.b\r\n.\r\nc\r\n").unwrap(),
            b"a\r\n..b\r\n..\r\nc\r\n".to_vec()
        );
    }
}
