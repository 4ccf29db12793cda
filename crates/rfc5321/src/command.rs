/// The address portion of a MAIL FROM or RCPT TO command.
/// The null sender `<>` is legal for MAIL FROM only; the caller
/// decides whether to permit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeAddress {
    Null,
    Mailbox { local: String, domain: String },
}

impl EnvelopeAddress {
    pub fn parse(text: &str) -> Result<Self, String> {
        if text.is_empty() {
            return Ok(Self::Null);
        }
        let fields: Vec<&str> = text.split('@').collect();
        if fields.len() != 2 || fields[0].is_empty() || fields[1].is_empty() {
            return Err(format!("expected local@domain, got {text:?}"));
        }
        Ok(Self::Mailbox {
            local: fields[0].to_string(),
            domain: fields[1].to_string(),
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn local(&self) -> Option<&str> {
        match self {
            Self::Null => None,
            Self::Mailbox { local, .. } => Some(local),
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::Null => None,
            Self::Mailbox { domain, .. } => Some(domain),
        }
    }
}

impl std::fmt::Display for EnvelopeAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Mailbox { local, domain } => write!(fmt, "{local}@{domain}"),
        }
    }
}

impl TryFrom<&str> for EnvelopeAddress {
    type Error = String;
    fn try_from(text: &str) -> Result<Self, String> {
        Self::parse(text)
    }
}

/// An ESMTP keyword parameter such as `BODY=8BITMIME` or `SIZE=12345`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl std::fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={}", self.name, value),
            None => write!(fmt, "{}", self.name),
        }
    }
}

fn parse_esmtp_parameters(text: &str) -> Vec<EsmtpParameter> {
    text.split_ascii_whitespace()
        .map(|param| {
            let mut fields = param.splitn(2, '=');
            let name = fields.next().unwrap_or("").to_string();
            let value = fields.next().map(|v| v.to_string());
            EsmtpParameter { name, value }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Lhlo(String),
    MailFrom {
        address: EnvelopeAddress,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: EnvelopeAddress,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    DataDot,
    Bdat {
        size: usize,
        last: bool,
    },
    Rset,
    Noop(Option<String>),
    Quit,
    StartTls,
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// Anything we didn't recognize; the raw line is preserved so that
    /// the server side can log it and reply with a syntax error
    Unknown(String),
}

fn prefix_match(line: &str, candidate: &str) -> bool {
    line.len() >= candidate.len() && line[..candidate.len()].eq_ignore_ascii_case(candidate)
}

/// Split `<address> [parameters]` off a MAIL FROM / RCPT TO argument.
/// Angle brackets are required; anything after the closing `>` is the
/// ESMTP parameter text.
fn extract_envelope(text: &str) -> Result<(&str, &str), String> {
    let text = text.trim_start();
    if !text.starts_with('<') {
        return Err(format!("expected <address>, got {text:?}"));
    }
    let close = text
        .bytes()
        .position(|c| c == b'>')
        .ok_or_else(|| format!("expected >: {text:?}"))?;
    Ok((&text[1..close], &text[close + 1..]))
}

impl Command {
    /// Parse a command line as received from the peer, without the
    /// trailing CRLF. Unrecognized verbs come back as `Unknown`;
    /// `Err` means the verb was recognized but its argument was not.
    pub fn parse(line: &str) -> Result<Self, String> {
        if line.eq_ignore_ascii_case("QUIT") {
            return Ok(Self::Quit);
        }
        if line.eq_ignore_ascii_case("DATA") {
            return Ok(Self::Data);
        }
        if line.eq_ignore_ascii_case("RSET") {
            return Ok(Self::Rset);
        }
        if line.eq_ignore_ascii_case("STARTTLS") {
            return Ok(Self::StartTls);
        }
        if line.eq_ignore_ascii_case("NOOP") {
            return Ok(Self::Noop(None));
        }
        if prefix_match(line, "NOOP ") {
            return Ok(Self::Noop(Some(line[5..].trim().to_string())));
        }
        if prefix_match(line, "HELO ") {
            return Ok(Self::Helo(line[5..].trim().to_string()));
        }
        if prefix_match(line, "EHLO ") {
            return Ok(Self::Ehlo(line[5..].trim().to_string()));
        }
        if prefix_match(line, "LHLO ") {
            return Ok(Self::Lhlo(line[5..].trim().to_string()));
        }
        if prefix_match(line, "MAIL FROM:") {
            let (address, params) = extract_envelope(&line[10..])?;
            return Ok(Self::MailFrom {
                address: EnvelopeAddress::parse(address)?,
                parameters: parse_esmtp_parameters(params),
            });
        }
        if prefix_match(line, "RCPT TO:") {
            let (address, params) = extract_envelope(&line[8..])?;
            let address = EnvelopeAddress::parse(address)?;
            if address.is_null() {
                return Err("null sender not permitted as a recipient".to_string());
            }
            return Ok(Self::RcptTo {
                address,
                parameters: parse_esmtp_parameters(params),
            });
        }
        if prefix_match(line, "BDAT ") {
            let mut fields = line[5..].split_ascii_whitespace();
            let size: usize = fields
                .next()
                .ok_or_else(|| "BDAT requires a chunk size".to_string())?
                .parse()
                .map_err(|_| format!("invalid BDAT chunk size in {line:?}"))?;
            let last = match fields.next() {
                None => false,
                Some(word) if word.eq_ignore_ascii_case("LAST") => true,
                Some(word) => return Err(format!("unexpected BDAT argument {word:?}")),
            };
            return Ok(Self::Bdat { size, last });
        }
        if prefix_match(line, "AUTH ") {
            let mut fields = line[5..].split_ascii_whitespace();
            let mechanism = fields
                .next()
                .ok_or_else(|| "AUTH requires a mechanism".to_string())?
                .to_ascii_uppercase();
            let initial_response = fields.next().map(|s| s.to_string());
            return Ok(Self::Auth {
                mechanism,
                initial_response,
            });
        }
        Ok(Self::Unknown(line.to_string()))
    }

    /// The wire form of this command, CRLF included
    pub fn encode(&self) -> String {
        fn encode_params(parameters: &[EsmtpParameter]) -> String {
            let mut params = String::new();
            for p in parameters {
                params.push(' ');
                params.push_str(&p.to_string());
            }
            params
        }

        match self {
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Lhlo(domain) => format!("LHLO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => format!("MAIL FROM:<{address}>{}\r\n", encode_params(parameters)),
            Self::RcptTo {
                address,
                parameters,
            } => format!("RCPT TO:<{address}>{}\r\n", encode_params(parameters)),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Bdat { size, last: false } => format!("BDAT {size}\r\n"),
            Self::Bdat { size, last: true } => format!("BDAT {size} LAST\r\n"),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Noop(None) => "NOOP\r\n".to_string(),
            Self::Noop(Some(param)) => format!("NOOP {param}\r\n"),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Auth {
                mechanism,
                initial_response: None,
            } => format!("AUTH {mechanism}\r\n"),
            Self::Auth {
                mechanism,
                initial_response: Some(resp),
            } => format!("AUTH {mechanism} {resp}\r\n"),
            Self::Unknown(line) => format!("{line}\r\n"),
        }
    }

    /// The verb under which a transaction log entry is recorded
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Helo(_) => "HELO",
            Self::Ehlo(_) => "EHLO",
            Self::Lhlo(_) => "LHLO",
            Self::MailFrom { .. } => "MAIL",
            Self::RcptTo { .. } => "RCPT",
            Self::Data | Self::DataDot => "DATA",
            Self::Bdat { .. } => "BDAT",
            Self::Rset => "RSET",
            Self::Noop(_) => "NOOP",
            Self::Quit => "QUIT",
            Self::StartTls => "STARTTLS",
            Self::Auth { .. } => "AUTH",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}
