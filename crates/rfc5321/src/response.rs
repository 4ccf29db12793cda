use serde::{Deserialize, Serialize};

/// A complete SMTP reply, possibly assembled from multiple
/// `NNN-`-continued lines
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Collapse a (possibly multi-line) reply to one line, the way it
    /// is recorded in a transaction log
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);
        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }
        line.push_str(&flatten_line_breaks(&self.content));
        line
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next()?;

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

/// Replace any CR, LF or CRLF in `data` with a single space
pub fn flatten_line_breaks(data: &str) -> String {
    let bytes = data.as_bytes();
    let mut flattened = Vec::with_capacity(bytes.len());
    let mut last_idx = 0;

    for i in memchr::memchr2_iter(b'\r', b'\n', bytes) {
        match bytes[i] {
            b'\r' => {
                flattened.extend_from_slice(&bytes[last_idx..i]);
                if bytes.get(i + 1).copied() != Some(b'\n') {
                    flattened.push(b' ');
                }
            }
            b'\n' => {
                flattened.extend_from_slice(&bytes[last_idx..i]);
                flattened.push(b' ');
            }
            _ => unreachable!(),
        }
        last_idx = i + 1;
    }
    flattened.extend_from_slice(&bytes[last_idx..]);

    // Only ASCII whitespace was touched, so the result is valid utf8
    String::from_utf8(flattened).expect("whitespace substitution preserves utf8")
}

/// One wire line of a reply: `NNN-text` or `NNN text`
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl ResponseLine<'_> {
    fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

pub fn parse_response_line(line: &str) -> Result<ResponseLine, String> {
    if line.len() < 4 {
        return Err(line.to_string());
    }
    match line.as_bytes()[3] {
        sep @ (b' ' | b'-') => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: sep == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(line.to_string()),
        },
        _ => Err(line.to_string()),
    }
}

pub struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };
        Self {
            code: parsed.code,
            enhanced_code,
            content,
        }
    }

    /// Continuation lines must repeat the code of the first line
    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.to_original_line());
        }
        self.content.push('\n');

        let mut content = parsed.content;
        if let Some(enh) = &self.enhanced_code {
            let prefix = format!("{}.{}.{} ", enh.class, enh.subject, enh.detail);
            if let Some(remainder) = parsed.content.strip_prefix(&prefix) {
                content = remainder;
            }
        }
        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            enhanced_code: self.enhanced_code,
            content: self.content,
            command,
        }
    }
}
