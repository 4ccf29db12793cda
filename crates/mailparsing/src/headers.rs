use crate::{MailParsingError, Result};

/// One header with its folded continuation lines joined back together.
/// `value` is canonicalized: whitespace after the colon is trimmed and
/// each continuation collapses to a single joining space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeHeader {
    name: String,
    value: String,
}

impl MimeHeader {
    /// Parse an accumulated header block: the first line plus any
    /// continuation lines that began with whitespace
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.split('\n');
        let first = lines.next().unwrap_or("").trim_end_matches('\r');

        let colon = first
            .find(':')
            .ok_or_else(|| MailParsingError::HeaderParse(format!("missing colon in {raw:?}")))?;
        let name = first[..colon].trim().to_string();
        if name.is_empty() {
            return Err(MailParsingError::HeaderParse(format!(
                "empty header name in {raw:?}"
            )));
        }

        let mut value = first[colon + 1..].trim_start().to_string();
        for continuation in lines {
            let continuation = continuation.trim_end_matches('\r');
            if continuation.trim().is_empty() {
                continue;
            }
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(continuation.trim_start());
        }
        value = value.trim_end().to_string();

        Ok(Self { name, value })
    }

    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The primary value: everything before the first `;`, trimmed.
    /// `Content-Type: text/plain; charset=utf-8` -> `text/plain`
    pub fn clean_value(&self) -> &str {
        self.value.split(';').next().unwrap_or("").trim()
    }

    /// Extract a `key=value` parameter from the portion after the
    /// primary value, tolerating quotes and ignoring malformed entries
    pub fn parameter(&self, key: &str) -> Option<String> {
        for segment in self.value.split(';').skip(1) {
            let mut fields = segment.splitn(2, '=');
            let name = fields.next()?.trim();
            let Some(value) = fields.next() else {
                continue;
            };
            if name.eq_ignore_ascii_case(key) {
                let value = value.trim().trim_matches('"');
                return Some(value.to_string());
            }
        }
        None
    }
}

/// Ordered collection of headers with case-insensitive lookup.
/// Duplicate names are preserved in wire order.
#[derive(Debug, Clone, Default)]
pub struct MimeHeaders {
    headers: Vec<MimeHeader>,
}

impl MimeHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: MimeHeader) {
        self.headers.push(header);
    }

    pub fn get_first<'a>(&'a self, name: &str) -> Option<&'a MimeHeader> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn iter_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MimeHeader> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MimeHeader> {
        self.headers.iter()
    }

    /// The `content-*` subset that belongs to an individual part
    pub fn content_headers(&self) -> MimeHeaders {
        MimeHeaders {
            headers: self
                .headers
                .iter()
                .filter(|h| h.name.len() >= 8 && h.name[..8].eq_ignore_ascii_case("content-"))
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}
