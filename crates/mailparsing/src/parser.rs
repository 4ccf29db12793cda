use crate::{LineReader, MailParsingError, MimeHeader, MimeHeaders, Result};
use data_encoding::BASE64;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use std::io::Read;

/// data_encoding::BASE64_MIME, despite its name, is not RFC 2045
/// tolerant: it will not ignore interior whitespace. Define our own.
const BASE64_RFC2045: data_encoding::Encoding = data_encoding_macro::new_encoding! {
    symbols: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/",
    padding: '=',
    ignore: " \r\n\t",
    wrap_width: 76,
    wrap_separator: "\r\n",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Text,
    File,
}

/// One decoded body leaf with its digests
#[derive(Debug, Clone)]
pub struct MimePart {
    headers: MimeHeaders,
    kind: PartKind,
    bytes: Vec<u8>,
    md5: String,
    sha1: String,
    sha256: String,
    filename: String,
    explicitly_named: bool,
}

impl MimePart {
    fn build(headers: MimeHeaders, kind: PartKind, bytes: Vec<u8>) -> Self {
        let md5 = BASE64.encode(Md5::digest(&bytes).as_slice());
        let sha1 = BASE64.encode(Sha1::digest(&bytes).as_slice());
        let sha256 = BASE64.encode(Sha256::digest(&bytes).as_slice());
        Self {
            headers,
            kind,
            bytes,
            md5,
            sha1,
            sha256,
            filename: String::new(),
            explicitly_named: false,
        }
    }

    pub fn headers(&self) -> &MimeHeaders {
        &self.headers
    }

    pub fn kind(&self) -> PartKind {
        self.kind
    }

    /// The transfer-decoded bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Base64 encoded MD5 digest of the decoded bytes
    pub fn md5(&self) -> &str {
        &self.md5
    }

    /// Base64 encoded SHA-1 digest of the decoded bytes
    pub fn sha1(&self) -> &str {
        &self.sha1
    }

    /// Base64 encoded SHA-256 digest of the decoded bytes
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }
}

/// The outcome of a full parse: the top-level header block plus the
/// flattened list of body leaves
#[derive(Debug)]
pub struct ParsedEmail {
    headers: MimeHeaders,
    parts: Vec<MimePart>,
}

impl ParsedEmail {
    pub fn headers(&self) -> &MimeHeaders {
        &self.headers
    }

    pub fn parts(&self) -> &[MimePart] {
        &self.parts
    }
}

/// Streaming parser for an RFC 822 message: top-level headers, then a
/// recursive boundary descent over the body. Nested multiparts
/// contribute their children rather than themselves, and message/rfc822
/// parts are re-entered so the final part list is flat.
pub struct EmailParser<R> {
    stream: LineReader<R>,
    headers: MimeHeaders,
    parts: Vec<MimePart>,
}

impl<R: Read> EmailParser<R> {
    pub fn new(input: R) -> Self {
        Self {
            stream: LineReader::new(input),
            headers: MimeHeaders::new(),
            parts: Vec::new(),
        }
    }

    /// Parse only the header block, leaving the body unread.
    /// The storage rename pass uses this to avoid decoding bodies twice.
    pub fn parse_headers_only(mut self) -> Result<MimeHeaders> {
        let headers = self.read_header_block()?;
        Ok(headers)
    }

    pub fn parse(mut self) -> Result<ParsedEmail> {
        self.headers = self.read_header_block()?;

        match self.headers.get_first("Content-Type").cloned() {
            None => {
                // No Content-Type at all: the whole body is one
                // implicit text part
                let bytes = self.stream.read_to_end()?;
                let part = MimePart::build(MimeHeaders::new(), PartKind::Text, bytes);
                self.push_flattened(part);
            }
            Some(content_type) => {
                let value = content_type.clean_value().to_ascii_lowercase();
                if value.starts_with("multipart/") {
                    let boundary = content_type
                        .parameter("boundary")
                        .ok_or(MailParsingError::MissingBoundary)?;
                    self.parse_parts(&boundary)?;
                } else {
                    let raw = self.stream.read_to_end()?;
                    let part_headers = self.headers.content_headers();
                    let part = build_leaf(&part_headers, &value, raw);
                    self.push_flattened(part);
                }
            }
        }

        Ok(ParsedEmail {
            headers: self.headers,
            parts: self.parts,
        })
    }

    /// Accumulate header lines until the blank separator line,
    /// joining folded continuations onto their parent line
    fn read_header_block(&mut self) -> Result<MimeHeaders> {
        let mut headers = MimeHeaders::new();
        let mut pending = String::new();

        while let Some(line) = self.stream.read_line()? {
            let starts_folded = matches!(line.first(), Some(&b' ') | Some(&b'\t'));
            let text = String::from_utf8_lossy(&line).to_string();

            if !starts_folded && !pending.is_empty() {
                flush_header(&mut headers, &mut pending);
            }
            if text.trim().is_empty() {
                break;
            }
            pending.push_str(&text);
        }
        if !pending.is_empty() {
            flush_header(&mut headers, &mut pending);
        }
        Ok(headers)
    }

    /// Walk the body of a multipart at `boundary`, parsing one part per
    /// boundary marker, until the terminating `--boundary--`
    fn parse_parts(&mut self, boundary: &str) -> Result<()> {
        let marker = format!("--{boundary}");
        let terminator = format!("--{boundary}--");

        // skip the preamble up to the first boundary
        loop {
            let Some(line) = self.stream.read_line()? else {
                return Ok(());
            };
            let text = String::from_utf8_lossy(&line);
            if text.contains(&terminator) {
                return Ok(());
            }
            if text.contains(&marker) {
                break;
            }
        }

        loop {
            let part_headers = self.read_header_block()?;
            self.consume_part(part_headers, boundary)?;

            // consume_part pushed the boundary line that ended the part
            // back into the stream
            let Some(line) = self.stream.read_line()? else {
                break;
            };
            let text = String::from_utf8_lossy(&line);
            if text.contains(&terminator) || !text.contains(&marker) {
                break;
            }
        }
        Ok(())
    }

    /// Parse the body of one part whose headers have been read.
    /// On return the parent boundary line that ended this part has been
    /// pushed back for the caller to re-read.
    fn consume_part(&mut self, part_headers: MimeHeaders, parent_boundary: &str) -> Result<()> {
        let content_type = part_headers.get_first("Content-Type").cloned();
        let value = content_type
            .as_ref()
            .map(|ct| ct.clean_value().to_ascii_lowercase())
            .unwrap_or_else(|| "text/plain".to_string());

        if value.starts_with("multipart/") {
            let child_boundary = content_type
                .as_ref()
                .and_then(|ct| ct.parameter("boundary"))
                .ok_or(MailParsingError::MissingBoundary)?;
            self.parse_parts(&child_boundary)?;
            // discard any epilogue up to the parent boundary
            self.read_part_content(parent_boundary)?;
            return Ok(());
        }

        let raw = self.read_part_content(parent_boundary)?;
        let decoded = decode_content(&part_headers, raw);

        if value.starts_with("message/rfc822") {
            // Re-enter the encapsulated message and flatten its leaves
            // into our list; the wrapper itself is not a leaf
            let inner = EmailParser::new(std::io::Cursor::new(decoded)).parse()?;
            for part in inner.parts {
                self.push_flattened(part);
            }
            return Ok(());
        }

        let kind = if value.starts_with("text/") || value.starts_with("message/") {
            PartKind::Text
        } else {
            PartKind::File
        };
        let part = assign_name(MimePart::build(part_headers, kind, decoded));
        self.push_flattened(part);
        Ok(())
    }

    /// Collect raw content lines until the parent boundary shows up.
    /// The boundary line is pushed back so the caller can decide
    /// whether it terminates the whole multipart. A missing terminator
    /// simply consumes to EOF.
    fn read_part_content(&mut self, boundary: &str) -> Result<Vec<u8>> {
        let marker = format!("--{boundary}");
        let mut content = Vec::new();
        while let Some(line) = self.stream.read_line()? {
            let text = String::from_utf8_lossy(&line);
            if text.contains(&marker) {
                self.stream.unread(&line);
                break;
            }
            content.extend_from_slice(&line);
        }
        Ok(content)
    }

    /// Parts keep an explicitly declared filename; parts without one
    /// are named by their index in the flattened list
    fn push_flattened(&mut self, mut part: MimePart) {
        if !part.explicitly_named {
            part.filename = synthesize_filename(&part.headers, self.parts.len());
        }
        self.parts.push(part);
    }
}

fn flush_header(headers: &mut MimeHeaders, pending: &mut String) {
    match MimeHeader::parse(pending) {
        Ok(header) => headers.push(header),
        Err(err) => tracing::warn!("skipping malformed header: {err:#}"),
    }
    pending.clear();
}

fn build_leaf(part_headers: &MimeHeaders, clean_type: &str, raw: Vec<u8>) -> MimePart {
    let decoded = decode_content(part_headers, raw);
    let kind = if clean_type.starts_with("text/") || clean_type.starts_with("message/") {
        PartKind::Text
    } else {
        PartKind::File
    };
    assign_name(MimePart::build(part_headers.clone(), kind, decoded))
}

/// Apply the declared Content-Transfer-Encoding. Base64 tolerates
/// interior whitespace; quoted-printable runs in robust mode. A decode
/// failure logs a warning and falls back to the raw bytes so one bad
/// part cannot poison the rest of the message.
fn decode_content(headers: &MimeHeaders, raw: Vec<u8>) -> Vec<u8> {
    let encoding = headers
        .get_first("Content-Transfer-Encoding")
        .map(|h| h.clean_value().to_ascii_lowercase());

    match encoding.as_deref() {
        Some("base64") => match BASE64_RFC2045.decode(&raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!("base64 decode failed, keeping raw bytes: {err:#}");
                raw
            }
        },
        Some("quoted-printable") => {
            match quoted_printable::decode(&raw, quoted_printable::ParseMode::Robust) {
                Ok(decoded) => decoded,
                Err(err) => {
                    tracing::warn!("quoted-printable decode failed, keeping raw bytes: {err:#}");
                    raw
                }
            }
        }
        _ => raw,
    }
}

/// A part named by its own headers keeps that name
fn assign_name(mut part: MimePart) -> MimePart {
    let disposition_name = part
        .headers
        .get_first("Content-Disposition")
        .and_then(|h| h.parameter("filename"));
    let content_type_name = part
        .headers
        .get_first("Content-Type")
        .and_then(|h| h.parameter("name"));
    if let Some(name) = disposition_name.or(content_type_name) {
        part.filename = name;
        part.explicitly_named = true;
    }
    part
}

fn synthesize_filename(headers: &MimeHeaders, index: usize) -> String {
    let clean_type = headers
        .get_first("Content-Type")
        .map(|h| h.clean_value().to_ascii_lowercase())
        .unwrap_or_else(|| "text/plain".to_string());

    if clean_type == "text/html" {
        format!("part.{index}.html")
    } else if clean_type == "text/plain" {
        format!("part.{index}.txt")
    } else if clean_type == "text/calendar" {
        format!("part.{index}.cal")
    } else if clean_type.starts_with("image/") {
        format!("part.{index}.img")
    } else if clean_type.starts_with("message/") {
        format!("rfc822.{index}.eml")
    } else {
        format!("part.{index}.dat")
    }
}
