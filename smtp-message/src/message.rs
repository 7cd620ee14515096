use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A single header, keyed case-insensitively but displayed with whatever
/// casing it arrived in (or was given at construction time).
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// An ordered collection of headers with case-insensitive lookup.
///
/// Headers are stored in insertion order so that reserialization preserves
/// the original layout; lookups ignore case, as RFC 5322 header names are
/// case-insensitive, but the original casing is kept for display.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct HeaderMap(Vec<HeaderField>);

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(HeaderField {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    FailedRetry,
}

/// In-memory representation of an accepted message, from acceptance at the
/// ingress all the way through queueing and forwarding.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Message {
    pub id: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("header {0:?} contains a bare CR or LF")]
    MalformedHeader(String),
}

impl Message {
    /// Builds a `Message` from an already-validated envelope and the raw
    /// `DATA` bytes (after dot-unstuffing). Never fails: a DATA block that
    /// can't be meaningfully parsed still yields a message with a
    /// best-effort, lossily-decoded body and whatever headers could be
    /// split out of it.
    pub fn parse(from_addr: &str, to_addrs: &[String], data: &[u8]) -> Message {
        let (header_bytes, body_start) = split_headers(data);
        let headers = parse_headers(header_bytes);
        let body = extract_body(data, body_start);
        Message {
            id: Uuid::new_v4().to_string(),
            from_addr: from_addr.to_owned(),
            to_addrs: to_addrs.to_vec(),
            headers,
            body,
            created_at: Utc::now(),
            retry_count: 0,
            last_retry_at: None,
            status: MessageStatus::Pending,
        }
    }

    /// Produces RFC 5322 bytes suitable for the `DATA` phase of an egress
    /// send: original headers are kept as-is (except `Content-Type` and
    /// `Content-Transfer-Encoding`, which no longer describe `body` once
    /// it's been decoded down to a single representation), and `From`,
    /// `To`, `Date` and `Message-ID` are filled in if missing.
    pub fn serialize(&self) -> Result<Vec<u8>, MessageError> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        let mut saw_from = false;
        let mut saw_to = false;
        let mut saw_date = false;
        let mut saw_message_id = false;

        for h in self.headers.iter() {
            let lower = h.name.to_ascii_lowercase();
            if lower == "content-type" || lower == "content-transfer-encoding" {
                continue;
            }
            if h.value.contains('\r') || h.value.contains('\n') {
                return Err(MessageError::MalformedHeader(h.name.clone()));
            }
            match lower.as_str() {
                "from" => saw_from = true,
                "to" => saw_to = true,
                "date" => saw_date = true,
                "message-id" => saw_message_id = true,
                _ => {}
            }
            out.extend_from_slice(h.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(h.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if !saw_from {
            out.extend_from_slice(format!("From: {}\r\n", self.from_addr).as_bytes());
        }
        if !saw_to {
            out.extend_from_slice(format!("To: {}\r\n", self.to_addrs.join(", ")).as_bytes());
        }
        if !saw_date {
            out.extend_from_slice(format!("Date: {}\r\n", Utc::now().to_rfc2822()).as_bytes());
        }
        if !saw_message_id {
            out.extend_from_slice(
                format!("Message-ID: <{}@smtp-relay>\r\n", Uuid::new_v4()).as_bytes(),
            );
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

fn find_subslice(data: &[u8], needle: &[u8]) -> Option<usize> {
    data.windows(needle.len()).position(|w| w == needle)
}

/// Splits `data` into the header block and the offset at which the body
/// starts, tolerating both CRLF and bare-LF line endings.
fn split_headers(data: &[u8]) -> (&[u8], usize) {
    if let Some(pos) = find_subslice(data, b"\r\n\r\n") {
        (&data[..pos], pos + 4)
    } else if let Some(pos) = find_subslice(data, b"\n\n") {
        (&data[..pos], pos + 2)
    } else {
        (data, data.len())
    }
}

fn parse_headers(raw: &[u8]) -> HeaderMap {
    let text = String::from_utf8_lossy(raw);
    let mut out = HeaderMap::new();
    let mut pending: Option<(String, String)> = None;
    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = pending.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = pending.take() {
            out.push(name, value);
        }
        if line.is_empty() {
            continue;
        }
        if let Some(idx) = line.find(':') {
            let name = line[..idx].trim().to_string();
            let value = line[idx + 1..].trim().to_string();
            pending = Some((name, value));
        }
    }
    if let Some((name, value)) = pending {
        out.push(name, value);
    }
    out
}

/// Picks the body representation per §4.A: the first `text/plain` part of a
/// multipart message, else the first `text/html`, else the single-part
/// decoded payload; unparseable DATA falls back to the raw bytes after the
/// header separator.
fn extract_body(data: &[u8], body_start: usize) -> Vec<u8> {
    if let Some(parsed) = mail_parser::MessageParser::default().parse(data) {
        if let Some(text) = parsed.body_text(0) {
            return text.into_owned().into_bytes();
        }
        if let Some(html) = parsed.body_html(0) {
            return html.into_owned().into_bytes();
        }
    }
    data.get(body_start..).unwrap_or(&[]).to_vec()
}
