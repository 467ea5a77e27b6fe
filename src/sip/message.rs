//! Minimal SIP/UDP message model: just enough request/response framing to
//! drive REGISTER, INVITE, ACK, BYE and their responses over a raw socket.
//! Not a general-purpose SIP stack — no dialog-forking, no proxies, no TCP.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SipParseError {
    #[error("empty datagram")]
    Empty,
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Status { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl SipMessage {
    pub fn parse(datagram: &str) -> Result<Self, SipParseError> {
        let mut lines = datagram.split("\r\n");
        let start = lines.next().ok_or(SipParseError::Empty)?;
        let start_line = parse_start_line(start)?;

        let mut headers = BTreeMap::new();
        let mut body_lines = Vec::new();
        let mut in_body = false;
        for line in lines {
            if in_body {
                body_lines.push(line);
                continue;
            }
            if line.is_empty() {
                in_body = true;
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| SipParseError::MalformedHeader(line.to_string()))?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            start_line,
            headers,
            body: body_lines.join("\r\n"),
        })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Status { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Status { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call-id")
    }

    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        match &self.start_line {
            StartLine::Request { method, uri } => {
                let _ = writeln!(out, "{method} {uri} SIP/2.0\r");
            }
            StartLine::Status { code, reason } => {
                let _ = writeln!(out, "SIP/2.0 {code} {reason}\r");
            }
        }
        for (name, value) in &self.headers {
            let _ = writeln!(out, "{}: {value}\r", title_case(name));
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

fn title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn parse_start_line(line: &str) -> Result<StartLine, SipParseError> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| SipParseError::MalformedStartLine(line.to_string()))?;
        let reason = parts.next().unwrap_or("").to_string();
        return Ok(StartLine::Status { code, reason });
    }
    let mut parts = line.split(' ');
    let method = parts
        .next()
        .ok_or_else(|| SipParseError::MalformedStartLine(line.to_string()))?
        .to_string();
    let uri = parts
        .next()
        .ok_or_else(|| SipParseError::MalformedStartLine(line.to_string()))?
        .to_string();
    Ok(StartLine::Request { method, uri })
}

/// Extract the IP portion from a `Via` or source-address style header value.
pub fn extract_host(uri_or_addr: &str) -> Option<String> {
    let after_scheme = uri_or_addr.splitn(2, ':').nth(1).unwrap_or(uri_or_addr);
    let host_port = after_scheme.split('@').last().unwrap_or(after_scheme);
    let host = host_port.split([';', '>', ':']).next().unwrap_or(host_port);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
