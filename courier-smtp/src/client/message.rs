//! MIME message assembly for HTML mail.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use rand::RngCore;

use super::error::{ClientError, Result};

/// Base64 line length from RFC 2045.
const LINE_LENGTH: usize = 76;

/// Builder for an HTML message with an optional plain-text alternative.
///
/// ```no_run
/// use courier_smtp::client::MessageBuilder;
///
/// let message = MessageBuilder::new()
///     .from("bot@example.com", Some("Daily Lessons"))
///     .to("learner@example.com")
///     .subject("Your lesson is ready")
///     .html("<p>Hello</p>")
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<(String, Option<String>)>,
    to: Vec<String>,
    subject: Option<String>,
    headers: Vec<(String, String)>,
    html: Option<String>,
    text: Option<String>,
    date: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the From header, with an optional display name.
    #[must_use]
    pub fn from(mut self, email: impl Into<String>, name: Option<&str>) -> Self {
        self.from = Some((email.into(), name.map(str::to_string)));
        self
    }

    #[must_use]
    pub fn to(mut self, email: impl Into<String>) -> Self {
        self.to.push(email.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Adds a custom header. Headers are written in the order they are added.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn html(mut self, content: impl Into<String>) -> Self {
        self.html = Some(content.into());
        self
    }

    /// Adds a plain-text alternative, turning the message into
    /// `multipart/alternative`.
    #[must_use]
    pub fn text(mut self, content: impl Into<String>) -> Self {
        self.text = Some(content.into());
        self
    }

    /// Overrides the Date header, which otherwise uses the current time.
    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Renders the message as it goes after `DATA`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::BuilderError`] if there is no sender, no
    /// recipient or no body, or a header value contains a line break.
    pub fn build(self) -> Result<String> {
        let (from, from_name) = self
            .from
            .ok_or_else(|| ClientError::BuilderError("missing sender".to_string()))?;
        if self.to.is_empty() {
            return Err(ClientError::BuilderError("missing recipient".to_string()));
        }
        let html = self
            .html
            .ok_or_else(|| ClientError::BuilderError("missing body".to_string()))?;

        let mut message = String::with_capacity(html.len() * 4 / 3 + 1024);

        let from_header = match from_name.as_deref() {
            Some(name) if !name.trim().is_empty() => format!("{} <{from}>", display_name(name)),
            _ => from.clone(),
        };
        push_header(&mut message, "From", &from_header)?;
        push_header(&mut message, "To", &self.to.join(", "))?;
        push_header(
            &mut message,
            "Subject",
            &encode_word(self.subject.as_deref().unwrap_or_default()),
        )?;
        push_header(
            &mut message,
            "Date",
            &self.date.unwrap_or_else(Utc::now).to_rfc2822(),
        )?;
        push_header(&mut message, "Message-ID", &message_id(&from))?;
        for (name, value) in &self.headers {
            push_header(&mut message, name, value)?;
        }
        message.push_str("MIME-Version: 1.0\r\n");

        match self.text {
            None => {
                push_part(&mut message, "text/html", &html);
            }
            Some(text) => {
                let boundary = generate_boundary();
                message.push_str(&format!(
                    "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
                ));
                message.push_str(&format!("--{boundary}\r\n"));
                push_part(&mut message, "text/plain", &text);
                message.push_str(&format!("--{boundary}\r\n"));
                push_part(&mut message, "text/html", &html);
                message.push_str(&format!("--{boundary}--\r\n"));
            }
        }

        Ok(message)
    }
}

fn push_header(message: &mut String, name: &str, value: &str) -> Result<()> {
    if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
        return Err(ClientError::BuilderError(format!(
            "header {name:?} contains a line break"
        )));
    }
    message.push_str(name);
    message.push_str(": ");
    message.push_str(value);
    message.push_str("\r\n");
    Ok(())
}

/// Content headers, a blank line, then the base64 body.
fn push_part(message: &mut String, content_type: &str, body: &str) {
    message.push_str(&format!("Content-Type: {content_type}; charset=utf-8\r\n"));
    message.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
    message.push_str(&base64_lines(body.as_bytes()));
}

/// RFC 2047 `B` encoding for header text that is not plain ASCII.
#[must_use]
pub fn encode_word(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value))
    }
}

fn display_name(name: &str) -> String {
    if name.is_ascii() {
        format!("\"{}\"", name.replace(['"', '\\'], ""))
    } else {
        encode_word(name)
    }
}

fn base64_lines(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_LENGTH * 2 + 2);
    // Base64 output is ASCII, so byte chunks are valid UTF-8.
    for line in encoded.as_bytes().chunks(LINE_LENGTH) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push_str("\r\n");
    }
    out
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

fn generate_boundary() -> String {
    format!("----=_Part_{}", random_hex(12))
}

fn message_id(from: &str) -> String {
    let domain = from.rsplit_once('@').map_or("localhost", |(_, d)| d);
    format!("<{}@{domain}>", random_hex(16))
}
