//! Turning a queue entry and its localised content into an HTML message.
//!
//! Rendering is pure substitution and never fails for a single entry; a
//! broken template is caught when the [`Renderer`] is built.

use std::{fmt::Write, path::PathBuf};

use ahash::AHashMap;
use courier_common::content::ContentBundle;
use courier_queue::{QueueEntry, enroll::personalise_subject};
use serde::{Deserialize, Serialize};

use crate::{error::DispatchError, transport::OutboundMessage};

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{{brand_name}}</title>
</head>
<body style="margin:0;padding:0;background:#f4f4f7;font-family:Helvetica,Arial,sans-serif;color:#333333;">
<table role="presentation" width="100%" cellspacing="0" cellpadding="0">
<tr><td align="center" style="padding:32px 16px;">
<table role="presentation" width="560" cellspacing="0" cellpadding="0" style="background:#ffffff;border-radius:8px;">
<tr><td style="padding:32px 32px 8px;font-size:22px;font-weight:bold;">{{brand_name}}</td></tr>
<tr><td style="padding:8px 32px;font-size:18px;">{{greeting}}</td></tr>
<tr><td style="padding:8px 32px 24px;font-size:16px;line-height:1.5;">{{body}}</td></tr>
<tr><td align="center" style="padding:0 32px 32px;">
<a href="{{cta_url}}" style="display:inline-block;padding:12px 28px;background:#4f46e5;color:#ffffff;text-decoration:none;border-radius:6px;font-weight:bold;">{{cta_text}}</a>
</td></tr>
</table>
<p style="max-width:560px;font-size:12px;color:#888888;line-height:1.5;">{{unsubscribe_notice}}<br>
<a href="{{unsubscribe_url}}" style="color:#888888;">{{unsubscribe_text}}</a></p>
</td></tr>
</table>
</body>
</html>
"#;

/// Branding and links shared by every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// The unsubscribe handler. `token=<token>` is appended as a query
    /// parameter.
    pub unsubscribe_base_url: String,

    #[serde(default = "defaults::brand_name")]
    pub brand_name: String,

    /// Target of the call-to-action button.
    #[serde(default)]
    pub cta_url: String,

    /// HTML template file. The built-in template is used when absent.
    #[serde(default)]
    pub template_path: Option<PathBuf>,

    /// Extra `{{key}}` values for custom templates, e.g. social links.
    #[serde(default)]
    pub variables: AHashMap<String, String>,
}

impl RenderConfig {
    #[must_use]
    pub fn new(unsubscribe_base_url: impl Into<String>) -> Self {
        Self {
            unsubscribe_base_url: unsubscribe_base_url.into(),
            brand_name: defaults::brand_name(),
            cta_url: String::new(),
            template_path: None,
            variables: AHashMap::default(),
        }
    }
}

mod defaults {
    pub fn brand_name() -> String {
        "Courier".to_string()
    }
}

/// Renders queue entries into [`OutboundMessage`]s.
#[derive(Debug, Clone)]
pub struct Renderer {
    config: RenderConfig,
    template: String,
    /// Mailbox for the `mailto:` unsubscribe fallback.
    unsubscribe_mailbox: Option<String>,
}

impl Renderer {
    /// Load the template named in `config`, or the built-in one.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if the template file cannot
    /// be read.
    pub fn new(config: RenderConfig) -> Result<Self, DispatchError> {
        let template = match &config.template_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                DispatchError::Configuration(format!(
                    "Unable to read template {}: {e}",
                    path.display()
                ))
            })?,
            None => DEFAULT_TEMPLATE.to_string(),
        };

        Ok(Self::with_template(config, template))
    }

    #[must_use]
    pub const fn with_template(config: RenderConfig, template: String) -> Self {
        Self {
            config,
            template,
            unsubscribe_mailbox: None,
        }
    }

    /// Adds `<mailto:{mailbox}?subject=unsubscribe>` to `List-Unsubscribe`.
    #[must_use]
    pub fn with_unsubscribe_mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.unsubscribe_mailbox = Some(mailbox.into());
        self
    }

    #[must_use]
    pub fn unsubscribe_url(&self, token: Option<&str>) -> String {
        unsubscribe_url(&self.config.unsubscribe_base_url, token)
    }

    #[must_use]
    pub fn render(&self, entry: &QueueEntry, content: &ContentBundle) -> OutboundMessage {
        let unsubscribe_url = self.unsubscribe_url(entry.unsubscribe_token.as_deref());
        let brand_name = escape_html(&self.config.brand_name);

        let name = entry.recipient_name.as_deref().map(escape_html);
        let greeting = personalise_subject(&content.greeting, name.as_deref());
        let body = content.body.replace("\r\n", "\n").replace('\n', "<br>");
        let notice = content
            .unsubscribe_notice
            .replace("{{brand_name}}", &brand_name);

        let mut values: AHashMap<&str, &str> = self
            .config
            .variables
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        values.extend([
            ("brand_name", brand_name.as_str()),
            ("greeting", greeting.as_str()),
            ("body", body.as_str()),
            ("cta_text", content.cta_text.as_str()),
            ("cta_url", self.config.cta_url.as_str()),
            ("unsubscribe_url", unsubscribe_url.as_str()),
            ("unsubscribe_notice", notice.as_str()),
            ("unsubscribe_text", content.unsubscribe_text.as_str()),
        ]);

        let mut list_unsubscribe = format!("<{unsubscribe_url}>");
        if let Some(mailbox) = &self.unsubscribe_mailbox {
            let _ = write!(list_unsubscribe, ", <mailto:{mailbox}?subject=unsubscribe>");
        }

        OutboundMessage {
            to: entry.recipient_email.clone(),
            subject: entry.subject.clone(),
            html: render_template(&self.template, &values),
            headers: vec![("List-Unsubscribe".to_string(), list_unsubscribe)],
        }
    }
}

/// `{base}?token={token}`, or `&token=` when the base already has a query.
///
/// A missing token still yields a well-formed link with an empty value.
#[must_use]
pub fn unsubscribe_url(base: &str, token: Option<&str>) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{separator}token={}",
        percent_encode(token.unwrap_or_default())
    )
}

/// Replace every `{{key}}` with its value. Unknown keys render as nothing.
#[must_use]
pub fn render_template(template: &str, values: &AHashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[..end].trim();
        if let Some(value) = values.get(key) {
            out.push_str(value);
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

/// RFC 3986 unreserved characters pass through, everything else is `%XX`.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use chrono::Utc;
    use courier_common::address::EmailAddress;
    use courier_queue::{EntryId, QueueStatus};
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry(token: Option<&str>, name: Option<&str>) -> QueueEntry {
        QueueEntry {
            id: EntryId(1),
            recipient_email: EmailAddress::parse("learner@example.com").unwrap(),
            recipient_name: name.map(str::to_string),
            unsubscribe_token: token.map(str::to_string),
            subject: "Your lesson".to_string(),
            language: None,
            status: QueueStatus::Locked,
            locked_at: Some(Utc::now()),
            error: None,
            sent_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn unsubscribe_links() {
        assert_eq!(
            unsubscribe_url("https://example.com/unsubscribe", Some("abc_123-x")),
            "https://example.com/unsubscribe?token=abc_123-x"
        );
        assert_eq!(
            unsubscribe_url("https://example.com/u?lang=en", Some("a b&c")),
            "https://example.com/u?lang=en&token=a%20b%26c"
        );
    }

    #[test]
    fn empty_token_still_makes_a_link() {
        assert_eq!(
            unsubscribe_url("https://example.com/unsubscribe", None),
            "https://example.com/unsubscribe?token="
        );
        assert_eq!(
            unsubscribe_url("https://example.com/unsubscribe", Some("")),
            "https://example.com/unsubscribe?token="
        );
    }

    #[test]
    fn template_substitution() {
        let values: AHashMap<&str, &str> = [("name", "Mina"), ("count", "3")].into_iter().collect();
        assert_eq!(
            render_template("Hi {{name}}, day {{ count }}{{missing}}!", &values),
            "Hi Mina, day 3!"
        );
        assert_eq!(render_template("open {{never closed", &values), "open {{never closed");
    }

    #[test]
    fn renders_message() {
        let mut config = RenderConfig::new("https://example.com/unsubscribe");
        config.brand_name = "Lingo".to_string();
        config.cta_url = "https://example.com/app".to_string();
        config
            .variables
            .insert("social_instagram".to_string(), "https://instagram.com/lingo".to_string());

        let renderer = Renderer::with_template(
            config,
            "{{brand_name}}|{{greeting}}|{{body}}|{{cta_text}}@{{cta_url}}|{{unsubscribe_notice}}|{{unsubscribe_text}}@{{unsubscribe_url}}|{{social_instagram}}"
                .to_string(),
        )
        .with_unsubscribe_mailbox("bot@example.com");

        let content = ContentBundle {
            greeting: "Hi {name}!".to_string(),
            body: "Line one\nLine two".to_string(),
            unsubscribe_notice: "Sent by {{brand_name}}.".to_string(),
            ..ContentBundle::default()
        };

        let message = renderer.render(&entry(Some("tok"), Some("<Mina>")), &content);

        assert_eq!(message.to.as_str(), "learner@example.com");
        assert_eq!(message.subject, "Your lesson");
        assert_eq!(
            message.html,
            "Lingo|Hi &lt;Mina&gt;!|Line one<br>Line two|Start learning@https://example.com/app|Sent by Lingo.|Unsubscribe@https://example.com/unsubscribe?token=tok|https://instagram.com/lingo"
        );
        assert_eq!(
            message.headers,
            vec![(
                "List-Unsubscribe".to_string(),
                "<https://example.com/unsubscribe?token=tok>, <mailto:bot@example.com?subject=unsubscribe>"
                    .to_string()
            )]
        );
    }

    #[test]
    fn default_template_without_token_or_name() {
        let renderer = Renderer::new(RenderConfig::new("https://example.com/unsubscribe")).unwrap();
        let message = renderer.render(&entry(None, None), &ContentBundle::default());

        assert!(message.html.contains("href=\"https://example.com/unsubscribe?token=\""));
        assert!(message.html.contains("signed up for Courier."));
        assert!(!message.html.contains("{{"));
        assert_eq!(
            message.headers[0].1,
            "<https://example.com/unsubscribe?token=>"
        );
    }

    #[test]
    fn missing_template_file_is_a_configuration_error() {
        let mut config = RenderConfig::new("https://example.com/unsubscribe");
        config.template_path = Some(PathBuf::from("/nonexistent/courier/template.html"));
        assert!(matches!(
            Renderer::new(config),
            Err(DispatchError::Configuration(_))
        ));
    }
}
