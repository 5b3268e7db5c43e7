//! Enrollment: turning candidate recipients into queue entries.
//!
//! Candidates are validated and deduplicated, their language is settled, the
//! localised subject is personalised, and the result is enqueued. Duplicate
//! detection here is best effort; the store's active-recipient uniqueness is
//! what actually prevents double queueing.

use ahash::{AHashMap, AHashSet};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use courier_common::{address::EmailAddress, content::ContentResolver, tracing};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{QueueError, Result, store::QueueStore, types::NewEntry};

/// Characters that may trail a `{name}` placeholder in a subject template and
/// are dropped along with it when the recipient has no name.
const NAME_SEPARATORS: &[char] = &[',', '،', '、', '님', 'さ', 'ん', '፣', '၊'];

/// Number of random bytes in a generated unsubscribe token.
const TOKEN_BYTES: usize = 16;

/// Someone who may receive a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub email: String,
    #[serde(default, alias = "display_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub unsubscribe_token: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// IANA zone, used to pick a language when none is given.
    #[serde(default)]
    pub timezone: Option<String>,
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollPolicy {
    /// Skip candidates that were ever queued before, not only those with an
    /// entry still in flight.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub once_per_recipient: bool,

    /// Generate an unsubscribe token for candidates that have none.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub generate_missing_tokens: bool,

    /// Timezone to language code, consulted when a candidate has no language.
    #[serde(default)]
    pub timezone_languages: AHashMap<String, String>,
}

impl Default for EnrollPolicy {
    fn default() -> Self {
        Self {
            once_per_recipient: default_true(),
            generate_missing_tokens: default_true(),
            timezone_languages: AHashMap::new(),
        }
    }
}

/// Outcome of one enrollment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollReport {
    pub enqueued: u64,
    /// Duplicates within the batch, or already queued.
    pub skipped: u64,
    /// Rejected email syntax.
    pub invalid: u64,
}

/// Fill `{name}` in a subject template.
///
/// Without a name the placeholder is removed together with any separator
/// and whitespace that follows it, so `"{name}, welcome"` becomes `"welcome"`.
#[must_use]
pub fn personalise_subject(template: &str, name: Option<&str>) -> String {
    const PLACEHOLDER: &str = "{name}";

    match name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => template.replacen(PLACEHOLDER, name, 1),
        None => match template.find(PLACEHOLDER) {
            Some(start) => {
                let rest = &template[start + PLACEHOLDER.len()..];
                let rest = rest.trim_start_matches(|c: char| {
                    c.is_whitespace() || NAME_SEPARATORS.contains(&c)
                });
                format!("{}{rest}", &template[..start]).trim().to_string()
            }
            None => template.trim().to_string(),
        },
    }
}

/// A fresh URL-safe unsubscribe token.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Enqueue every acceptable candidate.
///
/// # Errors
///
/// Store failures abort the pass. Invalid or duplicate candidates are counted,
/// never raised.
pub async fn enroll(
    store: &dyn QueueStore,
    content: &dyn ContentResolver,
    policy: &EnrollPolicy,
    candidates: impl IntoIterator<Item = Candidate>,
) -> Result<EnrollReport> {
    let mut report = EnrollReport::default();
    let mut seen = AHashSet::new();

    for candidate in candidates {
        let email = match EmailAddress::parse(&candidate.email) {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(email = %candidate.email, "Skipping invalid address: {e}");
                report.invalid += 1;
                continue;
            }
        };

        if !seen.insert(email.clone()) {
            tracing::debug!(%email, "Skipping duplicate within batch");
            report.skipped += 1;
            continue;
        }

        if policy.once_per_recipient && store.contains_recipient(&email).await? {
            tracing::debug!(%email, "Skipping previously queued recipient");
            report.skipped += 1;
            continue;
        }

        let requested = candidate.language.clone().or_else(|| {
            candidate
                .timezone
                .as_ref()
                .and_then(|tz| policy.timezone_languages.get(tz).cloned())
        });
        let language = content.effective_language(requested.as_deref());
        let bundle = content.resolve(Some(&language));

        let token = candidate
            .unsubscribe_token
            .filter(|token| !token.is_empty())
            .or_else(|| policy.generate_missing_tokens.then(generate_token));

        let name = candidate.name.filter(|name| !name.trim().is_empty());
        let entry = NewEntry {
            subject: personalise_subject(&bundle.subject, name.as_deref()),
            recipient_email: email,
            recipient_name: name,
            unsubscribe_token: token,
            language: Some(language),
        };

        match store.enqueue(entry).await {
            Ok(id) => {
                tracing::debug!(entry_id = %id, "Enqueued");
                report.enqueued += 1;
            }
            Err(QueueError::AlreadyQueued(email)) => {
                tracing::debug!(%email, "Already queued");
                report.skipped += 1;
            }
            Err(QueueError::InvalidEntry(reason)) => {
                tracing::warn!("Rejected entry: {reason}");
                report.invalid += 1;
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        enqueued = report.enqueued,
        skipped = report.skipped,
        invalid = report.invalid,
        "Enrollment complete"
    );

    Ok(report)
}
