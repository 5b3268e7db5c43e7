//! Localised message content.
//!
//! A [`ContentResolver`] turns a language code into the text fragments used
//! to render one outbound message. Resolution never fails: unknown languages
//! fall back to their primary subtag, then to the catalog default, then to a
//! built-in English bundle.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// The language used when an entry carries none and nothing else matches.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Text fragments for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBundle {
    /// Subject template. `{name}` is replaced with the recipient's name at
    /// enrollment time.
    pub subject: String,
    pub greeting: String,
    /// Plain text body; newlines become `<br>` when rendered.
    pub body: String,
    pub cta_text: String,
    /// May contain `{{brand_name}}`.
    pub unsubscribe_notice: String,
    pub unsubscribe_text: String,
}

impl Default for ContentBundle {
    fn default() -> Self {
        Self {
            subject: "{name}, your daily lesson is ready".to_string(),
            greeting: "Time for today's lesson!".to_string(),
            body: "A few minutes a day keeps your streak alive.\nPick up where you left off."
                .to_string(),
            cta_text: "Start learning".to_string(),
            unsubscribe_notice:
                "You are receiving this email because you signed up for {{brand_name}}."
                    .to_string(),
            unsubscribe_text: "Unsubscribe".to_string(),
        }
    }
}

/// Maps a language code to its content.
pub trait ContentResolver: Send + Sync + std::fmt::Debug {
    /// Content for `language`, or the closest available fallback.
    fn resolve(&self, language: Option<&str>) -> ContentBundle;

    /// The language that `resolve` would actually serve for `language`.
    fn effective_language(&self, language: Option<&str>) -> String;
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// A fixed set of bundles keyed by lowercase language code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentCatalog {
    #[serde(default = "default_language")]
    pub default_language: String,

    #[serde(default)]
    pub languages: AHashMap<String, ContentBundle>,
}

impl Default for ContentCatalog {
    fn default() -> Self {
        Self {
            default_language: default_language(),
            languages: AHashMap::new(),
        }
    }
}

impl ContentCatalog {
    #[must_use]
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: default_language.into().to_ascii_lowercase(),
            languages: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: &str, bundle: ContentBundle) -> Self {
        self.languages.insert(language.to_ascii_lowercase(), bundle);
        self
    }

    fn lookup(&self, language: &str) -> Option<(&str, &ContentBundle)> {
        let language = language.trim().to_ascii_lowercase();
        if let Some((key, bundle)) = self.languages.get_key_value(language.as_str()) {
            return Some((key.as_str(), bundle));
        }

        let primary = language.split(['-', '_']).next().unwrap_or_default();
        self.languages
            .get_key_value(primary)
            .map(|(key, bundle)| (key.as_str(), bundle))
    }

    fn pick(&self, language: Option<&str>) -> Option<(&str, &ContentBundle)> {
        language
            .filter(|language| !language.trim().is_empty())
            .and_then(|language| self.lookup(language))
            .or_else(|| self.lookup(&self.default_language))
    }
}

impl ContentResolver for ContentCatalog {
    fn resolve(&self, language: Option<&str>) -> ContentBundle {
        self.pick(language)
            .map(|(_, bundle)| bundle.clone())
            .unwrap_or_default()
    }

    fn effective_language(&self, language: Option<&str>) -> String {
        self.pick(language).map_or_else(
            || DEFAULT_LANGUAGE.to_string(),
            |(key, _)| key.to_string(),
        )
    }
}
