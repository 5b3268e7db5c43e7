use std::{
    fmt::{self, Display},
    ops::Deref,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Unable to parse address '{0}'")]
    Unparseable(String),

    #[error("Expected a single mailbox, found '{0}'")]
    NotSingleMailbox(String),

    #[error("Invalid local part in '{0}'")]
    InvalidLocalPart(String),

    #[error("Invalid domain in '{0}'")]
    InvalidDomain(String),
}

/// A syntactically valid recipient address, stored lowercased and trimmed.
///
/// Accepts a bare `local@domain` or a display form such as
/// `Jane <jane@example.com>`; in both cases only the address is kept.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    /// Parse and normalise an address.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if the input is not exactly one mailbox
    /// with an acceptable local part and a dotted domain whose top level is
    /// at least two letters.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let parsed = mailparse::addrparse(trimmed)
            .map_err(|_| AddressError::Unparseable(trimmed.to_string()))?;

        let addr = match parsed.extract_single_info() {
            Some(info) => info.addr,
            None => return Err(AddressError::NotSingleMailbox(trimmed.to_string())),
        };

        let addr = addr.trim().to_ascii_lowercase();
        let Some((local, domain)) = addr.rsplit_once('@') else {
            return Err(AddressError::Unparseable(trimmed.to_string()));
        };

        if local.is_empty()
            || !local
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '+' | '-'))
        {
            return Err(AddressError::InvalidLocalPart(addr.clone()));
        }

        if !valid_domain(domain) {
            return Err(AddressError::InvalidDomain(addr.clone()));
        }

        Ok(Self(addr))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map_or("", |(_, domain)| domain)
    }
}

fn valid_domain(domain: &str) -> bool {
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };

    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for EmailAddress {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for EmailAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EmailAddress> for String {
    fn from(value: EmailAddress) -> Self {
        value.0
    }
}
