//! [`Transport`] over an authenticated SMTP submission session.

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{internal, tracing};
use courier_smtp::client::{ClientError, Credentials, MessageBuilder, Security, SmtpClient, SmtpTimeouts};
use serde::{Deserialize, Serialize};

use crate::{
    error::TransportError,
    transport::{OutboundMessage, Transport, TransportFactory},
};

/// Which reply codes halt a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationPolicy {
    /// Default: 534, 535
    #[serde(default = "defaults::auth_codes")]
    pub auth_codes: Vec<u16>,

    /// Default: 421, 429, 550
    #[serde(default = "defaults::throttle_codes")]
    pub throttle_codes: Vec<u16>,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            auth_codes: defaults::auth_codes(),
            throttle_codes: defaults::throttle_codes(),
        }
    }
}

impl ClassificationPolicy {
    /// Map a client failure onto the dispatcher's vocabulary.
    #[must_use]
    pub fn classify(&self, error: &ClientError) -> TransportError {
        let text = error.to_string();

        if let Some(code) = error.code() {
            return if self.auth_codes.contains(&code) {
                TransportError::Authentication(text)
            } else if self.throttle_codes.contains(&code) {
                TransportError::Throttled {
                    code,
                    message: text,
                }
            } else {
                TransportError::Rejected {
                    code,
                    message: text,
                }
            };
        }

        match error {
            ClientError::AuthUnsupported(_) => TransportError::Authentication(text),
            ClientError::Timeout { .. } => TransportError::Timeout(text),
            ClientError::Io(_) | ClientError::ConnectionClosed | ClientError::TlsError(_) => {
                TransportError::Connection(text)
            }
            ClientError::BuilderError(_) => TransportError::Message(text),
            _ => TransportError::Protocol(text),
        }
    }
}

/// Where and how to submit mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    /// Defaults to the standard port for `security`.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub security: Security,

    /// Login name. Authentication is skipped when empty.
    #[serde(default)]
    pub username: String,

    /// May also come from the environment; never serialised back out.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Envelope sender and `From` address.
    pub from_address: String,

    #[serde(default)]
    pub from_name: Option<String>,

    /// Name sent with EHLO.
    #[serde(default = "defaults::helo_name")]
    pub helo_name: String,

    /// Skip certificate validation. Only for self-signed test relays.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    #[serde(default)]
    pub classification: ClassificationPolicy,
}

impl SmtpConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            security: Security::default(),
            username: String::new(),
            password: String::new(),
            from_address: from_address.into(),
            from_name: None,
            helo_name: defaults::helo_name(),
            accept_invalid_certs: false,
            timeouts: SmtpTimeouts::default(),
            classification: ClassificationPolicy::default(),
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!(
            "{}:{}",
            self.host,
            self.port.unwrap_or_else(|| self.security.default_port())
        )
    }

    fn credentials(&self) -> Option<Credentials> {
        (!self.username.is_empty())
            .then(|| Credentials::new(self.username.clone(), self.password.clone()))
    }
}

mod defaults {
    pub fn auth_codes() -> Vec<u16> {
        vec![534, 535]
    }

    pub fn throttle_codes() -> Vec<u16> {
        vec![421, 429, 550]
    }

    pub fn helo_name() -> String {
        "localhost".to_string()
    }
}

/// Opens [`SmtpTransport`]s sharing one configuration.
#[derive(Debug, Clone)]
pub struct SmtpTransportFactory {
    config: Arc<SmtpConfig>,
}

impl SmtpTransportFactory {
    #[must_use]
    pub fn new(config: SmtpConfig) -> Self {
        if config.accept_invalid_certs {
            tracing::warn!(
                host = %config.host,
                "SECURITY WARNING: TLS certificate validation is disabled for the SMTP relay"
            );
        }

        Self {
            config: Arc::new(config),
        }
    }
}

impl TransportFactory for SmtpTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(SmtpTransport::new(Arc::clone(&self.config)))
    }
}

/// One SMTP session, opened lazily and reused for every message of a run.
pub struct SmtpTransport {
    config: Arc<SmtpConfig>,
    client: Option<SmtpClient>,
}

impl SmtpTransport {
    #[must_use]
    pub const fn new(config: Arc<SmtpConfig>) -> Self {
        Self {
            config,
            client: None,
        }
    }

    async fn open(&self) -> Result<SmtpClient, ClientError> {
        let config = &self.config;
        let address = config.address();
        let timeouts = &config.timeouts;

        let client = match config.security {
            Security::Implicit => {
                SmtpClient::connect_tls(
                    &address,
                    config.host.clone(),
                    timeouts.connect(),
                    config.accept_invalid_certs,
                )
                .await?
            }
            Security::StartTls | Security::Plain => {
                SmtpClient::connect(&address, config.host.clone(), timeouts.connect())
                    .await?
                    .accept_invalid_certs(config.accept_invalid_certs)
            }
        };
        let mut client = client.with_command_timeout(timeouts.command());

        client.read_greeting(timeouts.greeting()).await?;
        client.ehlo(&config.helo_name).await?;

        if config.security == Security::StartTls {
            client.starttls().await?;
            client.ehlo(&config.helo_name).await?;
        }

        if let Some(credentials) = config.credentials() {
            client.authenticate(&credentials).await?;
        }

        internal!(level = DEBUG, "SMTP session established with {address}");
        Ok(client)
    }

    async fn ensure_open(&mut self) -> Result<&mut SmtpClient, ClientError> {
        if self.client.is_none() {
            self.client = Some(self.open().await?);
        }
        self.client.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    async fn deliver(&mut self, to: &str, data: &str) -> Result<(), ClientError> {
        let from = self.config.from_address.clone();

        // The relay may drop an idle session between messages. Reconnect
        // once, but only while nothing of this message has reached it.
        let reconnect = match self.ensure_open().await?.mail_from(&from).await {
            Ok(_) => false,
            Err(e) if e.is_transport() => {
                tracing::debug!("SMTP session lost ({e}), reconnecting");
                true
            }
            Err(e) => return Err(e),
        };
        if reconnect {
            self.client = None;
            self.ensure_open().await?.mail_from(&from).await?;
        }

        let client = self.ensure_open().await?;
        client.rcpt_to(to).await?;
        client.data().await?;
        client.send_data(data).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn verify(&mut self) -> Result<(), TransportError> {
        let opened = self.ensure_open().await.map(|_| ());
        opened.map_err(|e| self.config.classification.classify(&e))
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut builder = MessageBuilder::new()
            .from(&self.config.from_address, self.config.from_name.as_deref())
            .to(message.to.as_str())
            .subject(&message.subject)
            .html(&message.html);
        for (name, value) in &message.headers {
            builder = builder.header(name, value);
        }
        let data = builder
            .build()
            .map_err(|e| self.config.classification.classify(&e))?;

        match self.deliver(message.to.as_str(), &data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let classified = self.config.classification.classify(&e);

                if e.is_transport() {
                    self.client = None;
                } else if let Some(client) = self.client.as_mut()
                    && client.rset().await.is_err()
                {
                    self.client = None;
                }

                Err(classified)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.close().await;
        }
    }
}
