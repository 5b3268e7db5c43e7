//! Submission client used to hand messages to an upstream relay.
//!
//! The client is a thin, strictly sequential driver: one command, one reply.
//! It supports plain TCP, implicit TLS and `STARTTLS`, plus `AUTH PLAIN` and
//! `AUTH LOGIN`. Every exchange runs under a deadline.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use courier_smtp::client::{Credentials, MessageBuilder, SmtpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client =
//!     SmtpClient::connect_tls("smtp.example.com:465", "smtp.example.com", Duration::from_secs(10), false)
//!         .await?;
//! client.read_greeting(Duration::from_secs(10)).await?;
//! client.ehlo("courier.local").await?;
//! client.authenticate(&Credentials::new("bot@example.com", "secret")).await?;
//!
//! let message = MessageBuilder::new()
//!     .from("bot@example.com", None)
//!     .to("learner@example.com")
//!     .subject("Hello")
//!     .html("<p>Hello</p>")
//!     .build()?;
//!
//! client.mail_from("bot@example.com").await?;
//! client.rcpt_to("learner@example.com").await?;
//! client.data().await?;
//! client.send_data(&message).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#[allow(clippy::module_inception)]
mod client;
mod config;
mod connection;
mod error;
mod message;
mod response;

pub use client::{AuthMechanism, SmtpClient};
pub use config::{Credentials, Security, SmtpTimeouts};
pub use error::{ClientError, Result};
pub use message::{MessageBuilder, encode_word};
pub use response::{EnhancedStatus, Response, ResponseLine};
