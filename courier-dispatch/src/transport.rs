use async_trait::async_trait;
use courier_common::address::EmailAddress;

use crate::error::TransportError;

/// A fully rendered message ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: EmailAddress,
    pub subject: String,
    pub html: String,
    /// Extra headers in the order they should be written.
    pub headers: Vec<(String, String)>,
}

/// One session with the outbound mail provider.
///
/// A transport is used for a single dispatch run and always closed at the
/// end of it, whatever the outcome.
#[async_trait]
pub trait Transport: Send {
    /// Connect and authenticate without sending anything.
    ///
    /// # Errors
    ///
    /// Any failure here means the batch cannot be sent at all.
    async fn verify(&mut self) -> Result<(), TransportError>;

    /// # Errors
    ///
    /// A classified failure for this one message.
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Release the session. Never fails.
    async fn close(&mut self);
}

/// Creates a fresh [`Transport`] for each run.
///
/// Creation must not touch the network; the dispatcher only calls
/// [`Transport::verify`] once it knows there is work to do.
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    fn create(&self) -> Box<dyn Transport>;
}
