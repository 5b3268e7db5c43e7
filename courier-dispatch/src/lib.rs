//! The dispatch pipeline.
//!
//! A [`Dispatcher`] run releases stale claims, claims a batch, verifies the
//! transport and then sends each entry in order. Failures are classified:
//!
//! - authentication: this entry and the rest of the batch become
//!   `auth_failed` and the run stops;
//! - throttling: this entry fails, the rest go back to `pending` and the run
//!   stops;
//! - anything else: this entry fails and the run moves on.
//!
//! The transport is closed however the run ends.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pacing;
pub mod processor;
pub mod render;
pub mod smtp;
pub mod transport;

pub use config::DispatchConfig;
pub use dispatcher::{DispatchReport, Dispatcher, Halt};
pub use error::{DispatchError, FailureClass, TransportError};
pub use pacing::PacingPolicy;
pub use processor::DispatchProcessor;
pub use render::{RenderConfig, Renderer};
pub use smtp::{ClassificationPolicy, SmtpConfig, SmtpTransport, SmtpTransportFactory};
pub use transport::{OutboundMessage, Transport, TransportFactory};
