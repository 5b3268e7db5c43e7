//! Outbound SMTP for courier.
//!
//! Only the client side lives here: courier submits mail to a relay and
//! never accepts it.

pub mod client;
