//! Process wiring for the `courier` binary: configuration, the HTTP trigger
//! and the shutdown-aware controller.

pub mod config;
pub mod controller;
pub mod http;

pub use config::{Config, StoreConfig, find_config_file};
pub use controller::{Courier, SHUTDOWN_BROADCAST};
pub use http::{HttpConfig, HttpError, HttpServer};
