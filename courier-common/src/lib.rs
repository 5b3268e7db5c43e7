pub mod address;
pub mod clock;
pub mod content;
pub mod logging;

pub use tracing;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
