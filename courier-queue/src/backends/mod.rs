mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryQueueStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresQueueStore;
