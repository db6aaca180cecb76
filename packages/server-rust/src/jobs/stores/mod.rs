//! [`JobStore`](super::JobStore) backends.
//!
//! The in-memory store is always available; `redb` and `postgres` are behind
//! cargo features of the same name.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redb")]
pub mod redb;

pub use memory::MemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
#[cfg(feature = "redb")]
pub use self::redb::RedbJobStore;
