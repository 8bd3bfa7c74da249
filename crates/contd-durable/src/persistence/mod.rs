//! Persistence layer: store contracts and backends

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    AttemptOutcome, BlobStore, DurableStore, IdempotencyStore, JournalStore, LeaseStore,
    SnapshotStore, StoreError,
};
