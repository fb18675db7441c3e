//! Persistence layer
//!
//! Connection pooling, embedded migrations and the Postgres implementations
//! of the repository ports defined in the services crate. All repositories
//! use short-lived pooled connections; nothing here holds a transaction
//! across an await into another subsystem.

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{create_pool, DbPool};
pub use repositories::{
    PgChunkSearchRepository, PgConversationRepository, PgDeviceRepository, PgMemoryRepository,
    PgOutputDeviceRepository, PgRoomRepository, PgSettingsRepository,
};
