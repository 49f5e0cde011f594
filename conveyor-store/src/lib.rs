//! Storage layer for the conveyor job scheduler.
//!
//! [`PgJobStore`] is the production implementation of the repository
//! contract; [`MemoryJobStore`] implements the same contract in memory
//! for tests that exercise claim/settle semantics without a database.

pub mod db;
pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
