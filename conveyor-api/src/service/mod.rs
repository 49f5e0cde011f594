//! Service Module
//!
//! Business logic between the HTTP handlers and the store.

pub mod job;
