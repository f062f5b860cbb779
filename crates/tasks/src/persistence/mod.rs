//! Persistence layer
//!
//! This module provides:
//! - [`TaskStore`] trait, the contract for the shared store
//! - [`InMemoryTaskStore`] for tests and single-process use
//! - [`TaskRecords`] for typed, compare-and-set access to task records

pub mod keys;
mod memory;
mod records;
mod store;

pub use memory::InMemoryTaskStore;
pub use records::{RecordUpdate, TaskRecords};
pub use store::{Score, StoreError, TaskStore};
