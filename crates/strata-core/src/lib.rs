//! Strata core
//!
//! A pluggable key-value caching abstraction: one uniform async contract
//! over interchangeable backends, with transparent multi-tier composition.
//!
//! - [`store::Store`] / [`store::StoreMap`] - the uniform contract
//!   (put/get/delete/counters/existence/expiry/namespaced maps)
//! - [`memory::MemoryStore`] - in-process store with per-entry expiry and
//!   a background reaper
//! - [`tiered::TieredStore`] - read-through/write-through/backfill
//!   composition of two stores; [`tiered::compose`] right-folds a chain
//! - [`registry::Registry`] - backend name to constructor mapping
//!
//! Remote backends live in their own crates (see `strata-redis`) and plug
//! into a [`registry::Registry`].

pub mod error;
pub mod memory;
pub mod registry;
pub mod store;
pub mod tiered;
pub mod value;

pub use error::{CacheError, Result};
pub use memory::{MemoryConfig, MemoryStore};
pub use registry::{Registry, SharedStore, StoreFactory};
pub use store::{Expiry, Store, StoreExt, StoreMap};
pub use tiered::{TieredStore, compose};
pub use value::Value;
