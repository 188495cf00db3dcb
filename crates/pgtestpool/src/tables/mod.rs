//! Row-level access to the pgtestpool tables.
//!
//! Each table gets a small struct with plain CRUD methods and `_tx` variants that run inside a
//! caller-supplied transaction. Business rules (claiming, reclamation, mismatch checks) live in
//! [`crate::store`]; these modules only move rows.

pub mod pgtestpool_pools;
pub mod pgtestpool_slots;
pub mod pgtestpool_templates;

pub use pgtestpool_pools::{NewPool, Pools};
pub use pgtestpool_slots::Slots;
pub use pgtestpool_templates::Templates;
