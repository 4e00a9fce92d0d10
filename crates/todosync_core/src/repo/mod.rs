//! Local state repositories.
//!
//! # Responsibility
//! - Keep key layout and encoding of local entity state behind a trait.
//!
//! # Invariants
//! - Repository writes go through the buffered store and never fail.
//! - Reads reject undecodable rows instead of masking them.

pub mod entity_repo;

pub use entity_repo::{EntityRepository, KvEntityRepository};
