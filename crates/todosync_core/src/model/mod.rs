//! Domain model for offline change tracking.
//!
//! # Responsibility
//! - Define change records, entity snapshots and the todo entity.
//! - Keep validation rules next to the data they protect.
//!
//! # Invariants
//! - Every synchronized object is addressed by an `EntityRef`.
//! - Deletion is represented by tombstones, not hard delete.

pub mod change;
pub mod entity;
pub mod todo;
