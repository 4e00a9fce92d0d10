//! Use-case services.
//!
//! # Responsibility
//! - Turn domain operations into local state writes plus change records.
//! - Keep FFI and CLI layers decoupled from storage and sync details.

pub mod todo_service;

pub use todo_service::{TodoListQuery, TodoPatch, TodoService};
