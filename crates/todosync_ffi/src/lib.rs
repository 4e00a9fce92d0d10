//! Flutter bridge for `todosync_core`.

pub mod api;
