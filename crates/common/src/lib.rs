// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod fs;
pub mod names;

pub use names::{sanitize_name, sanitize_task_id, NameError};
