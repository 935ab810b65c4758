//! Row-level enforcement and the transaction write-check hook.

mod access;
mod hook;

pub use access::{AccessControl, Target};
pub use hook::{check_writes, WRITE_CHECK_HOOK};
