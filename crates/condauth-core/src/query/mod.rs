//! Query evaluation support.

mod filter;

pub use filter::{referenced_fields, FilterEvaluator};
