//! Adaptive plan rewrites applied between a stage's statistics barrier and
//! its execution.

mod optimize_join;
mod skewed_join;

pub use optimize_join::optimize_join;
pub use skewed_join::handle_skewed_join;
