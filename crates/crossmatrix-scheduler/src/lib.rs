//! Matrix expansion and job scheduling for crossmatrix.

pub mod matrix;
pub mod scheduler;

pub use matrix::{MatrixExpander, MatrixFilter};
pub use scheduler::MatrixScheduler;
