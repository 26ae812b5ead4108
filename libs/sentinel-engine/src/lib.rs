pub mod admission;
pub mod cache;
pub mod confine;
pub mod error;
pub mod executor;
pub mod limits;
pub mod process_tree;
pub mod supervisor;
pub mod toolchain;
pub mod workspace;

#[cfg(test)]
mod executor_tests;

pub use error::{ExecutorError, Result};
pub use executor::{outcome_of, Executor, MaintenanceReport};
