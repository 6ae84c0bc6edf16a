//! Utility functions and helpers.

pub mod allow_list;
pub mod id_generator;

// Re-export commonly used types
pub use allow_list::AllowList;
pub use id_generator::IdGenerator;
