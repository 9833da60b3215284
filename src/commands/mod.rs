pub mod admin;
pub mod load;

// Re-export command functions for convenience
pub use admin::{init, reclaim, status};
pub use load::{run, scan};
