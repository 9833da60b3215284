//! Integration tests module

pub mod coordination_test;
pub mod crash_recovery_test;
pub mod fixtures;
pub mod loader_pipeline_test;
