//! Test support: mock processors shared by unit and integration tests.

pub mod mocks;

pub use mocks::{CountingProcessor, FailingProcessor, FlakyProcessor};
