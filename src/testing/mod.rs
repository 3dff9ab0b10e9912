//! Testing utilities and mock implementations
//!
//! Lets the client facade be exercised without a running lookup service or
//! data node.

pub mod mocks;

pub use mocks::*;
