//! Shared fixtures for the integration tests: scriptable mocks for the database, the gateway
//! and the transport, plus a temporary workspace builder.

#![allow(dead_code)]

pub mod builders;
pub mod mocks;
pub mod strategies;

pub use builders::*;
pub use mocks::*;
