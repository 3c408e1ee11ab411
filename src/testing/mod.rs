//! Testing utilities and mock implementations
//!
//! This module provides a scripted transport for exercising the connection manager
//! without a WebSocket server.

pub mod mocks;

pub use mocks::*;
