//! Testing utilities and mock implementations
//!
//! Mocks for the transport, link, converter and storage seams so the agent
//! can be exercised without radios, brokers or sensor hardware.

pub mod mocks;

pub use mocks::*;
