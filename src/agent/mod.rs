//! Agent orchestration: startup ordering, the run loop and teardown

pub mod lifecycle;

pub use lifecycle::*;
