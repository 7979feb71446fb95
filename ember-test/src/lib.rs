//! Internal utilities to support testing.

pub mod logging;
