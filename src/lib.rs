//! Personal time tracking from the terminal. Each `tacks record` invocation stores one stretch of
//! work in a Couchbase bucket: it is written open when recording starts and closed when the
//! process is interrupted.
//!

pub mod allocator;
pub mod cli;
pub mod config;
pub mod error;
pub mod recorder;
pub mod store;
pub mod stretch;
pub mod utils;
