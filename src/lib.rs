//! ndt-client - A Rust client for the NDT network diagnostic protocol
//!
//! This library runs NDT speed tests (download, upload and metadata
//! exchange) against an NDT server and collects the results into a single
//! JSON-friendly report.
//!
//! # Features
//!
//! - Single-threaded cooperative event loop, no async runtime required
//! - Multi-stream download with periodic speed snapshots
//! - Upload test with server-side speed measurement
//! - web100 diagnostic variables collected into the report
//! - Pluggable server discovery through the [`NameService`] trait
//!
//! Everything runs on the thread that drives [`Reactor::run`]; blocking
//! work (name resolution, server discovery) is pushed to a small worker
//! pool owned by the reactor.

pub mod messages;

mod context;
mod error;
mod protocol;
mod reactor;
mod report;
mod run;
mod streams;
mod test_c2s;
mod test_meta;
mod test_s2c;
mod transport;

pub use context::Settings;
pub use error::{Error, Result};
pub use reactor::{PollToken, Reactor, Remote};
pub use report::Entry;
pub use run::{run, run_with_specific_server, NameService};
pub use transport::{Transport, DEFAULT_TIMEOUT};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
