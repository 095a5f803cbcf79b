//! Stafford is a small telemetry pipeline: an agent that samples host and
//! process measurements on a schedule and ships them upstream, and a server
//! that verifies, stores and serves them back. The two halves speak JSON over
//! either HTTP or stafford's native length-prefixed TCP protocol.
//!
//! Why you might choose to use stafford:
//!
//!  * You want one static binary on each host and one at the sink, no more.
//!  * You need counters that accumulate and gauges that overwrite, with the
//!    same rules no matter which transport or storage backend is in play.
//!  * You want tamper-evident batches (keyed signatures) and, optionally,
//!    encrypted payloads without standing up TLS infrastructure.
//!  * You need the in-memory store to survive restarts via file backups, or
//!    a relational backend when the host already has one.
#![allow(unknown_lints)]
#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
extern crate quickcheck;

pub mod agent;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod metric;
pub mod protocols;
pub mod server;
pub mod store;
pub mod thread;
