//! # mttsweep
//! Two-host proof-of-concept for evicting entries from the address translation cache of an
//! RDMA NIC. The server registers memory regions and advertises them, the client connects a
//! reliable queue pair to it and sweeps one-byte remote reads across every advertised bucket,
//! timing each sweep.
//!
//! The transport is reached only through [`connection::TransportProvider`]: the real ibverbs
//! provider lives behind the `rdma` feature, and [`connection::local::LocalProvider`] stands in
//! for the hardware everywhere else.

pub mod cancel;
pub mod connection;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod output;
pub mod session;
pub mod sweep;

pub use error::{Error, Result};
