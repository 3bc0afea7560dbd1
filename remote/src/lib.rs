//! Worker process plumbing for the MFT tools
//!
//! The `mcp` and `mrm` drivers split a manifest into contiguous ranges and hand each range to an
//! `mcpd` worker process:
//!
//! - [`streams`]: length-delimited bincode frames over any async byte stream
//! - [`protocol`]: the hello, requests and responses exchanged with a worker
//! - [`pool`]: locating, spawning and talking to worker processes
//! - [`driver`]: partitioning a manifest and merging the workers' results
//!
//! Workers log to the stderr they inherit from the driver, stdout is reserved for protocol
//! frames.

pub mod driver;
pub mod pool;
pub mod protocol;
pub mod streams;
