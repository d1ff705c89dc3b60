//! Live signals the acquisition filters read
//!
//! Monitors own the I/O (TCP probes, database pings) and publish their latest
//! observation through a `watch` channel, so filters can answer from memory.

mod connectivity;
mod storage;

pub use connectivity::{watch_recovery, ConnectivityMonitor, TcpConnectivityMonitor};
pub use storage::{StorageMonitor, StorageStatus};
