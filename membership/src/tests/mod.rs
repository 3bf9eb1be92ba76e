//! Crate-internal scenario tests.
//!
//! Nodes run on a [`crate::transport::MemoryNetwork`] under paused tokio time,
//! so timer-driven behavior is deterministic and fast.

mod cluster;
mod test_utils;
