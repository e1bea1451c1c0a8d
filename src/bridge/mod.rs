//! Utilities for bridging to `hyper` traits from tokio.

/// Bridge [hyper] and [tokio] I/O traits
pub mod io;
