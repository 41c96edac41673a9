//! mungr — point-to-point media library replication
//!
//! A publisher pushes items a subscriber is missing, batch by batch, choosing
//! destinations by free space. The subscriber is either the local filesystem
//! or a daemon reached over an authenticated line protocol.

pub mod differ;
pub mod engine;
pub mod error;
pub mod keyed;
pub mod model;
pub mod report;
pub mod server;
pub mod session;
pub mod storage;
pub mod transfer;
