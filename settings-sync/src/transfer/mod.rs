//! Streaming transfers against the remote object store.

pub mod client;
pub mod progress;
pub mod progress_stream;

pub use client::{ProgressCallback, RemoteItem, StoreClient};
pub use progress::TransferProgress;
