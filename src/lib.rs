//! deskctl library exports for the binary, integration tests and fuzzing.

pub mod api;
pub mod bluetooth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod daemon;

// Re-export commonly used types for convenience
pub use bluetooth::{AdapterStatus, BluetoothBackend, BluetoothError};
pub use config::Config;
