//! Shared state between API handlers and daemon.

use std::sync::Arc;

use crate::bluetooth::BluetoothBackend;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Bluetooth backend (possibly disabled)
    pub bluetooth: Arc<BluetoothBackend>,
    /// API key hash for authentication (SHA-256 hex)
    pub api_key_hash: Option<String>,
}

impl ApiState {
    pub fn new(bluetooth: Arc<BluetoothBackend>, api_key_hash: Option<String>) -> Self {
        Self {
            bluetooth,
            api_key_hash,
        }
    }
}
