//! Live WebSocket connection tracking.
//!
//! Each connected device has at most one socket. Writers never touch the
//! socket directly; they queue frames on the connection's channel and the
//! per-socket writer task drains it.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::core::pipeline::DispatchError;

/// Frame queued for a device's socket writer task.
#[derive(Debug, Clone)]
pub enum WsOutbound {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Cloneable handle for pushing frames to one device connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub device_id: String,
    pub session_id: String,
    sender: mpsc::Sender<WsOutbound>,
}

impl ConnectionHandle {
    pub fn new(device_id: String, session_id: String, sender: mpsc::Sender<WsOutbound>) -> Self {
        Self {
            device_id,
            session_id,
            sender,
        }
    }

    pub async fn send_text(&self, text: String) -> Result<(), DispatchError> {
        self.sender
            .send(WsOutbound::Text(text))
            .await
            .map_err(|_| self.closed())
    }

    pub async fn send_audio(&self, frame: Bytes) -> Result<(), DispatchError> {
        self.sender
            .send(WsOutbound::Binary(frame))
            .await
            .map_err(|_| self.closed())
    }

    /// Ask the writer task to close the socket. A full or already closed
    /// queue means the writer is gone, which is the same outcome.
    pub async fn close(&self) {
        let _ = self.sender.send(WsOutbound::Close).await;
    }

    fn closed(&self) -> DispatchError {
        DispatchError::Transport(format!("connection to {} is closed", self.device_id))
    }
}

/// One handle per device, replaced when the device reconnects.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the handle it displaced so the
    /// caller can close the stale socket.
    pub fn insert(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections
            .write()
            .insert(handle.device_id.clone(), handle)
    }

    /// Remove the device's connection, but only if it still belongs to
    /// `session_id`. A reconnect may already have replaced the entry, and
    /// the old socket's teardown must not evict the new one.
    pub fn remove(&self, device_id: &str, session_id: &str) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write();
        if connections
            .get(device_id)
            .is_some_and(|handle| handle.session_id == session_id)
        {
            connections.remove(device_id)
        } else {
            None
        }
    }

    pub fn get(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.connections.read().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
