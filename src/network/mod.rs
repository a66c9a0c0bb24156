//! Network Layer
//!
//! Factory for blocking TCP clients plus a session registry. Every
//! connected client is registered as a cancellable session: cancelling a
//! session shuts the socket down so a worker blocked on it exits with an
//! I/O error.

mod client;

pub use client::BlockingClient;

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Per-node network context
pub struct Network {
    listen_host: String,
    listen_port: u16,
    sessions: Mutex<HashMap<u64, TcpStream>>,
    next_session_id: AtomicU64,
}

impl Network {
    /// Create a network context advertising the given coordinates
    pub fn new(listen_host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            listen_host: listen_host.into(),
            listen_port,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
        }
    }

    /// Address other nodes use to reach this one
    pub fn ip(&self) -> &str {
        &self.listen_host
    }

    /// Port other nodes use to reach this one
    pub fn port(&self) -> u16 {
        self.listen_port
    }

    /// Create an unconnected blocking client with the given line/frame
    /// capacity
    pub fn create_blocking_client(self: &Arc<Self>, capacity: usize) -> BlockingClient {
        BlockingClient::new(Arc::clone(self), capacity)
    }

    /// Shut down the socket behind a session, forcing its owner out of any
    /// blocking read or write
    pub fn cancel_session(&self, session_id: u64) -> Result<()> {
        let sessions = self.sessions.lock();
        let stream = sessions
            .get(&session_id)
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;
        stream.shutdown(Shutdown::Both)?;
        Ok(())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn register_session(&self, stream: TcpStream) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(id, stream);
        id
    }

    pub(crate) fn deregister_session(&self, session_id: u64) {
        self.sessions.lock().remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_unknown_session() {
        let network = Arc::new(Network::new("127.0.0.1", 6380));
        assert!(matches!(
            network.cancel_session(42),
            Err(Error::NotFound(_))
        ));
    }
}
