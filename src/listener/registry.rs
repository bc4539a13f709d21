use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{ListenerError, ListenerMultiplexer};
use crate::domain::Protocol;

/// What a source needs from whoever owns the shared listeners.
pub trait ListenerProvider: Send + Sync {
    /// Returns the listener for (protocol, port), binding it on first use.
    fn get_or_create_listener(
        &self,
        protocol: Protocol,
        port: u16,
    ) -> Result<Arc<ListenerMultiplexer>, ListenerError>;

    /// Closes the listener once no source routes through it any more.
    fn release_listener(&self, protocol: Protocol, port: u16);
}

pub fn listener_key(protocol: Protocol, port: u16) -> String {
    format!("{port}:{protocol}")
}

/// Owns every shared listener of one process, keyed `"port:PROTOCOL"`.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<String, Arc<ListenerMultiplexer>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, protocol: Protocol, port: u16) -> Option<Arc<ListenerMultiplexer>> {
        self.listeners
            .lock()
            .get(&listener_key(protocol, port))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.listeners.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Closes every listener and waits for the sockets to be released.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.listeners.lock().drain().collect();
        for (_, listener) in drained {
            listener.close().await;
        }
    }
}

impl ListenerProvider for ListenerRegistry {
    fn get_or_create_listener(
        &self,
        protocol: Protocol,
        port: u16,
    ) -> Result<Arc<ListenerMultiplexer>, ListenerError> {
        let key = listener_key(protocol, port);
        let mut listeners = self.listeners.lock();
        if let Some(existing) = listeners.get(&key)
            && existing.is_running()
        {
            return Ok(Arc::clone(existing));
        }

        let listener = Arc::new(ListenerMultiplexer::start(protocol, port)?);
        listeners.insert(key, Arc::clone(&listener));
        Ok(listener)
    }

    fn release_listener(&self, protocol: Protocol, port: u16) {
        let key = listener_key(protocol, port);
        let mut listeners = self.listeners.lock();
        let idle = listeners
            .get(&key)
            .is_some_and(|listener| listener.source_count() == 0);
        if idle && let Some(listener) = listeners.remove(&key) {
            listener.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(listener_key(Protocol::Udp, 514), "514:UDP");
        assert_eq!(listener_key(Protocol::Tcp, 6514), "6514:TCP");
    }

    #[tokio::test]
    async fn idle_listener_is_released() {
        let registry = ListenerRegistry::new();
        // Bind an ephemeral port first to find a free one.
        let probe = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let first = registry.get_or_create_listener(Protocol::Udp, port).unwrap();
        let second = registry.get_or_create_listener(Protocol::Udp, port).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.keys(), vec![format!("{port}:UDP")]);

        registry.release_listener(Protocol::Udp, port);
        assert!(registry.is_empty());
        assert!(!first.is_running());
    }
}
