use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{ErrorKind, GlobalMetrics, SourceConfig, SourceMetrics};
use crate::listener::{ListenerProvider, ListenerRegistry};
use crate::sink::{DestinationProbe, TestDestinationRequest, TestDestinationResponse};
use crate::source::{PipelineSettings, SourceError, SourceRouter};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("source '{0}' already exists")]
    DuplicateName(String),
    #[error("source '{name}' conflicts with '{existing}' on {ip}:{port}/{protocol}")]
    DuplicateBinding {
        name: String,
        existing: String,
        ip: String,
        port: u16,
        protocol: crate::domain::Protocol,
    },
    #[error("source '{0}' not found")]
    UnknownSource(String),
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Source(e) => e.kind(),
            _ => ErrorKind::Configuration,
        }
    }
}

/// Owns the shared listeners and every running source of one process.
///
/// Lifecycle operations are serialized behind one lock, so a listener being
/// released by one source is never handed to another mid-teardown.
pub struct Relay {
    listeners: Arc<ListenerRegistry>,
    settings: PipelineSettings,
    sources: Mutex<BTreeMap<String, SourceRouter>>,
    probe: DestinationProbe,
}

impl Relay {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            listeners: Arc::new(ListenerRegistry::new()),
            settings,
            sources: Mutex::new(BTreeMap::new()),
            probe: DestinationProbe::new(),
        }
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Validates, starts and registers a source.
    pub async fn add_source(&self, config: SourceConfig) -> Result<(), RelayError> {
        let mut sources = self.sources.lock().await;
        check_unique(&sources, &config)?;

        let router = self.router(config);
        router.start().await?;
        sources.insert(router.name().to_string(), router);
        Ok(())
    }

    /// Stops `old_name` and starts `config` in its place. If the new
    /// definition fails to start, the old one is restarted.
    pub async fn update_source(
        &self,
        old_name: &str,
        config: SourceConfig,
    ) -> Result<(), RelayError> {
        let mut sources = self.sources.lock().await;
        let Some(old) = sources.remove(old_name) else {
            return Err(RelayError::UnknownSource(old_name.to_string()));
        };
        if let Err(e) = check_unique(&sources, &config) {
            sources.insert(old_name.to_string(), old);
            return Err(e);
        }

        old.stop().await;
        let router = self.router(config);
        match router.start().await {
            Ok(()) => {
                info!(old = %old_name, new = %router.name(), "Source updated");
                sources.insert(router.name().to_string(), router);
                Ok(())
            }
            Err(e) => {
                if let Err(restart) = old.start().await {
                    warn!(source = %old_name, error = %restart, "Failed to restore source after update failure");
                }
                sources.insert(old_name.to_string(), old);
                Err(e.into())
            }
        }
    }

    pub async fn remove_source(&self, name: &str) -> Result<(), RelayError> {
        let mut sources = self.sources.lock().await;
        let router = sources
            .remove(name)
            .ok_or_else(|| RelayError::UnknownSource(name.to_string()))?;
        router.stop().await;
        Ok(())
    }

    pub async fn source_names(&self) -> Vec<String> {
        self.sources.lock().await.keys().cloned().collect()
    }

    pub async fn source_metrics(&self) -> Vec<SourceMetrics> {
        self.sources
            .lock()
            .await
            .values()
            .map(SourceRouter::get_metrics)
            .collect()
    }

    pub async fn source_metrics_for(&self, name: &str) -> Option<SourceMetrics> {
        self.sources.lock().await.get(name).map(SourceRouter::get_metrics)
    }

    pub async fn global_metrics(&self) -> GlobalMetrics {
        let metrics = self.source_metrics().await;
        GlobalMetrics::from_sources(&metrics)
    }

    pub async fn test_destination(&self, request: &TestDestinationRequest) -> TestDestinationResponse {
        self.probe.test(request).await
    }

    /// Stops every source, then closes whatever listeners remain.
    pub async fn shutdown(&self) {
        let mut sources = self.sources.lock().await;
        let drained = std::mem::take(&mut *sources);
        join_all(drained.values().map(SourceRouter::stop)).await;
        self.listeners.shutdown().await;
        info!(sources = drained.len(), "Relay stopped");
    }

    fn router(&self, config: SourceConfig) -> SourceRouter {
        let listeners: Arc<dyn ListenerProvider> = self.listeners.clone();
        SourceRouter::new(config, self.settings.clone(), listeners)
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("listeners", &self.listeners.keys())
            .finish_non_exhaustive()
    }
}

fn check_unique(
    sources: &BTreeMap<String, SourceRouter>,
    config: &SourceConfig,
) -> Result<(), RelayError> {
    config.validate().map_err(SourceError::from)?;
    if sources.contains_key(&config.name) {
        return Err(RelayError::DuplicateName(config.name.clone()));
    }

    let peer_key = config.peer_key().map_err(SourceError::from)?;
    for existing in sources.values() {
        let other = existing.config();
        if other.port == config.port
            && other.protocol == config.protocol
            && other.peer_key().is_ok_and(|key| key == peer_key)
        {
            return Err(RelayError::DuplicateBinding {
                name: config.name.clone(),
                existing: other.name.clone(),
                ip: peer_key,
                port: config.port,
                protocol: config.protocol,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DestinationConfig, DestinationKind, HecConfig, Protocol};

    fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    fn source(name: &str, ip: &str, port: u16) -> SourceConfig {
        let mut config = SourceConfig::new(name, ip, port, Protocol::Udp);
        config.simulation_mode = true;
        config
    }

    #[tokio::test]
    async fn sources_share_one_listener() {
        let relay = Relay::new(PipelineSettings::default());
        let port = free_udp_port();

        relay.add_source(source("a", "10.0.0.1", port)).await.unwrap();
        relay.add_source(source("b", "0.0.0.0", port)).await.unwrap();

        assert_eq!(relay.listeners().keys(), vec![format!("{port}:UDP")]);
        assert_eq!(relay.source_names().await, vec!["a", "b"]);

        relay.remove_source("a").await.unwrap();
        assert_eq!(relay.listeners().len(), 1);
        relay.remove_source("b").await.unwrap();
        assert!(relay.listeners().is_empty());
    }

    #[tokio::test]
    async fn duplicates_are_rejected() {
        let relay = Relay::new(PipelineSettings::default());
        let port = free_udp_port();
        relay.add_source(source("a", "10.0.0.1", port)).await.unwrap();

        let err = relay
            .add_source(source("a", "10.0.0.2", port))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DuplicateName(_)));

        let err = relay
            .add_source(source("c", "10.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DuplicateBinding { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn ipv6_unspecified_is_the_same_wildcard() {
        let relay = Relay::new(PipelineSettings::default());
        let port = free_udp_port();
        relay.add_source(source("any4", "0.0.0.0", port)).await.unwrap();

        let err = relay.add_source(source("any6", "::", port)).await.unwrap_err();
        match err {
            RelayError::DuplicateBinding { ip, existing, .. } => {
                assert_eq!(ip, "0.0.0.0");
                assert_eq!(existing, "any4");
            }
            other => panic!("expected duplicate binding, got {other:?}"),
        }

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_destination_is_a_configuration_error() {
        let relay = Relay::new(PipelineSettings::default());
        let mut config = SourceConfig::new("bad", "0.0.0.0", free_udp_port(), Protocol::Udp);
        config.destinations.push(DestinationConfig {
            id: "hec".to_string(),
            name: String::new(),
            kind: DestinationKind::Hec(HecConfig::new("ftp://example.com", "token")),
            enabled: true,
        });

        let err = relay.add_source(config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(relay.source_names().await.is_empty());
        assert!(relay.listeners().is_empty());
    }

    #[tokio::test]
    async fn update_replaces_source() {
        let relay = Relay::new(PipelineSettings::default());
        let first = free_udp_port();
        let second = free_udp_port();
        relay.add_source(source("a", "0.0.0.0", first)).await.unwrap();

        relay
            .update_source("a", source("a2", "0.0.0.0", second))
            .await
            .unwrap();

        assert_eq!(relay.source_names().await, vec!["a2"]);
        assert_eq!(relay.listeners().keys(), vec![format!("{second}:UDP")]);

        let err = relay
            .update_source("missing", source("x", "0.0.0.0", first))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownSource(_)));
        relay.shutdown().await;
        assert!(relay.listeners().is_empty());
    }

    #[tokio::test]
    async fn global_metrics_count_sources() {
        let relay = Relay::new(PipelineSettings::default());
        let port = free_udp_port();
        relay.add_source(source("a", "10.0.0.1", port)).await.unwrap();
        relay.add_source(source("b", "10.0.0.2", port)).await.unwrap();

        let global = relay.global_metrics().await;
        assert_eq!(global.total_sources, 2);
        assert_eq!(global.active_sources, 2);
        relay.shutdown().await;
    }
}
