//! Application context
//!
//! Every service is built once, here, from a validated [`RelayConfig`].
//! Nothing runs in the background until the server starts the channel service.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::ChannelCatalog;
use crate::channel::ChannelService;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::notify::BroadcastNotifier;
use crate::selector::{StreamLimitsService, StreamSelector};
use crate::server::RelayServer;
use crate::source::{DefaultConnector, SourceRegistry, UpstreamConnector};

/// Capacity of the channel event channel
const EVENT_CAPACITY: usize = 256;

/// Fully wired relay
pub struct RelayContext {
    config: RelayConfig,
    limits: Arc<StreamLimitsService>,
    sources: Arc<SourceRegistry>,
    selector: Arc<StreamSelector>,
    notifier: Arc<BroadcastNotifier>,
    service: Arc<ChannelService>,
}

impl RelayContext {
    /// Wire the relay with the production upstream connector
    pub fn initialize(config: RelayConfig) -> Result<Self> {
        let connector = DefaultConnector::new(Duration::from_millis(
            config.streaming.upstream_connect_timeout_ms,
        ))?
        .with_chunk_size(config.streaming.chunk_size);

        Self::with_connector(config, Arc::new(connector))
    }

    /// Wire the relay around a custom upstream connector
    pub fn with_connector(
        config: RelayConfig,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let catalog: Arc<dyn ChannelCatalog> = Arc::new(config.catalog()?);
        let limits = Arc::new(StreamLimitsService::new(&config.source_files));
        let sources = Arc::new(SourceRegistry::new(
            connector,
            Arc::clone(&limits),
            config.source_settings(),
        ));

        let selector = Arc::new(StreamSelector::new(
            Arc::clone(&catalog),
            Arc::new(config.profile_table()?),
            Arc::new(config.playlists()),
            Arc::clone(&limits) as _,
            config.selection_policy(),
        ));
        selector.set_message_stream(config.message_no_streams_left.clone());

        let notifier = Arc::new(BroadcastNotifier::new(EVENT_CAPACITY));
        let service = Arc::new(ChannelService::new(
            catalog,
            Arc::clone(&selector),
            Arc::clone(&sources) as _,
            Arc::clone(&notifier) as _,
            config.service_settings(),
        ));

        tracing::info!(
            channels = config.channels.len(),
            source_files = config.source_files.len(),
            intro_policy = ?config.streaming.intro_policy,
            "Relay initialized"
        );

        Ok(Self {
            config,
            limits,
            sources,
            selector,
            notifier,
            service,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn limits(&self) -> &Arc<StreamLimitsService> {
        &self.limits
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn selector(&self) -> &Arc<StreamSelector> {
        &self.selector
    }

    pub fn notifier(&self) -> &Arc<BroadcastNotifier> {
        &self.notifier
    }

    pub fn service(&self) -> &Arc<ChannelService> {
        &self.service
    }

    /// HTTP server over this context's channel service
    pub fn server(&self) -> Result<RelayServer> {
        Ok(RelayServer::new(
            self.config.server_config()?,
            Arc::clone(&self.service),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ClientConnection;
    use crate::error::Error;

    const CONFIG: &str = r#"{
        "source_files": [{ "id": 1, "name": "provider", "max_streams": 1 }],
        "channels": [
            { "id": 1, "name": "Local", "streams": [
                { "id": "f", "name": "File", "url": "/nonexistent/relay-test.ts", "source_file_id": 1 }
            ]}
        ]
    }"#;

    #[tokio::test]
    async fn test_initialize_wires_services() {
        let context = RelayContext::initialize(RelayConfig::from_json(CONFIG).unwrap()).unwrap();

        assert_eq!(context.service().channel_count(), 0);
        assert!(context.sources().is_empty());
        assert_eq!(context.limits().current(1), 0);
        assert_eq!(context.server().unwrap().bind_addr().port(), 8080);
        assert!(context.service().has_channel(1).await);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_exhausts_attempts() {
        let mut config = RelayConfig::from_json(CONFIG).unwrap();
        config.streaming.retry_delay_ms = 0;
        let context = RelayContext::initialize(config).unwrap();
        let client = Arc::new(ClientConnection::new(1));

        let err = context.service().attach_client(client, 1).await.unwrap_err();

        assert!(matches!(err, Error::SourceCreationExhausted { attempts: 4, .. }));
        // Failed connects never hold a source-file slot
        assert_eq!(context.limits().current(1), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RelayConfig::default();
        config.streaming.buffer_capacity = 0;
        assert!(RelayContext::initialize(config).is_err());
    }
}
