//! Shared fixtures for broker unit tests.

use std::sync::Arc;
use std::time::Duration;

use harness_coordination::client::CoordinationClient;
use harness_coordination::server::CoordinationServer;
use harness_coordination::tree::CreateMode;
use harness_core::config::{CoordinationConfig, HarnessConfig};
use harness_core::lifecycle::EmbeddedService;

use crate::config::ServerConfig;
use crate::metadata::{self, BrokerRegistration};

/// A running coordination server plus one client session.
pub struct CoordinationFixture {
    pub dir: tempfile::TempDir,
    pub server: CoordinationServer,
    client: Arc<CoordinationClient>,
}

impl CoordinationFixture {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let server = CoordinationServer::new(CoordinationConfig {
            data_dir: dir.path().join("coordination").display().to_string(),
            ..CoordinationConfig::default()
        });
        server.start().await.unwrap();
        let client = CoordinationClient::connect(
            &server.connect_string().unwrap(),
            Duration::from_secs(5),
            Duration::from_secs(6),
        )
        .await
        .unwrap();
        Self {
            dir,
            server,
            client: Arc::new(client),
        }
    }

    /// Start and register placeholder brokers under `/brokers/ids`.
    pub async fn with_brokers(ids: &[i32]) -> Self {
        let fixture = Self::start().await;
        for path in metadata::BASE_PATHS {
            fixture
                .client
                .create(path, "", CreateMode::Persistent)
                .await
                .unwrap();
        }
        for id in ids {
            let registration = BrokerRegistration::new("127.0.0.1", 9092 + *id as u16, 0);
            fixture
                .client
                .create(
                    &metadata::broker_path(*id),
                    &serde_json::to_string(&registration).unwrap(),
                    CreateMode::Ephemeral,
                )
                .await
                .unwrap();
        }
        fixture
    }

    pub fn client(&self) -> Arc<CoordinationClient> {
        Arc::clone(&self.client)
    }

    /// Broker settings pointing at this coordination server.
    pub fn server_config(&self) -> ServerConfig {
        let mut settings = HarnessConfig::default();
        settings.broker.log_dirs = vec![self.dir.path().join("logs").display().to_string()];
        settings.broker.controller_poll_interval_ms = 20;
        ServerConfig::from_core(&settings, &self.server.connect_string().unwrap())
    }

    pub async fn stop(self) {
        self.client.close().await;
        self.server.shutdown().await.unwrap();
    }
}
