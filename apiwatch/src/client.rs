use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;

use crate::app_config::AppConfig;
use crate::cache::Refresh;
use crate::error::{ConfigError, SinkError};
use crate::event::EventRecord;
use crate::rules::{GovernanceRule, RuleStore};

/// Acknowledgement from the delivery subsystem. The transport surfaces
/// the server's current change tokens (header-borne on the wire) so the
/// middleware can nudge the config caches without polling.
#[derive(Debug, Clone, Default)]
pub struct SinkAck {
    pub config_etag: Option<String>,
    pub rules_etag: Option<String>,
}

/// Remote configuration retrieval. Each call returns the payload plus the
/// change token it was served under.
#[async_trait]
pub trait ConfigApi: Send + Sync {
    async fn get_app_config(&self) -> Result<(AppConfig, Option<String>), ConfigError>;

    async fn get_governance_rules(
        &self,
    ) -> Result<(Vec<GovernanceRule>, Option<String>), ConfigError>;
}

/// Hands a fully-assembled event to the external delivery subsystem.
/// Batching, retry and backoff live behind this trait.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn enqueue(&self, event: EventRecord) -> Result<SinkAck, SinkError>;
}

pub(crate) struct AppConfigSource(pub Arc<dyn ConfigApi>);

#[async_trait]
impl Refresh for AppConfigSource {
    type Snapshot = AppConfig;

    async fn fetch(&self) -> Result<(AppConfig, Option<String>), ConfigError> {
        self.0.get_app_config().await
    }
}

pub(crate) struct RuleSource(pub Arc<dyn ConfigApi>);

#[async_trait]
impl Refresh for RuleSource {
    type Snapshot = RuleStore;

    async fn fetch(&self) -> Result<(RuleStore, Option<String>), ConfigError> {
        let (rules, etag) = self.0.get_governance_rules().await?;
        Ok((RuleStore::from_rules(rules), etag))
    }
}

/// Development sink that logs events instead of delivering them.
pub struct PrintSink;

#[async_trait]
impl EventSink for PrintSink {
    async fn enqueue(&self, event: EventRecord) -> Result<SinkAck, SinkError> {
        counter!("apiwatch_events_ingested_total").increment(1);
        tracing::info!(weight = event.weight, "event: {:?}", event);
        Ok(SinkAck::default())
    }
}

/// Config source serving a fixed payload; used by the tests and as a
/// stand-in when no management plane is wired up.
#[derive(Clone, Default)]
pub struct StaticConfigApi {
    pub config: AppConfig,
    pub config_etag: Option<String>,
    pub rules: Vec<GovernanceRule>,
    pub rules_etag: Option<String>,
}

#[async_trait]
impl ConfigApi for StaticConfigApi {
    async fn get_app_config(&self) -> Result<(AppConfig, Option<String>), ConfigError> {
        Ok((self.config.clone(), self.config_etag.clone()))
    }

    async fn get_governance_rules(
        &self,
    ) -> Result<(Vec<GovernanceRule>, Option<String>), ConfigError> {
        Ok((self.rules.clone(), self.rules_etag.clone()))
    }
}

/// Sink that keeps everything in memory; the test double for delivery.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<EventRecord>>>,
    ack: SinkAck,
}

impl MemorySink {
    pub fn with_ack(ack: SinkAck) -> MemorySink {
        MemorySink {
            events: Arc::default(),
            ack,
        }
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().expect("sink lock poisoned").clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn enqueue(&self, event: EventRecord) -> Result<SinkAck, SinkError> {
        self.events.lock().expect("sink lock poisoned").push(event);
        Ok(self.ack.clone())
    }
}
