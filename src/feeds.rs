//! Per-feed configuration registry. Populated at startup from the
//! config file plus any admin overrides persisted in Store; lookups
//! are the only hot path; registration is idempotent on `feedId`.

use crate::errors::OracleError;
use crate::store::FileStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const FEEDS_NS: &str = "feeds";

/// `url` holds a plain URL normally, or a fingerprint to resolve
/// through the Fetcher's indirection map when `obscured` is set, so
/// log/metric surfaces never carry the true URL for that source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    pub json_path: String,
    #[serde(default)]
    pub obscured: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    Median,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub feed_id: String,
    pub sources: Vec<SourceSpec>,
    pub aggregation: AggregationKind,
    pub min_responses: usize,
    pub deviation_threshold_bps: u32,
    #[serde(with = "humantime_serde_duration")]
    pub heartbeat: Option<Duration>,
    pub decimals: u32,
    pub active: bool,
}

impl FeedConfig {
    fn validate(&self) -> Result<(), OracleError> {
        if self.min_responses == 0 {
            return Err(OracleError::Config(format!(
                "feed {}: minResponses must be positive",
                self.feed_id
            )));
        }
        if self.min_responses > self.sources.len() {
            return Err(OracleError::Config(format!(
                "feed {}: minResponses ({}) exceeds source count ({})",
                self.feed_id,
                self.min_responses,
                self.sources.len()
            )));
        }
        Ok(())
    }
}

/// Minimal duration (de)serialization: plain seconds, or `null` for
/// "no heartbeat configured".
mod humantime_serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_secs()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[derive(Default)]
pub struct FeedRegistry {
    feeds: RwLock<HashMap<String, FeedConfig>>,
}

impl FeedRegistry {
    /// Loads feeds from the config file's list, then applies any
    /// `feeds/<feedId>` admin overrides from Store (overrides win).
    pub async fn load(configured: Vec<FeedConfig>, store: &FileStore) -> Result<Arc<Self>, OracleError> {
        let registry = Arc::new(Self::default());
        for feed in configured {
            registry.register(feed).await?;
        }
        for key in store.list(FEEDS_NS)? {
            let feed: FeedConfig = store.get_json(FEEDS_NS, &key)?;
            registry.register(feed).await?;
        }
        Ok(registry)
    }

    /// Idempotent on `feedId`: registering the same id again replaces
    /// the prior config.
    pub async fn register(&self, feed: FeedConfig) -> Result<(), OracleError> {
        feed.validate()?;
        self.feeds.write().await.insert(feed.feed_id.clone(), feed);
        Ok(())
    }

    pub async fn get(&self, feed_id: &str) -> Option<FeedConfig> {
        self.feeds.read().await.get(feed_id).cloned()
    }

    pub async fn all(&self) -> Vec<FeedConfig> {
        self.feeds.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_feed(min_responses: usize, sources: usize) -> FeedConfig {
        FeedConfig {
            feed_id: "ETH-USD".to_string(),
            sources: (0..sources)
                .map(|i| SourceSpec {
                    url: format!("https://example.com/{i}"),
                    json_path: "price".to_string(),
                    obscured: false,
                })
                .collect(),
            aggregation: AggregationKind::Median,
            min_responses,
            deviation_threshold_bps: 50,
            heartbeat: Some(Duration::from_secs(3600)),
            decimals: 8,
            active: true,
        }
    }

    #[tokio::test]
    async fn rejects_min_responses_exceeding_sources() {
        let feed = sample_feed(5, 3);
        let err = feed.validate().unwrap_err();
        assert!(matches!(err, OracleError::Config(_)));
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = FeedRegistry::default();
        registry.register(sample_feed(2, 3)).await.unwrap();
        let got = registry.get("ETH-USD").await.unwrap();
        assert_eq!(got.min_responses, 2);
    }

    #[tokio::test]
    async fn registration_is_idempotent_on_feed_id() {
        let registry = FeedRegistry::default();
        registry.register(sample_feed(2, 3)).await.unwrap();
        registry.register(sample_feed(3, 3)).await.unwrap();
        assert_eq!(registry.all().await.len(), 1);
        assert_eq!(registry.get("ETH-USD").await.unwrap().min_responses, 3);
    }
}
