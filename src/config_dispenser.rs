// afc-server: Per-ruleset AFC Config dispenser

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::PgPool;

use crate::error::{AfcError, AfcResult};
use crate::regions;

/// Read-through source of AFC Configs
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Loads the config for a ruleset; `None` when the ruleset is unknown
    async fn fetch(&self, ruleset: &str) -> AfcResult<Option<Value>>;
}

/// Config rows of the registration database, keyed by their region string
pub struct PgConfigSource {
    pool: PgPool,
}

impl PgConfigSource {
    pub fn new(pool: PgPool) -> PgConfigSource {
        PgConfigSource { pool }
    }
}

#[async_trait]
impl ConfigSource for PgConfigSource {
    async fn fetch(&self, ruleset: &str) -> AfcResult<Option<Value>> {
        let Some(region) = regions::ruleset_to_region(ruleset) else {
            return Ok(None);
        };
        let row: Option<(Value,)> = sqlx::query_as(
            "SELECT config FROM \"AFCConfig\" WHERE config->>'regionStr' = $1",
        )
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(config,)| config))
    }
}

struct CfgInfo {
    /// `None` is cached too: an unknown ruleset is not re-queried until
    /// its retention passes
    config: Option<Value>,
    retention: Instant,
}

/// Holds and dispenses per-ruleset configs, reacquiring them from the
/// source when their retention deadline passes. Concurrent misses may load
/// the same config twice; the load is idempotent.
pub struct ConfigDispenser {
    source: Arc<dyn ConfigSource>,
    refresh_interval: Duration,
    cfg_infos: DashMap<String, CfgInfo>,
}

impl ConfigDispenser {
    pub fn new(source: Arc<dyn ConfigSource>, refresh_interval: Duration) -> ConfigDispenser {
        ConfigDispenser {
            source,
            refresh_interval,
            cfg_infos: DashMap::new(),
        }
    }

    /// Returns the config for a ruleset, `None` if the ruleset is unknown.
    /// Fails with `Timeout` when the deadline passes before the load
    /// completes. A derived region's config is returned with its
    /// `regionStr` rewritten to the base region; the retained copy is
    /// unchanged.
    pub async fn get_config(&self, ruleset: &str, deadline: Instant) -> AfcResult<Option<Value>> {
        if let Some(info) = self.cfg_infos.get(ruleset) {
            if info.retention > Instant::now() {
                return Ok(info.config.clone().map(rewrite_derived_region));
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AfcError::Timeout);
        }
        let config = tokio::time::timeout(remaining, self.source.fetch(ruleset))
            .await
            .map_err(|_| AfcError::Timeout)??;
        self.cfg_infos.insert(
            ruleset.to_string(),
            CfgInfo {
                config: config.clone(),
                retention: Instant::now() + self.refresh_interval,
            },
        );
        Ok(config.map(rewrite_derived_region))
    }
}

/// Substitutes the base region into a derived region's config copy
fn rewrite_derived_region(mut config: Value) -> Value {
    let region = config
        .get("regionStr")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(region) = region {
        if let Some(base) = regions::overwrite_region(&region) {
            config["regionStr"] = Value::String(base);
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MapConfigSource {
        configs: HashMap<String, Value>,
        fetches: AtomicUsize,
    }

    impl MapConfigSource {
        fn new(configs: Vec<(&str, Value)>) -> MapConfigSource {
            MapConfigSource {
                configs: configs
                    .into_iter()
                    .map(|(ruleset, config)| (ruleset.to_string(), config))
                    .collect(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ConfigSource for MapConfigSource {
        async fn fetch(&self, ruleset: &str) -> AfcResult<Option<Value>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.configs.get(ruleset).cloned())
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_cached_within_retention() {
        let source = Arc::new(MapConfigSource::new(vec![(
            "US_47_CFR_PART_15_SUBPART_E",
            json!({"rulesetId": "US_47_CFR_PART_15_SUBPART_E", "regionStr": "US"}),
        )]));
        let dispenser = ConfigDispenser::new(source.clone(), Duration::from_secs(60));
        for _ in 0..3 {
            let config = dispenser
                .get_config("US_47_CFR_PART_15_SUBPART_E", deadline())
                .await
                .unwrap();
            assert!(config.is_some());
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_retention_reloads() {
        let source = Arc::new(MapConfigSource::new(vec![(
            "US_47_CFR_PART_15_SUBPART_E",
            json!({"regionStr": "US"}),
        )]));
        let dispenser = ConfigDispenser::new(source.clone(), Duration::from_millis(10));
        dispenser
            .get_config("US_47_CFR_PART_15_SUBPART_E", deadline())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispenser
            .get_config("US_47_CFR_PART_15_SUBPART_E", deadline())
            .await
            .unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_ruleset_cached_as_absent() {
        let source = Arc::new(MapConfigSource::new(vec![]));
        let dispenser = ConfigDispenser::new(source.clone(), Duration::from_secs(60));
        assert!(dispenser
            .get_config("NO_SUCH_RULESET", deadline())
            .await
            .unwrap()
            .is_none());
        assert!(dispenser
            .get_config("NO_SUCH_RULESET", deadline())
            .await
            .unwrap()
            .is_none());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out() {
        let source = Arc::new(MapConfigSource::new(vec![]));
        let dispenser = ConfigDispenser::new(source, Duration::from_secs(60));
        let result = dispenser
            .get_config("US_47_CFR_PART_15_SUBPART_E", Instant::now())
            .await;
        assert!(matches!(result, Err(AfcError::Timeout)));
    }

    #[tokio::test]
    async fn test_derived_region_rewritten_in_returned_copy_only() {
        let source = Arc::new(MapConfigSource::new(vec![(
            "TEST_US_47_CFR_PART_15_SUBPART_E",
            json!({"rulesetId": "TEST_US_47_CFR_PART_15_SUBPART_E", "regionStr": "TEST_US"}),
        )]));
        let dispenser = ConfigDispenser::new(source, Duration::from_secs(60));
        let config = dispenser
            .get_config("TEST_US_47_CFR_PART_15_SUBPART_E", deadline())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config["regionStr"], "US");
        // The retained copy still carries the derived region
        let stored = dispenser
            .cfg_infos
            .get("TEST_US_47_CFR_PART_15_SUBPART_E")
            .unwrap()
            .config
            .clone()
            .unwrap();
        assert_eq!(stored["regionStr"], "TEST_US");
    }
}
