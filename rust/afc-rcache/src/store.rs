// afc-rcache: Cache store trait and Postgres/PostGIS implementation

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::QueryBuilder;
use tracing::warn;

use crate::error::RcacheResult;
use crate::models::{ApPk, ApRecord, FuncSwitch, LatLonRect, RespState};

/// Maximum number of bind parameters Postgres accepts in one statement
const MAX_UPDATE_FIELDS: usize = 32767;

/// Columns per `aps` row
const AP_COLUMNS: usize = 11;

/// Storage operations shared by the coordinator and the cache service.
///
/// Implemented by [`PgCacheStore`] for production and by an in-memory
/// double in the `testing` module.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns responses of Valid, non-expired rows keyed by digest
    async fn lookup(&self, digests: &[String]) -> RcacheResult<HashMap<String, String>>;

    /// Returns the stored response for a digest regardless of row state
    async fn get_response(&self, digest: &str) -> RcacheResult<Option<String>>;

    /// UPSERTs the given rows, chunked to the bind-parameter bound
    async fn update_cache(&self, records: Vec<ApRecord>) -> RcacheResult<()>;

    /// Maximum number of rows in one UPSERT
    fn max_update_records(&self) -> usize {
        MAX_UPDATE_FIELDS / AP_COLUMNS
    }

    /// Marks up to `limit` rows Invalid, all rows or one config ruleset.
    /// Returns the number of affected rows so callers can drain in chunks.
    async fn invalidate(&self, ruleset: Option<&str>, limit: i64) -> RcacheResult<u64>;

    /// Marks Valid rows whose point lies within `rect` Invalid
    async fn spatial_invalidate(&self, rect: &LatLonRect) -> RcacheResult<u64>;

    async fn num_invalid(&self) -> RcacheResult<i64>;

    async fn num_precomputing(&self) -> RcacheResult<i64>;

    async fn cache_size(&self) -> RcacheResult<i64>;

    /// Atomically claims up to `limit` Invalid rows for precomputation,
    /// flipping them to Precomputing, and returns their request texts
    async fn get_invalid_reqs(&self, limit: i64) -> RcacheResult<Vec<String>>;

    /// Startup crash recovery: flips all Precomputing rows back to Invalid
    async fn reset_precomputations(&self) -> RcacheResult<u64>;

    async fn delete(&self, pk: &ApPk) -> RcacheResult<()>;

    async fn get_switch(&self, switch: FuncSwitch) -> RcacheResult<bool>;

    async fn set_switch(&self, switch: FuncSwitch, state: bool) -> RcacheResult<()>;

    /// Cheap connectivity probe
    async fn check_server(&self) -> bool;
}

/// Postgres-backed cache store
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    /// Connects a process-wide pool to the cache database
    pub async fn connect(dsn: &str, max_connections: u32) -> RcacheResult<PgCacheStore> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        Ok(PgCacheStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the `aps` and `switches` tables and their indexes if absent
    pub async fn init_schema(&self) -> RcacheResult<()> {
        if let Err(err) = sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&self.pool)
            .await
        {
            warn!("PostGIS extension not created (may already exist): {err}");
        }
        for statement in [
            "CREATE TABLE IF NOT EXISTS aps (
                serial_number TEXT NOT NULL,
                rulesets TEXT NOT NULL,
                cert_ids TEXT NOT NULL,
                state TEXT NOT NULL,
                config_ruleset TEXT NOT NULL,
                coordinates geography(POINT, 4326) NOT NULL,
                last_update TIMESTAMPTZ NOT NULL,
                req_cfg_digest TEXT NOT NULL,
                validity_period_sec DOUBLE PRECISION,
                request TEXT NOT NULL,
                response TEXT NOT NULL,
                PRIMARY KEY (serial_number, rulesets, cert_ids))",
            "CREATE UNIQUE INDEX IF NOT EXISTS aps_req_cfg_digest_idx
                ON aps (req_cfg_digest)",
            "CREATE INDEX IF NOT EXISTS aps_state_idx ON aps (state)",
            "CREATE INDEX IF NOT EXISTS aps_config_ruleset_idx ON aps (config_ruleset)",
            "CREATE INDEX IF NOT EXISTS aps_last_update_idx ON aps (last_update)",
            "CREATE INDEX IF NOT EXISTS aps_coordinates_idx ON aps USING GIST (coordinates)",
            "CREATE TABLE IF NOT EXISTS switches (
                name TEXT PRIMARY KEY,
                state BOOLEAN NOT NULL)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn try_lookup(&self, digests: &[String]) -> RcacheResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT req_cfg_digest, response FROM aps
             WHERE req_cfg_digest = ANY($1) AND state = $2
               AND (validity_period_sec IS NULL
                    OR last_update + validity_period_sec * interval '1 second' > now())",
        )
        .bind(digests.to_vec())
        .bind(RespState::Valid.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn lookup(&self, digests: &[String]) -> RcacheResult<HashMap<String, String>> {
        match self.try_lookup(digests).await {
            Ok(found) => Ok(found),
            Err(err) => {
                // Transient failure: one retry on a fresh pool connection
                warn!("Cache lookup failed, retrying once: {err}");
                self.try_lookup(digests).await
            }
        }
    }

    async fn get_response(&self, digest: &str) -> RcacheResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT response FROM aps WHERE req_cfg_digest = $1")
                .bind(digest)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(response,)| response))
    }

    async fn update_cache(&self, records: Vec<ApRecord>) -> RcacheResult<()> {
        for chunk in records.chunks(self.max_update_records()) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO aps (serial_number, rulesets, cert_ids, state, config_ruleset, \
                 coordinates, last_update, req_cfg_digest, validity_period_sec, request, response) ",
            );
            qb.push_values(chunk, |mut b, rec| {
                b.push_bind(&rec.serial_number);
                b.push_bind(&rec.rulesets);
                b.push_bind(&rec.cert_ids);
                b.push_bind(rec.state.as_str());
                b.push_bind(&rec.config_ruleset);
                b.push("ST_SetSRID(ST_MakePoint(");
                b.push_bind_unseparated(rec.lon);
                b.push_unseparated(", ");
                b.push_bind_unseparated(rec.lat);
                b.push_unseparated("), 4326)::geography");
                b.push_bind(rec.last_update);
                b.push_bind(&rec.req_cfg_digest);
                b.push_bind(rec.validity_period_sec);
                b.push_bind(&rec.request);
                b.push_bind(&rec.response);
            });
            qb.push(
                " ON CONFLICT (serial_number, rulesets, cert_ids) DO UPDATE SET \
                 state = EXCLUDED.state, config_ruleset = EXCLUDED.config_ruleset, \
                 coordinates = EXCLUDED.coordinates, last_update = EXCLUDED.last_update, \
                 req_cfg_digest = EXCLUDED.req_cfg_digest, \
                 validity_period_sec = EXCLUDED.validity_period_sec, \
                 request = EXCLUDED.request, response = EXCLUDED.response",
            );
            qb.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn invalidate(&self, ruleset: Option<&str>, limit: i64) -> RcacheResult<u64> {
        let result = match ruleset {
            Some(ruleset) => {
                sqlx::query(
                    "UPDATE aps SET state = $1
                     WHERE (serial_number, rulesets, cert_ids) IN (
                        SELECT serial_number, rulesets, cert_ids FROM aps
                        WHERE state <> $1 AND config_ruleset = $2 LIMIT $3)",
                )
                .bind(RespState::Invalid.as_str())
                .bind(ruleset)
                .bind(limit)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE aps SET state = $1
                     WHERE (serial_number, rulesets, cert_ids) IN (
                        SELECT serial_number, rulesets, cert_ids FROM aps
                        WHERE state <> $1 LIMIT $2)",
                )
                .bind(RespState::Invalid.as_str())
                .bind(limit)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn spatial_invalidate(&self, rect: &LatLonRect) -> RcacheResult<u64> {
        let result = sqlx::query(
            "UPDATE aps SET state = $1
             WHERE state = $2
               AND ST_Covers(ST_MakeEnvelope($3, $4, $5, $6, 4326)::geography, coordinates)",
        )
        .bind(RespState::Invalid.as_str())
        .bind(RespState::Valid.as_str())
        .bind(rect.min_lon)
        .bind(rect.min_lat)
        .bind(rect.max_lon)
        .bind(rect.max_lat)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn num_invalid(&self) -> RcacheResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT count(*) FROM aps WHERE state = $1")
                .bind(RespState::Invalid.as_str())
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn num_precomputing(&self) -> RcacheResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT count(*) FROM aps WHERE state = $1")
                .bind(RespState::Precomputing.as_str())
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn cache_size(&self) -> RcacheResult<i64> {
        Ok(sqlx::query_scalar("SELECT count(*) FROM aps")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn get_invalid_reqs(&self, limit: i64) -> RcacheResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "UPDATE aps SET state = $1
             WHERE (serial_number, rulesets, cert_ids) IN (
                SELECT serial_number, rulesets, cert_ids FROM aps
                WHERE state = $2 LIMIT $3)
             RETURNING request",
        )
        .bind(RespState::Precomputing.as_str())
        .bind(RespState::Invalid.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(request,)| request).collect())
    }

    async fn reset_precomputations(&self) -> RcacheResult<u64> {
        let result = sqlx::query("UPDATE aps SET state = $1 WHERE state = $2")
            .bind(RespState::Invalid.as_str())
            .bind(RespState::Precomputing.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, pk: &ApPk) -> RcacheResult<()> {
        sqlx::query(
            "DELETE FROM aps WHERE serial_number = $1 AND rulesets = $2 AND cert_ids = $3",
        )
        .bind(&pk.serial_number)
        .bind(&pk.rulesets)
        .bind(&pk.cert_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_switch(&self, switch: FuncSwitch) -> RcacheResult<bool> {
        let state: Option<bool> = sqlx::query_scalar("SELECT state FROM switches WHERE name = $1")
            .bind(switch.name())
            .fetch_optional(&self.pool)
            .await?;
        Ok(state.unwrap_or(true))
    }

    async fn set_switch(&self, switch: FuncSwitch, state: bool) -> RcacheResult<()> {
        sqlx::query(
            "INSERT INTO switches (name, state) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET state = EXCLUDED.state",
        )
        .bind(switch.name())
        .bind(state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn check_server(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
