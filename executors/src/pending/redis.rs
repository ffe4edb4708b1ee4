use redis::{AsyncCommands, aio::ConnectionManager};
use relayer_core::api::HealthProbe;
use relayer_core::error::OrchestratorError;
use thiserror::Error;
use uuid::Uuid;

use super::{AddOutcome, PendingJobRecord, PendingJobStore};

#[derive(Debug, Error)]
pub enum RedisPendingStoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Corrupt pending record for job {job_uuid}: {message}")]
    CorruptRecord { job_uuid: String, message: String },
}

impl From<RedisPendingStoreError> for OrchestratorError {
    fn from(err: RedisPendingStoreError) -> Self {
        OrchestratorError::StoreError {
            message: err.to_string(),
        }
    }
}

/// Shared pending store: record JSON in one hash keyed by job uuid, child
/// ordering in a per-parent sorted set scored by insertion rank. Every
/// worker sees the same watch set and records survive restarts.
pub struct RedisPendingStore {
    redis: ConnectionManager,
    namespace: Option<String>,
}

impl RedisPendingStore {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self { redis, namespace }
    }

    pub async fn connect(
        url: &str,
        namespace: Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let client = redis::Client::open(url).map_err(RedisPendingStoreError::from)?;
        let redis = client
            .get_connection_manager()
            .await
            .map_err(RedisPendingStoreError::from)?;
        Ok(Self::new(redis, namespace))
    }

    fn jobs_key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:pending:jobs", ns),
            None => "pending:jobs".to_string(),
        }
    }

    fn children_key(&self, parent_uuid: Uuid) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:pending:children:{}", ns, parent_uuid),
            None => format!("pending:children:{}", parent_uuid),
        }
    }

    // The child set lives outside the record JSON, so Lua never has to
    // re-encode a record.
    fn encode(&self, mut record: PendingJobRecord) -> Result<String, OrchestratorError> {
        record.children = Vec::new();
        Ok(serde_json::to_string(&record)?)
    }

    fn decode(&self, job_uuid: Uuid, json: &str) -> Result<PendingJobRecord, OrchestratorError> {
        serde_json::from_str(json).map_err(|e| {
            RedisPendingStoreError::CorruptRecord {
                job_uuid: job_uuid.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    async fn children_of(&self, parent_uuid: Uuid) -> Result<Vec<Uuid>, OrchestratorError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn
            .zrange(self.children_key(parent_uuid), 0, -1)
            .await
            .map_err(RedisPendingStoreError::from)?;
        let mut children = Vec::with_capacity(members.len());
        for member in members {
            match member.parse() {
                Ok(uuid) => children.push(uuid),
                Err(e) => tracing::warn!(parent = %parent_uuid, error = %e, "skipping malformed child uuid"),
            }
        }
        Ok(children)
    }
}

impl PendingJobStore for RedisPendingStore {
    async fn add(&self, record: PendingJobRecord) -> Result<AddOutcome, OrchestratorError> {
        let script = redis::Script::new(
            r#"
            local jobs_key = KEYS[1]
            local field = ARGV[1]
            local record = ARGV[2]
            local tx_hash = ARGV[3]

            local existing = redis.call('HGET', jobs_key, field)
            if existing then
                local decoded = cjson.decode(existing)
                if decoded.txHash == tx_hash then
                    return 0
                end
                redis.call('HSET', jobs_key, field, record)
                return 1
            end

            redis.call('HSET', jobs_key, field, record)
            return 2
            "#,
        );

        let job_uuid = record.job_uuid();
        let tx_hash = record.tx_hash.to_string();
        let record_json = self.encode(record)?;
        let result: i32 = script
            .key(self.jobs_key())
            .arg(job_uuid.to_string())
            .arg(record_json)
            .arg(tx_hash)
            .invoke_async(&mut self.redis.clone())
            .await
            .map_err(RedisPendingStoreError::from)?;

        match result {
            0 => Ok(AddOutcome::DuplicateHash),
            1 => Ok(AddOutcome::Replaced),
            _ => Ok(AddOutcome::Added),
        }
    }

    async fn update(&self, record: PendingJobRecord) -> Result<(), OrchestratorError> {
        let mut conn = self.redis.clone();
        let job_uuid = record.job_uuid();
        let record_json = self.encode(record)?;
        let _: () = conn
            .hset(self.jobs_key(), job_uuid.to_string(), record_json)
            .await
            .map_err(RedisPendingStoreError::from)?;
        Ok(())
    }

    async fn get(&self, job_uuid: Uuid) -> Result<Option<PendingJobRecord>, OrchestratorError> {
        let mut conn = self.redis.clone();
        let json: Option<String> = conn
            .hget(self.jobs_key(), job_uuid.to_string())
            .await
            .map_err(RedisPendingStoreError::from)?;

        let Some(json) = json else {
            return Ok(None);
        };
        let mut record = self.decode(job_uuid, &json)?;
        record.children = self.children_of(job_uuid).await?;
        Ok(Some(record))
    }

    async fn remove(
        &self,
        job_uuid: Uuid,
    ) -> Result<Option<PendingJobRecord>, OrchestratorError> {
        let record = self.get(job_uuid).await?;
        if record.is_some() {
            let mut conn = self.redis.clone();
            let _: () = conn
                .hdel(self.jobs_key(), job_uuid.to_string())
                .await
                .map_err(RedisPendingStoreError::from)?;
            let _: () = conn
                .del(self.children_key(job_uuid))
                .await
                .map_err(RedisPendingStoreError::from)?;
        }
        Ok(record)
    }

    async fn add_child(
        &self,
        parent_uuid: Uuid,
        child_uuid: Uuid,
    ) -> Result<(), OrchestratorError> {
        let script = redis::Script::new(
            r#"
            local jobs_key = KEYS[1]
            local children_key = KEYS[2]
            local field = ARGV[1]
            local child = ARGV[2]

            if redis.call('HEXISTS', jobs_key, field) == 0 then
                return 0
            end
            if not redis.call('ZSCORE', children_key, child) then
                local rank = redis.call('ZCARD', children_key)
                redis.call('ZADD', children_key, rank, child)
            end
            return 1
            "#,
        );

        let result: i32 = script
            .key(self.jobs_key())
            .key(self.children_key(parent_uuid))
            .arg(parent_uuid.to_string())
            .arg(child_uuid.to_string())
            .invoke_async(&mut self.redis.clone())
            .await
            .map_err(RedisPendingStoreError::from)?;

        if result == 0 {
            return Err(OrchestratorError::store(format!(
                "no pending record for parent job {parent_uuid}"
            )));
        }
        Ok(())
    }

    async fn children(&self, parent_uuid: Uuid) -> Result<Vec<Uuid>, OrchestratorError> {
        self.children_of(parent_uuid).await
    }

    async fn by_chain(
        &self,
        chain_uuid: Uuid,
    ) -> Result<Vec<PendingJobRecord>, OrchestratorError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn
            .hvals(self.jobs_key())
            .await
            .map_err(RedisPendingStoreError::from)?;

        let mut records = Vec::new();
        for json in values {
            let mut record: PendingJobRecord = match serde_json::from_str(&json) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping corrupt pending record");
                    continue;
                }
            };
            if record.chain_uuid() == chain_uuid {
                record.children = self.children_of(record.job_uuid()).await?;
                records.push(record);
            }
        }
        Ok(records)
    }
}

impl HealthProbe for RedisPendingStore {
    async fn ping(&self) -> Result<(), OrchestratorError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(RedisPendingStoreError::from)?;
        Ok(())
    }
}
