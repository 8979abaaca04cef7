// afc-server: Worker dispatcher
//
// Hands compute jobs to the engine worker fleet: best-effort history
// artifacts to object storage, then a named-task submission on the task
// queue. The worker publishes its result to the bus queue named in the
// job, so submission is fire-and-forget.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::json;
use tracing::error;

use crate::compute::{EngineDispatcher, EngineJob};
use crate::error::AfcResult;
use crate::objst::ObjstClient;

/// Name of the task executed by engine workers
const WORKER_TASK_NAME: &str = "afc_worker.run";

/// Submits `afc_worker.run` tasks over the task queue
pub struct QueueDispatcher {
    _connection: Connection,
    channel: Channel,
    task_queue: String,
    request_type: String,
    mntroot: Option<String>,
    objst: Option<ObjstClient>,
}

impl QueueDispatcher {
    pub async fn connect(
        rmq_dsn: &str,
        task_queue: &str,
        request_type: &str,
        mntroot: Option<String>,
        objst: Option<ObjstClient>,
    ) -> AfcResult<QueueDispatcher> {
        let connection = Connection::connect(rmq_dsn, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                task_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(QueueDispatcher {
            _connection: connection,
            channel,
            task_queue: task_queue.to_string(),
            request_type: request_type.to_string(),
            mntroot,
            objst,
        })
    }

    async fn submit_task(&self, job: &EngineJob) -> AfcResult<()> {
        let (prot, host, port) = self
            .objst
            .as_ref()
            .map(ObjstClient::protocol_parts)
            .unwrap_or_else(|| ("http".to_string(), "localhost".to_string(), 80));
        let kwargs = json!({
            "prot": prot,
            "host": host,
            "port": port,
            "request_type": self.request_type,
            "task_id": job.task_id,
            "hash_val": job.req_cfg_digest,
            "config_path": null,
            "history_dir": job.history_dir,
            "runtime_opts": job.runtime_opts,
            "mntroot": self.mntroot,
            "rcache_queue": job.response_queue,
            "request_str": job.request_str,
            "config_str": job.config_str,
            "deadline": job.deadline_epoch,
        });
        let body = serde_json::to_vec(&json!([
            [],
            kwargs,
            {"callbacks": null, "errbacks": null, "chain": null, "chord": null}
        ]))?;
        let mut headers = FieldTable::default();
        headers.insert("lang".into(), AMQPValue::LongString("py".into()));
        headers.insert(
            "task".into(),
            AMQPValue::LongString(WORKER_TASK_NAME.into()),
        );
        headers.insert("id".into(), AMQPValue::LongString(job.task_id.clone().into()));
        headers.insert(
            "root_id".into(),
            AMQPValue::LongString(job.task_id.clone().into()),
        );
        self.channel
            .basic_publish(
                "",
                &self.task_queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_content_encoding("utf-8".into())
                    .with_headers(headers)
                    .with_correlation_id(job.task_id.clone().into())
                    .with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EngineDispatcher for QueueDispatcher {
    async fn dispatch(&self, job: EngineJob) {
        if let (Some(objst), Some(history_dir)) = (&self.objst, &job.history_dir) {
            for (name, content) in [
                ("analysisRequest.json", &job.request_str),
                ("afc_config.json", &job.config_str),
            ] {
                if let Err(err) = objst.put(history_dir, name, content).await {
                    error!("Failed to write request history to object store: {err}");
                }
            }
        }
        if let Err(err) = self.submit_task(&job).await {
            error!("Failed to send request to engine worker: {err}");
        }
    }
}
