//! Worker consumer: drives a job through its status state machine.
//!
//! Messages are delivered at least once. Per message:
//!
//! 1. read the job; if it is already `COMPLETED`, ack and stop;
//! 2. claim it (`PROCESSING`) against the version just read;
//! 3. fetch the source, run the pipeline, store the artifact;
//! 4. commit `COMPLETED` or `FAILED` with the claimed version, then ack.
//!
//! Processing faults always end in a terminal row and an ack. Only a job store that
//! cannot be reached leaves the message for redelivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::db::store::{JobStore, StoreError};
use crate::models::directive::parse_lenient;
use crate::models::job::{JobId, JobStatus};
use crate::services::fetch::{FetchError, ImageFetcher};
use crate::services::pipeline::{TransformError, TransformPool};
use crate::services::queue::{Delivery, WorkMessage, WorkQueue};
use crate::services::storage::{result_key, ArtifactStore, StorageError};

/// What to do with a delivery once handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

/// How a single message was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { result_ref: String },
    Failed { error_detail: String },
    /// Idempotency guard hit: the job was already `COMPLETED`.
    AlreadyCompleted,
    /// Another consumer wrote the job first; this attempt gave up ownership.
    Superseded,
    /// No job row exists for the message's id.
    UnknownJob,
}

/// A fault in the fetch/transform/persist chain, recorded as the job's error detail.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Download(#[from] FetchError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Failed to store result: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// Longest undecodable payload prefix written to the log.
const PAYLOAD_LOG_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_in_flight: usize,
    pub poll_interval: Duration,
    /// A delivered message left unacked this long is taken over by any consumer.
    pub visibility_timeout: Duration,
}

pub struct JobConsumer {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn ImageFetcher>,
    artifacts: Arc<dyn ArtifactStore>,
    transforms: TransformPool,
}

impl JobConsumer {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn ImageFetcher>,
        artifacts: Arc<dyn ArtifactStore>,
        transforms: TransformPool,
    ) -> Self {
        Self {
            store,
            fetcher,
            artifacts,
            transforms,
        }
    }

    /// Handle one delivery and decide whether it may be acknowledged.
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let message = match delivery.decode() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    message_id = delivery.id(),
                    payload_len = delivery.payload().len(),
                    payload = truncate(delivery.payload(), PAYLOAD_LOG_LIMIT),
                    "Dropping undecodable message"
                );
                metrics::counter!("image_jobs_malformed_messages_total").increment(1);
                return Disposition::Ack;
            }
        };

        let start = Instant::now();
        match self.process(&message).await {
            Ok(outcome) => {
                record_outcome(message.job_id, &outcome, start.elapsed());
                Disposition::Ack
            }
            Err(e) => {
                tracing::error!(job_id = %message.job_id, error = %e, "Job store unavailable, message will be redelivered");
                Disposition::Requeue
            }
        }
    }

    /// Run the state machine for one message.
    pub async fn process(&self, message: &WorkMessage) -> Result<Outcome, ConsumeError> {
        let job_id = message.job_id;

        let Some(job) = self.store.get(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Message refers to an unknown job");
            return Ok(Outcome::UnknownJob);
        };

        if job.status == JobStatus::Completed {
            tracing::info!(job_id = %job_id, "Job already completed, skipping redelivered message");
            return Ok(Outcome::AlreadyCompleted);
        }

        let Some(version) = self.store.claim(job_id, job.version).await? else {
            tracing::info!(job_id = %job_id, "Lost claim to another consumer");
            return Ok(Outcome::Superseded);
        };

        tracing::info!(job_id = %job_id, source = %message.image_url, "Processing job");

        match self.run_pipeline(message).await {
            Ok(result_ref) => {
                if self.store.complete(job_id, version, &result_ref).await? {
                    Ok(Outcome::Completed { result_ref })
                } else {
                    Ok(Outcome::Superseded)
                }
            }
            Err(e) => {
                let error_detail = e.to_string();
                if self.store.fail(job_id, version, &error_detail).await? {
                    Ok(Outcome::Failed { error_detail })
                } else {
                    Ok(Outcome::Superseded)
                }
            }
        }
    }

    async fn run_pipeline(&self, message: &WorkMessage) -> Result<String, ProcessingError> {
        tracing::debug!(job_id = %message.job_id, "Downloading source image");
        let source = self.fetcher.fetch(&message.image_url).await?;

        let directives = parse_lenient(&message.transformations);
        tracing::debug!(
            job_id = %message.job_id,
            bytes = source.len(),
            directives = directives.len(),
            "Transforming image"
        );
        let output = self.transforms.run(source, directives).await?;

        Ok(self.artifacts.put(&result_key(message.job_id), &output).await?)
    }

    /// Consume from `queue` until `shutdown` flips to true, then drain in-flight work.
    ///
    /// At most `max_in_flight` messages are handled at once. Pending messages idle past
    /// the visibility timeout are reclaimed ahead of new ones.
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<dyn WorkQueue>,
        settings: ConsumerSettings,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let max_in_flight = settings.max_in_flight.max(1);
        let slots = Arc::new(Semaphore::new(max_in_flight));
        let reclaim_every = (settings.visibility_timeout / 2).max(settings.poll_interval);
        let mut last_reclaim: Option<Instant> = None;
        let mut backlog: VecDeque<Delivery> = VecDeque::new();
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            if backlog.is_empty() && last_reclaim.map_or(true, |at| at.elapsed() >= reclaim_every) {
                last_reclaim = Some(Instant::now());
                match queue.reclaim(settings.visibility_timeout, max_in_flight).await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        tracing::warn!(count = reclaimed.len(), "Reclaimed messages idle past the visibility timeout");
                        metrics::counter!("image_jobs_reclaimed_messages_total")
                            .increment(reclaimed.len() as u64);
                        backlog.extend(reclaimed);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Failed to reclaim idle messages"),
                }
            }

            let next = match backlog.pop_front() {
                Some(delivery) => Ok(Some(delivery)),
                None => queue.consume().await,
            };

            match next {
                Ok(Some(delivery)) => {
                    let consumer = Arc::clone(&self);
                    let queue = Arc::clone(&queue);
                    let backoff = settings.poll_interval;
                    tasks.spawn(async move {
                        let _permit = permit;
                        let disposition = consumer.handle(&delivery).await;
                        settle(queue.as_ref(), &delivery, disposition, backoff).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tracing::trace!("No jobs available, sleeping");
                    tokio::select! {
                        _ = sleep(settings.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to read from queue, will retry");
                    tokio::select! {
                        _ = sleep(settings.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Message task panicked");
                }
            }
        }

        if !backlog.is_empty() {
            tracing::info!(count = backlog.len(), "Leaving reclaimed messages pending for another consumer");
        }
        tracing::info!(in_flight = tasks.len(), "Draining in-flight messages");
        while tasks.join_next().await.is_some() {}
    }
}

async fn settle(queue: &dyn WorkQueue, delivery: &Delivery, disposition: Disposition, backoff: Duration) {
    let result = match disposition {
        Disposition::Ack => queue.ack(delivery).await,
        Disposition::Requeue => {
            sleep(backoff).await;
            queue.requeue(delivery).await
        }
    };

    // Still pending; reclaimed once the visibility timeout passes
    if let Err(e) = result {
        tracing::error!(error = %e, message_id = delivery.id(), ?disposition, "Failed to settle message");
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn record_outcome(job_id: JobId, outcome: &Outcome, elapsed: Duration) {
    match outcome {
        Outcome::Completed { result_ref } => {
            metrics::counter!("image_jobs_completed_total").increment(1);
            metrics::histogram!("image_jobs_processing_seconds").record(elapsed.as_secs_f64());
            tracing::info!(
                job_id = %job_id,
                result_ref = %result_ref,
                duration_ms = elapsed.as_millis() as u64,
                "Job completed"
            );
        }
        Outcome::Failed { error_detail } => {
            metrics::counter!("image_jobs_failed_total").increment(1);
            metrics::histogram!("image_jobs_processing_seconds").record(elapsed.as_secs_f64());
            tracing::warn!(job_id = %job_id, error = %error_detail, "Job failed");
        }
        Outcome::AlreadyCompleted | Outcome::Superseded => {
            metrics::counter!("image_jobs_duplicate_deliveries_total").increment(1);
        }
        Outcome::UnknownJob => {}
    }
}
