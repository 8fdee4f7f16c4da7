//! In-memory collaborators for driving the services without Postgres or Redis.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use image_jobs::db::store::{JobStore, StoreError};
use image_jobs::models::job::{Job, JobId, JobStatus, NewJob};
use image_jobs::services::fetch::{FetchError, ImageFetcher};
use image_jobs::services::pipeline::TransformPool;
use image_jobs::services::queue::{Delivery, JobPublisher, QueueError, WorkMessage, WorkQueue};
use image_jobs::services::storage::{ArtifactStore, StorageError};
use image_jobs::services::worker::{ConsumerSettings, JobConsumer};

/// RGB test image encoded as PNG.
pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, 200])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode sample image");
    out.into_inner()
}

/// Job store with the same conditional-write semantics as the Postgres one.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn snapshot(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn write(
        &self,
        id: JobId,
        version: i64,
        from: &[JobStatus],
        to: JobStatus,
        result_ref: Option<&str>,
        error_detail: Option<&str>,
    ) -> Option<i64> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id)?;
        if job.version != version || !from.contains(&job.status) {
            return None;
        }
        job.status = to;
        job.result_ref = result_ref.map(str::to_string);
        job.error_detail = error_detail.map(str::to_string);
        job.version += 1;
        job.updated_at = Utc::now();
        Some(job.version)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        self.check()?;
        let now = Utc::now();
        let row = Job {
            id: job.id,
            source_ref: job.source_ref,
            directives: job.directives,
            status: JobStatus::Pending,
            result_ref: None,
            error_detail: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap().insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.check()?;
        Ok(self.snapshot(id))
    }

    async fn claim(&self, id: JobId, expected_version: i64) -> Result<Option<i64>, StoreError> {
        self.check()?;
        Ok(self.write(
            id,
            expected_version,
            &[JobStatus::Pending, JobStatus::Processing, JobStatus::Failed],
            JobStatus::Processing,
            None,
            None,
        ))
    }

    async fn complete(&self, id: JobId, version: i64, result_ref: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .write(id, version, &[JobStatus::Processing], JobStatus::Completed, Some(result_ref), None)
            .is_some())
    }

    async fn fail(&self, id: JobId, version: i64, error_detail: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .write(id, version, &[JobStatus::Processing], JobStatus::Failed, None, Some(error_detail))
            .is_some())
    }
}

/// Publisher that records messages instead of sending them.
#[derive(Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<WorkMessage>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn failing() -> Self {
        let publisher = Self::default();
        publisher.failing.store(true, Ordering::SeqCst);
        publisher
    }

    pub fn published(&self) -> Vec<WorkMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobPublisher for MemoryPublisher {
    async fn publish(&self, message: &WorkMessage) -> Result<(), QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            let err = redis::RedisError::from((redis::ErrorKind::IoError, "broker unreachable"));
            return Err(QueueError::Redis(err));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Work queue with the same pending/ack/reclaim semantics as the Redis stream.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Delivery>,
    pending: HashMap<String, (Delivery, Instant)>,
    acked: usize,
    requeued: usize,
}

impl QueueState {
    fn append(&mut self, payload: String) -> String {
        self.next_id += 1;
        let id = format!("{}-0", self.next_id);
        self.ready.push_back(Delivery::new(id.clone(), payload));
        id
    }
}

impl MemoryQueue {
    pub fn push(&self, message: &WorkMessage) -> String {
        let payload = serde_json::to_string(message).expect("encode message");
        self.state.lock().unwrap().append(payload)
    }

    pub fn acked(&self) -> usize {
        self.state.lock().unwrap().acked
    }

    pub fn requeued(&self) -> usize {
        self.state.lock().unwrap().requeued
    }

    pub fn ready(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn consume(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let Some(delivery) = state.ready.pop_front() else {
            return Ok(None);
        };
        state
            .pending
            .insert(delivery.id().to_string(), (delivery.clone(), Instant::now()));
        Ok(Some(delivery))
    }

    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut claimed = Vec::new();
        for (delivery, delivered_at) in state.pending.values_mut() {
            if claimed.len() == count {
                break;
            }
            if delivered_at.elapsed() >= min_idle {
                *delivered_at = Instant::now();
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.pending.remove(delivery.id()).is_some() {
            state.acked += 1;
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(delivery.id());
        state.append(delivery.payload().to_string());
        state.requeued += 1;
        Ok(())
    }
}

/// Serves fixed bytes per URL; anything else is a 404. Counts calls and tracks
/// how many fetches overlap.
#[derive(Default)]
pub struct StaticFetcher {
    sources: HashMap<String, Vec<u8>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl StaticFetcher {
    pub fn with_source(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.sources.insert(url.to_string(), bytes);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches seen running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.sources.get(url).cloned().ok_or(FetchError::Status(404))
    }
}

/// Artifact store in a map. Counts writes.
#[derive(Default)]
pub struct MemoryArtifacts {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
}

impl MemoryArtifacts {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().unwrap().insert(key.to_string(), data.to_vec());
        Ok(format!("memory://{key}"))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.object(key).ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

/// A consumer wired to in-memory collaborators, with handles to inspect them.
pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryQueue>,
    pub fetcher: Arc<StaticFetcher>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub consumer: Arc<JobConsumer>,
}

impl Harness {
    pub fn new(fetcher: StaticFetcher) -> Self {
        let store = Arc::new(MemoryJobStore::default());
        let fetcher = Arc::new(fetcher);
        let artifacts = Arc::new(MemoryArtifacts::default());
        let consumer = Arc::new(JobConsumer::new(
            store.clone(),
            fetcher.clone(),
            artifacts.clone(),
            TransformPool::new(2),
        ));

        Self {
            store,
            queue: Arc::new(MemoryQueue::default()),
            fetcher,
            artifacts,
            consumer,
        }
    }

    /// Start the consume loop on `self.queue`. Send `true` to stop it.
    pub fn start(&self, settings: ConsumerSettings) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.consumer).run(
            self.queue.clone(),
            settings,
            shutdown_rx,
        ));
        (handle, shutdown_tx)
    }
}

pub fn loop_settings(max_in_flight: usize, visibility_timeout: Duration) -> ConsumerSettings {
    ConsumerSettings {
        max_in_flight,
        poll_interval: Duration::from_millis(10),
        visibility_timeout,
    }
}

/// Poll `condition` until it holds; panics after 10 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
