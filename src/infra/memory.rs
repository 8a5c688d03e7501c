//! In-process queue and document store.
//!
//! Same semantics as the Postgres adapters, minus durability. Used by the
//! test suite and by `serve` when no database URL is configured.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

use crate::{
    application::jobs::JobDisposition,
    application::repos::{DocumentStore, JobQueue, RepoError},
    domain::{
        entities::{
            ClaimedJob, JobRecord, NewDocument, NewRenderJob, QueueCounts, StoredDocument,
        },
        types::JobState,
    },
    infra::storage::DocumentStorage,
    util::lock::mutex_lock,
};

const SOURCE: &str = "infra::memory";

/// Finished jobs kept around for `find` before the oldest are evicted.
pub const DEFAULT_FINISHED_RETENTION: usize = 1024;

#[derive(Debug)]
struct Slot {
    record: JobRecord,
    /// Sequence of the newest heap entry for this job; older entries are stale.
    seq: u64,
}

/// Claim order: higher priority, then earlier `run_at`, then enqueue order.
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    run_at: OffsetDateTime,
    seq: u64,
    id: String,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.run_at.cmp(&self.run_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, Slot>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<(OffsetDateTime, u64, String)>>,
    /// Finished job ids, oldest first.
    finished: VecDeque<String>,
    completed: u64,
    failed: u64,
    dead_lettered: u64,
    next_seq: u64,
}

impl QueueState {
    fn schedule(&mut self, id: &str, now: OffsetDateTime) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let Some(slot) = self.jobs.get_mut(id) else {
            return;
        };
        slot.seq = seq;
        let (priority, run_at) = (slot.record.priority, slot.record.run_at);

        if run_at <= now {
            self.ready.push(ReadyEntry {
                priority,
                run_at,
                seq,
                id: id.to_owned(),
            });
        } else {
            self.delayed.push(Reverse((run_at, seq, id.to_owned())));
        }
    }

    fn promote_due(&mut self, now: OffsetDateTime) {
        while let Some(Reverse((run_at, _, _))) = self.delayed.peek() {
            if *run_at > now {
                break;
            }
            let Some(Reverse((run_at, seq, id))) = self.delayed.pop() else {
                break;
            };
            let Some(slot) = self.jobs.get(&id) else {
                continue;
            };
            if slot.seq == seq && slot.record.state == JobState::Pending {
                self.ready.push(ReadyEntry {
                    priority: slot.record.priority,
                    run_at,
                    seq,
                    id,
                });
            }
        }
    }

    fn pop_ready(&mut self) -> Option<String> {
        while let Some(entry) = self.ready.pop() {
            let live = self.jobs.get(&entry.id).is_some_and(|slot| {
                slot.seq == entry.seq && slot.record.state == JobState::Pending
            });
            if live {
                return Some(entry.id);
            }
        }
        None
    }

    fn retire(&mut self, id: String, retention: usize) {
        self.finished.push_back(id);
        while self.finished.len() > retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }
}

/// Priority queue for single-process deployments.
///
/// Pending jobs sit in a ready heap or, while `run_at` is in the future, a
/// delayed heap. Finished jobs are retained for status lookups up to a cap,
/// after which the oldest are evicted; counts of finished jobs survive
/// eviction.
#[derive(Debug, Clone)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    ready_signal: Arc<Notify>,
    retention: usize,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Arc::default(),
            ready_signal: Arc::new(Notify::new()),
            retention,
        }
    }

    /// Jobs currently held, pending and running included.
    pub fn retained_len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "queue.retained_len")
            .jobs
            .len()
    }

    /// Take the next ready job and count the delivery as an attempt.
    pub fn claim_next(&self, worker_id: &str) -> Option<ClaimedJob> {
        let now = OffsetDateTime::now_utc();
        let mut queue = mutex_lock(&self.state, SOURCE, "queue.claim_next");
        queue.promote_due(now);
        let id = queue.pop_ready()?;
        let slot = queue.jobs.get_mut(&id)?;

        let job = &mut slot.record;
        job.state = JobState::Running;
        job.attempts += 1;
        job.locked_by = Some(worker_id.to_owned());

        Some(ClaimedJob {
            id,
            payload: job.payload.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
        })
    }

    /// Record how a claimed delivery ended.
    pub fn settle(
        &self,
        id: &str,
        disposition: JobDisposition,
        error: Option<&str>,
    ) -> Result<(), RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut queue = mutex_lock(&self.state, SOURCE, "queue.settle");
        let job = &mut queue.jobs.get_mut(id).ok_or(RepoError::NotFound)?.record;
        job.locked_by = None;
        if let Some(error) = error {
            job.last_error = Some(error.to_owned());
        }
        job.state = match disposition {
            JobDisposition::Completed => JobState::Done,
            JobDisposition::Failed => JobState::Failed,
            JobDisposition::DeadLettered => JobState::Killed,
            JobDisposition::Retrying { run_at } => {
                job.run_at = run_at;
                JobState::Pending
            }
        };
        job.done_at = job.state.is_finished().then_some(now);

        match disposition {
            JobDisposition::Retrying { .. } => {
                queue.schedule(id, now);
                drop(queue);
                self.ready_signal.notify_one();
            }
            JobDisposition::Completed => {
                queue.completed += 1;
                queue.retire(id.to_owned(), self.retention);
            }
            JobDisposition::Failed => {
                queue.failed += 1;
                queue.retire(id.to_owned(), self.retention);
            }
            JobDisposition::DeadLettered => {
                queue.failed += 1;
                queue.dead_lettered += 1;
                queue.retire(id.to_owned(), self.retention);
            }
        }
        Ok(())
    }

    /// Wait until a job may be ready: an enqueue or retry signal, the next
    /// delayed `run_at`, or `max_wait`, whichever comes first.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let until_due = {
            let queue = mutex_lock(&self.state, SOURCE, "queue.wait_for_work");
            queue
                .delayed
                .peek()
                .map(|Reverse((run_at, _, _))| *run_at - OffsetDateTime::now_utc())
        };
        let wait = match until_due {
            Some(delta) if delta.is_negative() => return,
            Some(delta) => Duration::try_from(delta).map_or(max_wait, |due| due.min(max_wait)),
            None => max_wait,
        };

        tokio::select! {
            _ = self.ready_signal.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewRenderJob) -> Result<String, RepoError> {
        let id = Uuid::new_v4().to_string();
        let record = JobRecord {
            id: id.clone(),
            payload: job.payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            priority: job.priority,
            run_at: job.run_at,
            last_error: None,
            locked_by: None,
            done_at: None,
        };

        {
            let mut queue = mutex_lock(&self.state, SOURCE, "queue.enqueue");
            queue.jobs.insert(id.clone(), Slot { record, seq: 0 });
            queue.schedule(&id, OffsetDateTime::now_utc());
        }
        self.ready_signal.notify_one();
        Ok(id)
    }

    async fn defer(&self, id: &str, run_at: OffsetDateTime) -> Result<(), RepoError> {
        let mut queue = mutex_lock(&self.state, SOURCE, "queue.defer");
        let job = &mut queue.jobs.get_mut(id).ok_or(RepoError::NotFound)?.record;
        if job.state.is_finished() {
            return Ok(());
        }
        job.run_at = run_at;
        if job.state == JobState::Pending {
            queue.schedule(id, OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<JobRecord>, RepoError> {
        Ok(mutex_lock(&self.state, SOURCE, "queue.find")
            .jobs
            .get(id)
            .map(|slot| slot.record.clone()))
    }

    async fn counts(&self) -> Result<QueueCounts, RepoError> {
        let queue = mutex_lock(&self.state, SOURCE, "queue.counts");
        let mut counts = QueueCounts {
            completed: queue.completed,
            failed: queue.failed,
            dead_lettered: queue.dead_lettered,
            ..QueueCounts::default()
        };
        for slot in queue.jobs.values() {
            match slot.record.state {
                JobState::Pending => counts.waiting += 1,
                JobState::Running => counts.active += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryDocument {
    pub stored: StoredDocument,
    pub title: String,
    pub pdf: Bytes,
}

/// Document store keeping metadata in memory. PDFs are written through a
/// [`DocumentStorage`] when one is attached and kept in memory otherwise.
#[derive(Debug, Default, Clone)]
pub struct MemoryDocumentStore {
    documents: Arc<Mutex<HashMap<(String, String), MemoryDocument>>>,
    storage: Option<Arc<DocumentStorage>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(storage: Arc<DocumentStorage>) -> Self {
        Self {
            documents: Arc::default(),
            storage: Some(storage),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.documents, SOURCE, "documents.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, tenant_id: &str, message_id: &str) -> Option<MemoryDocument> {
        mutex_lock(&self.documents, SOURCE, "documents.get")
            .get(&(tenant_id.to_owned(), message_id.to_owned()))
            .cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_existing(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<Uuid>, RepoError> {
        Ok(self
            .get(tenant_id, message_id)
            .map(|document| document.stored.id))
    }

    async fn create_document(&self, document: NewDocument) -> Result<StoredDocument, RepoError> {
        let key = (document.tenant_id.clone(), document.message_id.clone());
        if mutex_lock(&self.documents, SOURCE, "documents.precheck").contains_key(&key) {
            return Err(duplicate());
        }

        let id = Uuid::new_v4();
        let (stored_path, checksum, size_bytes) = match &self.storage {
            Some(storage) => {
                let stored = storage
                    .store_pdf(&document.tenant_id, id, &document.pdf)
                    .await
                    .map_err(RepoError::from_persistence)?;
                (stored.stored_path, stored.checksum, stored.size_bytes)
            }
            None => (
                format!("memory://{id}.pdf"),
                hex::encode(Sha256::digest(&document.pdf)),
                i64::try_from(document.pdf.len()).map_err(RepoError::from_persistence)?,
            ),
        };

        let stored = StoredDocument {
            id,
            tenant_id: document.tenant_id,
            message_id: document.message_id,
            stored_path,
            checksum,
            size_bytes,
            created_at: OffsetDateTime::now_utc(),
        };

        let inserted = {
            let mut documents = mutex_lock(&self.documents, SOURCE, "documents.insert");
            if documents.contains_key(&key) {
                false
            } else {
                documents.insert(
                    key,
                    MemoryDocument {
                        stored: stored.clone(),
                        title: document.title,
                        pdf: document.pdf,
                    },
                );
                true
            }
        };

        if !inserted {
            if let Some(storage) = &self.storage {
                discard_orphan(storage, &stored.stored_path).await;
            }
            return Err(duplicate());
        }
        Ok(stored)
    }
}

/// Remove the PDF written by an insert that lost the race for its key.
/// Returns whether the file is gone.
async fn discard_orphan(storage: &DocumentStorage, stored_path: &str) -> bool {
    match storage.delete(stored_path).await {
        Ok(()) => true,
        Err(err) => {
            warn!(
                target = SOURCE,
                op = "create_document",
                result = "orphaned_file",
                stored_path = %stored_path,
                error = %err,
                "Failed to remove PDF after rejected insert"
            );
            false
        }
    }
}

fn duplicate() -> RepoError {
    RepoError::Duplicate {
        constraint: "documents_tenant_id_message_id_key".to_owned(),
    }
}
