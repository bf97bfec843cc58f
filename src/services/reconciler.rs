//! Offline reconciliation for location records.
//!
//! A device keeps working against a local cache while the network is down,
//! queueing its mutations; on reconnect the queue is drained against the
//! server in per-record order. Conflicts resolve by last-write-wins on
//! `updated_at`, and a record deleted on the server is never resurrected by
//! a stale queued update.
//!
//! The same drain engine backs the server's sync endpoint, which accepts a
//! client-serialized queue and reconciles it against Postgres.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::location::{LocationData, LocationRecord};
use crate::models::pending_mutation::{MutationOp, PendingMutation};

#[derive(thiserror::Error, Debug, Clone)]
pub enum RemoteError {
    /// Network or server unavailability; safe to queue and retry
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Malformed input; surfaced immediately, never queued
    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Record not found")]
    NotFound,

    /// The record was deleted on the server; queued writes for it are dropped
    #[error("Record was deleted on the server")]
    DeletedOnServer,

    /// The server copy is newer; last-write-wins keeps it
    #[error("Superseded by a newer server write")]
    StaleWrite,
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Errors surfaced by the device-facing reconciler operations.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Record not found")]
    RecordNotFound,

    #[error("Transient failure: {0}")]
    Transient(String),
}

/// Server side of the reconciliation seam. Production implementation is
/// [`PgRemoteLocations`]; tests drive an in-memory fake with failure
/// injection.
#[allow(async_fn_in_trait)]
pub trait RemoteLocations {
    async fn fetch_all(&self, user_id: Uuid) -> Result<Vec<LocationRecord>, RemoteError>;

    async fn create(
        &self,
        user_id: Uuid,
        id: Uuid,
        data: &LocationData,
    ) -> Result<LocationRecord, RemoteError>;

    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        data: &LocationData,
        client_updated_at: DateTime<Utc>,
    ) -> Result<LocationRecord, RemoteError>;

    async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<(), RemoteError>;

    async fn set_default(&self, user_id: Uuid, id: Uuid) -> Result<LocationRecord, RemoteError>;
}

/// Local persistent store: offline location cache plus the mutation queue,
/// the level of interface a key-value store offers (get-all, put, delete,
/// clear).
pub trait LocalStore {
    fn cached(&self, user_id: Uuid) -> Vec<CachedLocation>;
    fn put(&self, cached: CachedLocation);
    fn remove(&self, user_id: Uuid, id: Uuid);
    fn clear_cache(&self, user_id: Uuid);

    fn queue(&self, user_id: Uuid) -> Vec<PendingMutation>;
    fn enqueue(&self, user_id: Uuid, mutation: PendingMutation);
    fn replace_queue(&self, user_id: Uuid, queue: Vec<PendingMutation>);
}

/// A cached record plus the not-yet-synced flag shown in the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedLocation {
    pub record: LocationRecord,
    pub pending_sync: bool,
}

/// In-memory [`LocalStore`]; a device build would back this with its own
/// persistent key-value storage.
#[derive(Default)]
pub struct MemoryStore {
    cache: Mutex<HashMap<Uuid, Vec<CachedLocation>>>,
    queues: Mutex<HashMap<Uuid, Vec<PendingMutation>>>,
}

impl LocalStore for MemoryStore {
    fn cached(&self, user_id: Uuid) -> Vec<CachedLocation> {
        self.cache
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    fn put(&self, cached: CachedLocation) {
        let mut cache = self.cache.lock().unwrap();
        let entries = cache.entry(cached.record.user_id).or_default();
        if let Some(existing) = entries.iter_mut().find(|c| c.record.id == cached.record.id) {
            *existing = cached;
        } else {
            entries.push(cached);
        }
    }

    fn remove(&self, user_id: Uuid, id: Uuid) {
        if let Some(entries) = self.cache.lock().unwrap().get_mut(&user_id) {
            entries.retain(|c| c.record.id != id);
        }
    }

    fn clear_cache(&self, user_id: Uuid) {
        self.cache.lock().unwrap().remove(&user_id);
    }

    fn queue(&self, user_id: Uuid) -> Vec<PendingMutation> {
        self.queues
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    fn enqueue(&self, user_id: Uuid, mutation: PendingMutation) {
        self.queues
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .push(mutation);
    }

    fn replace_queue(&self, user_id: Uuid, queue: Vec<PendingMutation>) {
        self.queues.lock().unwrap().insert(user_id, queue);
    }
}

/// Shared reachability signal, flipped by whatever network monitor the host
/// environment provides.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

/// Bounded retry with backoff for transient remote failures, plus the
/// caller-supplied timeout applied to every remote call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub remote_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            remote_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub record_id: Uuid,
    pub op: MutationOp,
    pub reason: String,
    /// True when the mutation stayed queued for a later attempt
    pub retryable: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: bool,
    pub created: Vec<LocationRecord>,
    pub updated: Vec<LocationRecord>,
    pub deleted: Vec<Uuid>,
    pub errors: Vec<SyncErrorEntry>,
}

/// Collapses a queue so later mutations on the same record id supersede
/// earlier ones before anything hits the network:
/// - update then delete becomes just the delete
/// - create then delete cancels out entirely (the server never saw the id)
/// - create then update folds into a create carrying the latest payload
/// - a set-default survives alongside a create or update, but not a delete
///
/// Per-id order is preserved; order across distinct ids follows first
/// appearance and carries no guarantee.
pub fn collapse_queue(queue: Vec<PendingMutation>) -> Vec<PendingMutation> {
    struct PerRecord {
        base: Option<PendingMutation>,
        set_default: Option<PendingMutation>,
        saw_create: bool,
        dropped: bool,
    }

    let mut order: Vec<Uuid> = Vec::new();
    let mut by_id: HashMap<Uuid, PerRecord> = HashMap::new();

    for mutation in queue {
        let entry = by_id.entry(mutation.record_id).or_insert_with(|| {
            order.push(mutation.record_id);
            PerRecord {
                base: None,
                set_default: None,
                saw_create: false,
                dropped: false,
            }
        });

        match mutation.op {
            MutationOp::Create => {
                entry.saw_create = true;
                entry.dropped = false;
                entry.base = Some(mutation);
            }
            MutationOp::Update => {
                if entry.dropped {
                    continue;
                }
                // A still-queued create absorbs the newer payload
                let fold_into_create =
                    matches!(&entry.base, Some(base) if base.op == MutationOp::Create);
                let mut folded = mutation;
                if fold_into_create {
                    folded.op = MutationOp::Create;
                }
                entry.base = Some(folded);
            }
            MutationOp::Delete => {
                entry.set_default = None;
                if entry.saw_create {
                    // The server never saw this record; nothing to send
                    entry.base = None;
                    entry.dropped = true;
                } else {
                    entry.base = Some(mutation);
                }
            }
            MutationOp::SetDefault => {
                if !entry.dropped {
                    entry.set_default = Some(mutation);
                }
            }
        }
    }

    let mut collapsed = Vec::new();
    for id in order {
        let entry = by_id.remove(&id).expect("entry recorded on first sight");
        if let Some(base) = entry.base {
            collapsed.push(base);
        }
        if let Some(set_default) = entry.set_default {
            collapsed.push(set_default);
        }
    }
    collapsed
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Transient("remote call timed out".to_string())),
    }
}

async fn apply_with_retry<R: RemoteLocations>(
    remote: &R,
    user_id: Uuid,
    mutation: &PendingMutation,
    policy: &RetryPolicy,
) -> Result<Option<LocationRecord>, RemoteError> {
    let mut attempt = 0;
    loop {
        let result = match mutation.op {
            MutationOp::Create => {
                let data = mutation
                    .data
                    .as_ref()
                    .ok_or_else(|| RemoteError::Validation("create without payload".into()))?;
                with_timeout(
                    policy.remote_timeout,
                    remote.create(user_id, mutation.record_id, data),
                )
                .await
                .map(Some)
            }
            MutationOp::Update => {
                let data = mutation
                    .data
                    .as_ref()
                    .ok_or_else(|| RemoteError::Validation("update without payload".into()))?;
                with_timeout(
                    policy.remote_timeout,
                    remote.update(user_id, mutation.record_id, data, mutation.updated_at),
                )
                .await
                .map(Some)
            }
            MutationOp::Delete => with_timeout(
                policy.remote_timeout,
                remote.delete(user_id, mutation.record_id),
            )
            .await
            .map(|_| None),
            MutationOp::SetDefault => with_timeout(
                policy.remote_timeout,
                remote.set_default(user_id, mutation.record_id),
            )
            .await
            .map(Some),
        };

        match result {
            Ok(record) => return Ok(record),
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                let backoff = policy.base_delay * 2u32.saturating_pow(attempt - 1);
                tracing::debug!(
                    record_id = %mutation.record_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transient failure, backing off before retry"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drains a (pre-collapse) mutation queue against the server.
///
/// Failures are isolated per record id: once a mutation for an id fails, the
/// rest of that id's mutations are held back, while unrelated ids keep
/// flowing. Transient failures stay queued for the next sync; permanent ones
/// are dropped and reported.
///
/// Returns the report and whatever remains queued.
#[tracing::instrument(skip(remote, queue, policy), fields(queued = queue.len()))]
pub async fn drain<R: RemoteLocations>(
    remote: &R,
    user_id: Uuid,
    queue: Vec<PendingMutation>,
    policy: &RetryPolicy,
) -> (SyncReport, Vec<PendingMutation>) {
    let mut report = SyncReport::default();
    let mut remaining = Vec::new();
    let mut failed_ids: HashSet<Uuid> = HashSet::new();

    for mutation in collapse_queue(queue) {
        if failed_ids.contains(&mutation.record_id) {
            // Causal order per id: don't apply later ops past a failure
            remaining.push(mutation);
            continue;
        }

        match apply_with_retry(remote, user_id, &mutation, policy).await {
            Ok(record) => match mutation.op {
                MutationOp::Create => report.created.push(record.expect("create returns record")),
                MutationOp::Update | MutationOp::SetDefault => {
                    report.updated.push(record.expect("update returns record"))
                }
                MutationOp::Delete => report.deleted.push(mutation.record_id),
            },
            Err(e) => {
                let retryable = e.is_transient();
                tracing::warn!(
                    record_id = %mutation.record_id,
                    op = ?mutation.op,
                    retryable,
                    error = %e,
                    "Sync mutation failed"
                );
                report.errors.push(SyncErrorEntry {
                    record_id: mutation.record_id,
                    op: mutation.op,
                    reason: e.to_string(),
                    retryable,
                });
                if retryable {
                    failed_ids.insert(mutation.record_id);
                    remaining.push(mutation);
                }
            }
        }
    }

    report.success = report.errors.is_empty();
    (report, remaining)
}

/// Outcome of a single device-facing location operation.
#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome {
    pub record: LocationRecord,
    /// True when the write was queued locally instead of reaching the server
    pub offline: bool,
}

#[derive(Debug, Serialize)]
pub struct LoadOutcome {
    pub data: Vec<CachedLocation>,
    pub offline: bool,
}

/// Device-facing reconciler: direct server writes while reachable, local
/// queueing otherwise, and a drain on demand.
pub struct Reconciler<R, L> {
    remote: R,
    local: L,
    connectivity: Connectivity,
    policy: RetryPolicy,
}

impl<R: RemoteLocations, L: LocalStore> Reconciler<R, L> {
    pub fn new(remote: R, local: L, connectivity: Connectivity, policy: RetryPolicy) -> Self {
        Self {
            remote,
            local,
            connectivity,
            policy,
        }
    }

    fn next_seq(&self, user_id: Uuid) -> u64 {
        self.local
            .queue(user_id)
            .iter()
            .map(|m| m.seq + 1)
            .max()
            .unwrap_or(0)
    }

    /// A record built locally while offline; the server copy replaces it on
    /// the next successful sync.
    fn local_record(id: Uuid, user_id: Uuid, data: &LocationData) -> LocationRecord {
        let now = Utc::now();
        LocationRecord {
            id,
            user_id,
            name: data.name.clone(),
            address: data.address.clone(),
            latitude: data.latitude,
            longitude: data.longitude,
            location_type: data.location_type,
            is_default: false,
            notes: data.notes.clone(),
            pickup_instructions: data.pickup_instructions.clone(),
            last_pickup_date: None,
            photo_ref: data.photo_ref.clone(),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Server fetch with cache fallback. Pending local records are part of
    /// the returned view either way.
    pub async fn load_locations(&self, user_id: Uuid) -> Result<LoadOutcome, SyncError> {
        if self.connectivity.is_online() {
            match with_timeout(self.policy.remote_timeout, self.remote.fetch_all(user_id)).await {
                Ok(records) => {
                    let pending: Vec<CachedLocation> = self
                        .local
                        .cached(user_id)
                        .into_iter()
                        .filter(|c| c.pending_sync)
                        .collect();

                    self.local.clear_cache(user_id);
                    for record in records {
                        self.local.put(CachedLocation {
                            record,
                            pending_sync: false,
                        });
                    }
                    for cached in pending {
                        self.local.put(cached);
                    }

                    return Ok(LoadOutcome {
                        data: self.local.cached(user_id),
                        offline: false,
                    });
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Fetch failed, serving cached locations");
                }
                Err(RemoteError::Validation(msg)) => return Err(SyncError::Validation(msg)),
                Err(RemoteError::NotFound) => return Err(SyncError::RecordNotFound),
                Err(e) => return Err(SyncError::Transient(e.to_string())),
            }
        }

        Ok(LoadOutcome {
            data: self.local.cached(user_id),
            offline: true,
        })
    }

    pub async fn add_location(
        &self,
        user_id: Uuid,
        id: Uuid,
        data: LocationData,
    ) -> Result<OpOutcome, SyncError> {
        data.validate().map_err(SyncError::Validation)?;

        if self.connectivity.is_online() {
            match with_timeout(
                self.policy.remote_timeout,
                self.remote.create(user_id, id, &data),
            )
            .await
            {
                Ok(record) => {
                    self.local.put(CachedLocation {
                        record: record.clone(),
                        pending_sync: false,
                    });
                    return Ok(OpOutcome {
                        record,
                        offline: false,
                    });
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Create failed transiently, queueing");
                }
                Err(RemoteError::Validation(msg)) => return Err(SyncError::Validation(msg)),
                Err(e) => return Err(SyncError::Transient(e.to_string())),
            }
        }

        let record = Self::local_record(id, user_id, &data);
        self.local.put(CachedLocation {
            record: record.clone(),
            pending_sync: true,
        });
        self.local
            .enqueue(user_id, PendingMutation::create(id, self.next_seq(user_id), data));

        Ok(OpOutcome {
            record,
            offline: true,
        })
    }

    pub async fn update_location(
        &self,
        user_id: Uuid,
        id: Uuid,
        data: LocationData,
    ) -> Result<OpOutcome, SyncError> {
        data.validate().map_err(SyncError::Validation)?;

        if self.connectivity.is_online() {
            match with_timeout(
                self.policy.remote_timeout,
                self.remote.update(user_id, id, &data, Utc::now()),
            )
            .await
            {
                Ok(record) => {
                    self.local.put(CachedLocation {
                        record: record.clone(),
                        pending_sync: false,
                    });
                    return Ok(OpOutcome {
                        record,
                        offline: false,
                    });
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Update failed transiently, queueing");
                }
                Err(RemoteError::Validation(msg)) => return Err(SyncError::Validation(msg)),
                Err(RemoteError::NotFound) | Err(RemoteError::DeletedOnServer) => {
                    return Err(SyncError::RecordNotFound)
                }
                Err(e) => return Err(SyncError::Transient(e.to_string())),
            }
        }

        let mut record = self
            .local
            .cached(user_id)
            .into_iter()
            .map(|c| c.record)
            .find(|r| r.id == id)
            .ok_or(SyncError::RecordNotFound)?;

        record.name = data.name.clone();
        record.address = data.address.clone();
        record.latitude = data.latitude;
        record.longitude = data.longitude;
        record.location_type = data.location_type;
        record.notes = data.notes.clone();
        record.pickup_instructions = data.pickup_instructions.clone();
        record.photo_ref = data.photo_ref.clone();
        record.updated_at = Utc::now();

        self.local.put(CachedLocation {
            record: record.clone(),
            pending_sync: true,
        });
        self.local
            .enqueue(user_id, PendingMutation::update(id, self.next_seq(user_id), data));

        Ok(OpOutcome {
            record,
            offline: true,
        })
    }

    pub async fn delete_location(&self, user_id: Uuid, id: Uuid) -> Result<bool, SyncError> {
        if self.connectivity.is_online() {
            match with_timeout(self.policy.remote_timeout, self.remote.delete(user_id, id)).await {
                Ok(()) => {
                    self.local.remove(user_id, id);
                    return Ok(false);
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Delete failed transiently, queueing");
                }
                Err(RemoteError::NotFound) | Err(RemoteError::DeletedOnServer) => {
                    return Err(SyncError::RecordNotFound)
                }
                Err(RemoteError::Validation(msg)) => return Err(SyncError::Validation(msg)),
                Err(e) => return Err(SyncError::Transient(e.to_string())),
            }
        }

        self.local.remove(user_id, id);
        self.local
            .enqueue(user_id, PendingMutation::delete(id, self.next_seq(user_id)));

        Ok(true)
    }

    /// Unset-then-set in one logical operation. Offline it queues a single
    /// compound mutation, so there is never a window with zero or two
    /// defaults at drain time.
    pub async fn set_default_location(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<OpOutcome, SyncError> {
        if self.connectivity.is_online() {
            match with_timeout(
                self.policy.remote_timeout,
                self.remote.set_default(user_id, id),
            )
            .await
            {
                Ok(record) => {
                    self.apply_default_locally(user_id, id, false);
                    return Ok(OpOutcome {
                        record,
                        offline: false,
                    });
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Set-default failed transiently, queueing");
                }
                Err(RemoteError::NotFound) | Err(RemoteError::DeletedOnServer) => {
                    return Err(SyncError::RecordNotFound)
                }
                Err(RemoteError::Validation(msg)) => return Err(SyncError::Validation(msg)),
                Err(e) => return Err(SyncError::Transient(e.to_string())),
            }
        }

        let record = self
            .local
            .cached(user_id)
            .into_iter()
            .map(|c| c.record)
            .find(|r| r.id == id)
            .ok_or(SyncError::RecordNotFound)?;

        self.apply_default_locally(user_id, id, true);
        self.local
            .enqueue(user_id, PendingMutation::set_default(id, self.next_seq(user_id)));

        let mut record = record;
        record.is_default = true;
        Ok(OpOutcome {
            record,
            offline: true,
        })
    }

    fn apply_default_locally(&self, user_id: Uuid, id: Uuid, mark_pending: bool) {
        for mut cached in self.local.cached(user_id) {
            let was_default = cached.record.is_default;
            let becomes_default = cached.record.id == id;
            if was_default != becomes_default {
                cached.record.is_default = becomes_default;
                if mark_pending && becomes_default {
                    cached.pending_sync = true;
                }
                self.local.put(cached);
            }
        }
    }

    /// Drains the local queue against the server and reconciles the cache
    /// with whatever the server confirmed.
    #[tracing::instrument(skip(self))]
    pub async fn sync_with_server(&self, user_id: Uuid) -> SyncReport {
        if !self.connectivity.is_online() {
            let queued = self.local.queue(user_id).len();
            tracing::debug!(queued, "Sync requested while offline; keeping queue");
            return SyncReport {
                success: false,
                ..SyncReport::default()
            };
        }

        let queue = self.local.queue(user_id);
        let (report, remaining) = drain(&self.remote, user_id, queue, &self.policy).await;

        for record in report.created.iter().chain(report.updated.iter()) {
            self.local.put(CachedLocation {
                record: record.clone(),
                pending_sync: false,
            });
        }
        for id in &report.deleted {
            self.local.remove(user_id, *id);
        }
        self.local.replace_queue(user_id, remaining);

        tracing::info!(
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            errors = report.errors.len(),
            "Sync drain finished"
        );

        report
    }

    /// Queue length, for the UI badge
    pub fn pending_sync_count(&self, user_id: Uuid) -> usize {
        self.local.queue(user_id).len()
    }
}

fn classify_sqlx(e: sqlx::Error) -> RemoteError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RemoteError::Transient(e.to_string()),
        sqlx::Error::RowNotFound => RemoteError::NotFound,
        other => RemoteError::Validation(other.to_string()),
    }
}

/// Postgres-backed remote, used in-process by the sync endpoint.
#[derive(Debug, Clone)]
pub struct PgRemoteLocations {
    pool: PgPool,
}

impl PgRemoteLocations {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl RemoteLocations for PgRemoteLocations {
    async fn fetch_all(&self, user_id: Uuid) -> Result<Vec<LocationRecord>, RemoteError> {
        LocationRecord::list_for_user(&self.pool, user_id)
            .await
            .map_err(classify_sqlx)
    }

    async fn create(
        &self,
        user_id: Uuid,
        id: Uuid,
        data: &LocationData,
    ) -> Result<LocationRecord, RemoteError> {
        LocationRecord::upsert(&self.pool, id, user_id, data)
            .await
            .map_err(classify_sqlx)
    }

    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        data: &LocationData,
        client_updated_at: DateTime<Utc>,
    ) -> Result<LocationRecord, RemoteError> {
        let existing = LocationRecord::find_by_id(&self.pool, id, user_id)
            .await
            .map_err(classify_sqlx)?;
        match existing {
            None => Err(RemoteError::NotFound),
            Some(record) if record.is_deleted => Err(RemoteError::DeletedOnServer),
            Some(_) => {
                let updated =
                    LocationRecord::update_lww(&self.pool, id, user_id, data, client_updated_at)
                        .await
                        .map_err(classify_sqlx)?;
                updated.ok_or(RemoteError::StaleWrite)
            }
        }
    }

    async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<(), RemoteError> {
        // A second delete finds only the tombstone; deleting twice is fine
        let _ = LocationRecord::soft_delete(&self.pool, id, user_id)
            .await
            .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn set_default(&self, user_id: Uuid, id: Uuid) -> Result<LocationRecord, RemoteError> {
        LocationRecord::set_default(&self.pool, id, user_id)
            .await
            .map_err(classify_sqlx)?
            .ok_or(RemoteError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::location::LocationType;

    /// In-memory server with per-id transient failure injection.
    #[derive(Default)]
    struct MemoryRemote {
        records: Mutex<HashMap<Uuid, LocationRecord>>,
        /// Ids whose next N calls fail transiently
        flaky: Mutex<HashMap<Uuid, u32>>,
    }

    impl MemoryRemote {
        fn fail_transiently(&self, id: Uuid, times: u32) {
            self.flaky.lock().unwrap().insert(id, times);
        }

        fn check_flaky(&self, id: Uuid) -> Result<(), RemoteError> {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(left) = flaky.get_mut(&id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(RemoteError::Transient("connection refused".into()));
                }
            }
            Ok(())
        }

        fn record(&self, id: Uuid) -> Option<LocationRecord> {
            self.records.lock().unwrap().get(&id).cloned()
        }

        fn seed(&self, user_id: Uuid, id: Uuid, data: &LocationData) -> LocationRecord {
            let record = make_record(id, user_id, data);
            self.records.lock().unwrap().insert(id, record.clone());
            record
        }

        fn tombstone(&self, id: Uuid) {
            if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
                record.is_deleted = true;
                record.updated_at = Utc::now();
            }
        }
    }

    fn make_record(id: Uuid, user_id: Uuid, data: &LocationData) -> LocationRecord {
        let now = Utc::now();
        LocationRecord {
            id,
            user_id,
            name: data.name.clone(),
            address: data.address.clone(),
            latitude: data.latitude,
            longitude: data.longitude,
            location_type: data.location_type,
            is_default: false,
            notes: data.notes.clone(),
            pickup_instructions: data.pickup_instructions.clone(),
            last_pickup_date: None,
            photo_ref: data.photo_ref.clone(),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    impl RemoteLocations for MemoryRemote {
        async fn fetch_all(&self, user_id: Uuid) -> Result<Vec<LocationRecord>, RemoteError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.user_id == user_id && !r.is_deleted)
                .cloned()
                .collect())
        }

        async fn create(
            &self,
            user_id: Uuid,
            id: Uuid,
            data: &LocationData,
        ) -> Result<LocationRecord, RemoteError> {
            self.check_flaky(id)?;
            let record = make_record(id, user_id, data);
            self.records.lock().unwrap().insert(id, record.clone());
            Ok(record)
        }

        async fn update(
            &self,
            _user_id: Uuid,
            id: Uuid,
            data: &LocationData,
            client_updated_at: DateTime<Utc>,
        ) -> Result<LocationRecord, RemoteError> {
            self.check_flaky(id)?;
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(&id).ok_or(RemoteError::NotFound)?;
            if record.is_deleted {
                return Err(RemoteError::DeletedOnServer);
            }
            if record.updated_at > client_updated_at {
                return Err(RemoteError::StaleWrite);
            }
            record.name = data.name.clone();
            record.address = data.address.clone();
            record.updated_at = Utc::now();
            Ok(record.clone())
        }

        async fn delete(&self, _user_id: Uuid, id: Uuid) -> Result<(), RemoteError> {
            self.check_flaky(id)?;
            if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
                record.is_deleted = true;
                record.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn set_default(
            &self,
            user_id: Uuid,
            id: Uuid,
        ) -> Result<LocationRecord, RemoteError> {
            self.check_flaky(id)?;
            let mut records = self.records.lock().unwrap();
            if !records.contains_key(&id) {
                return Err(RemoteError::NotFound);
            }
            for record in records.values_mut() {
                if record.user_id == user_id {
                    record.is_default = record.id == id;
                }
            }
            Ok(records.get(&id).cloned().expect("checked above"))
        }
    }

    fn data(name: &str) -> LocationData {
        LocationData {
            name: name.to_string(),
            address: format!("{name} street 1"),
            latitude: 52.1,
            longitude: 4.3,
            location_type: LocationType::Home,
            notes: None,
            pickup_instructions: None,
            photo_ref: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            remote_timeout: Duration::from_secs(5),
        }
    }

    fn reconciler(online: bool) -> Reconciler<MemoryRemote, MemoryStore> {
        Reconciler::new(
            MemoryRemote::default(),
            MemoryStore::default(),
            Connectivity::new(online),
            fast_policy(),
        )
    }

    #[test]
    fn test_collapse_update_then_delete_is_delete() {
        let id = Uuid::new_v4();
        let queue = vec![
            PendingMutation::update(id, 0, data("home")),
            PendingMutation::delete(id, 1),
        ];
        let collapsed = collapse_queue(queue);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].op, MutationOp::Delete);
    }

    #[test]
    fn test_collapse_create_then_delete_cancels_out() {
        let id = Uuid::new_v4();
        let queue = vec![
            PendingMutation::create(id, 0, data("home")),
            PendingMutation::delete(id, 1),
        ];
        assert!(collapse_queue(queue).is_empty());
    }

    #[test]
    fn test_collapse_create_then_update_folds_latest_payload() {
        let id = Uuid::new_v4();
        let queue = vec![
            PendingMutation::create(id, 0, data("first")),
            PendingMutation::update(id, 1, data("second")),
        ];
        let collapsed = collapse_queue(queue);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].op, MutationOp::Create);
        assert_eq!(collapsed[0].data.as_ref().unwrap().name, "second");
    }

    #[test]
    fn test_collapse_keeps_set_default_unless_deleted() {
        let id = Uuid::new_v4();
        let kept = collapse_queue(vec![
            PendingMutation::update(id, 0, data("home")),
            PendingMutation::set_default(id, 1),
        ]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].op, MutationOp::SetDefault);

        let dropped = collapse_queue(vec![
            PendingMutation::set_default(id, 0),
            PendingMutation::delete(id, 1),
        ]);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].op, MutationOp::Delete);
    }

    #[test]
    fn test_collapse_leaves_distinct_ids_alone() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let queue = vec![
            PendingMutation::create(a, 0, data("a")),
            PendingMutation::update(b, 1, data("b")),
        ];
        let collapsed = collapse_queue(queue);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].record_id, a);
        assert_eq!(collapsed[1].record_id, b);
    }

    #[tokio::test]
    async fn test_offline_create_then_sync() {
        let reconciler = reconciler(false);
        let user = Uuid::new_v4();
        let id = Uuid::new_v4();

        let outcome = reconciler
            .add_location(user, id, data("home"))
            .await
            .unwrap();
        assert!(outcome.offline);
        assert_eq!(reconciler.pending_sync_count(user), 1);

        reconciler.connectivity.set_online(true);
        let report = reconciler.sync_with_server(user).await;

        assert!(report.success);
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.created[0].id, id);
        assert_eq!(reconciler.pending_sync_count(user), 0);
        assert!(reconciler.remote.record(id).is_some());

        // Cache entry is no longer flagged pending
        let cached = reconciler.local.cached(user);
        assert!(cached.iter().all(|c| !c.pending_sync));
    }

    #[tokio::test]
    async fn test_queued_update_superseded_by_delete() {
        let reconciler = reconciler(true);
        let user = Uuid::new_v4();
        let id = Uuid::new_v4();
        reconciler.remote.seed(user, id, &data("home"));

        reconciler.connectivity.set_online(false);
        reconciler
            .local
            .put(CachedLocation {
                record: make_record(id, user, &data("home")),
                pending_sync: false,
            });
        reconciler
            .update_location(user, id, data("renamed"))
            .await
            .unwrap();
        reconciler.delete_location(user, id).await.unwrap();

        reconciler.connectivity.set_online(true);
        let report = reconciler.sync_with_server(user).await;

        assert!(report.success);
        assert!(report.updated.is_empty());
        assert_eq!(report.deleted, vec![id]);
        assert!(reconciler.remote.record(id).unwrap().is_deleted);
        // The collapsed update never reached the server
        assert_eq!(reconciler.remote.record(id).unwrap().name, "home");
    }

    #[tokio::test]
    async fn test_convergence_over_disjoint_ids() {
        let reconciler = reconciler(false);
        let user = Uuid::new_v4();

        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            reconciler
                .add_location(user, *id, data(&format!("loc-{i}")))
                .await
                .unwrap();
        }
        assert_eq!(reconciler.pending_sync_count(user), 5);

        reconciler.connectivity.set_online(true);
        let report = reconciler.sync_with_server(user).await;

        assert!(report.success);
        assert_eq!(report.created.len(), 5);
        assert_eq!(reconciler.pending_sync_count(user), 0);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(reconciler.remote.record(*id).unwrap().name, format!("loc-{i}"));
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_isolated_per_record() {
        let reconciler = reconciler(false);
        let user = Uuid::new_v4();
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();

        reconciler.add_location(user, bad, data("bad")).await.unwrap();
        reconciler.add_location(user, good, data("good")).await.unwrap();

        // More failures than the retry budget
        reconciler.remote.fail_transiently(bad, 10);
        reconciler.connectivity.set_online(true);
        let report = reconciler.sync_with_server(user).await;

        assert!(!report.success);
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.created[0].id, good);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].record_id, bad);
        assert!(report.errors[0].retryable);
        // Failed mutation stays queued for the next sync
        assert_eq!(reconciler.pending_sync_count(user), 1);

        // Next sync succeeds once the failures clear
        let report = reconciler.sync_with_server(user).await;
        assert!(report.success);
        assert_eq!(reconciler.pending_sync_count(user), 0);
    }

    #[tokio::test]
    async fn test_retry_recovers_within_budget() {
        let reconciler = reconciler(false);
        let user = Uuid::new_v4();
        let id = Uuid::new_v4();

        reconciler.add_location(user, id, data("home")).await.unwrap();

        // Two failures, third attempt lands
        reconciler.remote.fail_transiently(id, 2);
        reconciler.connectivity.set_online(true);
        let report = reconciler.sync_with_server(user).await;

        assert!(report.success);
        assert_eq!(report.created.len(), 1);
    }

    #[tokio::test]
    async fn test_server_delete_wins_over_queued_update() {
        let reconciler = reconciler(false);
        let user = Uuid::new_v4();
        let id = Uuid::new_v4();
        reconciler.remote.seed(user, id, &data("home"));
        reconciler.local.put(CachedLocation {
            record: make_record(id, user, &data("home")),
            pending_sync: false,
        });

        reconciler
            .update_location(user, id, data("renamed"))
            .await
            .unwrap();

        // Another device deleted the record before this one synced
        reconciler.remote.tombstone(id);

        reconciler.connectivity.set_online(true);
        let report = reconciler.sync_with_server(user).await;

        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(!report.errors[0].retryable);
        assert!(reconciler.remote.record(id).unwrap().is_deleted);
        // Dropped, not retried
        assert_eq!(reconciler.pending_sync_count(user), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_is_never_queued() {
        let reconciler = reconciler(false);
        let user = Uuid::new_v4();

        let mut bad = data("home");
        bad.name = "   ".to_string();

        let err = reconciler.add_location(user, Uuid::new_v4(), bad).await;
        assert!(matches!(err, Err(SyncError::Validation(_))));
        assert_eq!(reconciler.pending_sync_count(user), 0);
    }

    #[tokio::test]
    async fn test_default_uniqueness_after_set_default_sequence() {
        let reconciler = reconciler(true);
        let user = Uuid::new_v4();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            reconciler
                .add_location(user, *id, data(&format!("loc-{i}")))
                .await
                .unwrap();
        }

        for id in &ids {
            reconciler.set_default_location(user, *id).await.unwrap();
        }

        let records = reconciler.remote.fetch_all(user).await.unwrap();
        let defaults: Vec<_> = records.iter().filter(|r| r.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, *ids.last().unwrap());
    }

    #[tokio::test]
    async fn test_offline_set_default_queues_single_compound_mutation() {
        let reconciler = reconciler(false);
        let user = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        reconciler.add_location(user, a, data("a")).await.unwrap();
        reconciler.add_location(user, b, data("b")).await.unwrap();
        reconciler.set_default_location(user, b).await.unwrap();

        let queue = reconciler.local.queue(user);
        let set_defaults: Vec<_> = queue
            .iter()
            .filter(|m| m.op == MutationOp::SetDefault)
            .collect();
        assert_eq!(set_defaults.len(), 1);

        reconciler.connectivity.set_online(true);
        let report = reconciler.sync_with_server(user).await;
        assert!(report.success);

        let records = reconciler.remote.fetch_all(user).await.unwrap();
        let defaults: Vec<_> = records.iter().filter(|r| r.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, b);
    }

    #[tokio::test]
    async fn test_load_locations_falls_back_to_cache_offline() {
        let reconciler = reconciler(false);
        let user = Uuid::new_v4();
        let id = Uuid::new_v4();

        reconciler.add_location(user, id, data("home")).await.unwrap();

        let loaded = reconciler.load_locations(user).await.unwrap();
        assert!(loaded.offline);
        assert_eq!(loaded.data.len(), 1);
        assert!(loaded.data[0].pending_sync);
    }

    #[tokio::test]
    async fn test_load_locations_online_refreshes_cache_and_keeps_pending() {
        let reconciler = reconciler(true);
        let user = Uuid::new_v4();
        let server_id = Uuid::new_v4();
        reconciler.remote.seed(user, server_id, &data("server"));

        // One record queued locally while a previous outage lasted
        reconciler.connectivity.set_online(false);
        let pending_id = Uuid::new_v4();
        reconciler
            .add_location(user, pending_id, data("pending"))
            .await
            .unwrap();
        reconciler.connectivity.set_online(true);

        let loaded = reconciler.load_locations(user).await.unwrap();
        assert!(!loaded.offline);
        assert_eq!(loaded.data.len(), 2);
        let pending = loaded
            .data
            .iter()
            .find(|c| c.record.id == pending_id)
            .unwrap();
        assert!(pending.pending_sync);
    }
}
