//! In-memory outbox for tests and local development

use super::{lease_deadline, OutboxError, OutboxRecord, OutboxResult, OutboxStatus, OutboxStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    // Kept in seq order
    records: Vec<OutboxRecord>,
    next_seq: i64,
}

/// Outbox held in process memory
///
/// Writes are staged in a [`MemoryTx`] and become visible only on
/// [`MemoryTx::commit`]; dropping the transaction discards them. Other
/// in-memory repositories can join the same unit of work through
/// [`MemoryTx::on_commit`].
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a unit of work
    pub fn begin(&self) -> MemoryTx {
        MemoryTx {
            state: self.state.clone(),
            staged: Vec::new(),
            on_commit: Vec::new(),
            finished: false,
        }
    }

    /// Snapshot of all committed records in seq order
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.state().records.clone()
    }

    pub fn count_by_status(&self, status: OutboxStatus) -> usize {
        self.state()
            .records
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    fn with_record<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut OutboxRecord) -> T,
    ) -> OutboxResult<T> {
        let mut state = self.state();
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        Ok(f(record))
    }
}

/// Staged unit of work against an [`InMemoryOutboxStore`]
pub struct MemoryTx {
    state: Arc<Mutex<StoreState>>,
    staged: Vec<OutboxRecord>,
    on_commit: Vec<Box<dyn FnOnce() + Send>>,
    finished: bool,
}

impl MemoryTx {
    /// Run `effect` if and only if this transaction commits
    pub fn on_commit(&mut self, effect: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(effect));
    }

    pub fn staged(&self) -> &[OutboxRecord] {
        &self.staged
    }

    pub fn commit(mut self) -> OutboxResult<()> {
        if self.finished {
            return Err(OutboxError::TransactionClosed);
        }
        self.finished = true;

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            for mut record in self.staged.drain(..) {
                state.next_seq += 1;
                record.seq = state.next_seq;
                state.records.push(record);
            }
        }

        for effect in self.on_commit.drain(..) {
            effect();
        }
        Ok(())
    }

    /// Discard staged writes (same as dropping the transaction)
    pub fn rollback(mut self) {
        self.finished = true;
        self.staged.clear();
        self.on_commit.clear();
    }
}

impl fmt::Debug for MemoryTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTx")
            .field("staged", &self.staged.len())
            .field("on_commit", &self.on_commit.len())
            .field("finished", &self.finished)
            .finish()
    }
}

fn lease_is_free(record: &OutboxRecord, now: DateTime<Utc>) -> bool {
    match (&record.lease_owner, record.lease_expires_at) {
        (None, _) => true,
        (Some(_), Some(expires)) => expires <= now,
        (Some(_), None) => true,
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx<'t> = MemoryTx;

    async fn insert(&self, tx: &mut Self::Tx<'_>, record: &OutboxRecord) -> OutboxResult<()> {
        if tx.finished {
            return Err(OutboxError::TransactionClosed);
        }
        tx.staged.push(record.clone());
        Ok(())
    }

    async fn claim_batch(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        let now = Utc::now();
        let expires = lease_deadline(now, lease);
        let mut state = self.state();

        let mut seen_aggregates: HashSet<(String, String)> = HashSet::new();
        let mut claimed = Vec::new();

        for record in state.records.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if record.status == OutboxStatus::Published {
                continue;
            }
            // Only the oldest unpublished record of an aggregate is a candidate;
            // a failed head holds back the rest until it is requeued
            let key = (record.aggregate_type.clone(), record.aggregate_id.clone());
            if !seen_aggregates.insert(key) {
                continue;
            }
            if record.status == OutboxStatus::Failed
                || record.next_attempt_at > now
                || !lease_is_free(record, now)
            {
                continue;
            }

            record.lease_owner = Some(owner.to_string());
            record.lease_expires_at = Some(expires);
            claimed.push(record.clone());
        }

        Ok(claimed)
    }

    async fn mark_published(&self, id: Uuid, owner: &str) -> OutboxResult<bool> {
        self.with_record(id, |record| {
            if record.status != OutboxStatus::Pending
                || record.lease_owner.as_deref() != Some(owner)
            {
                return false;
            }
            record.status = OutboxStatus::Published;
            record.published_at = Some(Utc::now());
            record.lease_owner = None;
            record.lease_expires_at = None;
            true
        })
    }

    async fn record_failure(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        retry_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> OutboxResult<OutboxStatus> {
        self.with_record(id, |record| {
            if record.status != OutboxStatus::Pending
                || record.lease_owner.as_deref() != Some(owner)
            {
                return record.status;
            }
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.lease_owner = None;
            record.lease_expires_at = None;
            if record.attempts >= max_attempts {
                record.status = OutboxStatus::Failed;
            } else {
                record.next_attempt_at = retry_at;
            }
            record.status
        })
    }

    async fn release(&self, ids: &[Uuid], owner: &str) -> OutboxResult<u64> {
        let mut state = self.state();
        let mut released = 0;
        for record in state.records.iter_mut() {
            if ids.contains(&record.id)
                && record.status == OutboxStatus::Pending
                && record.lease_owner.as_deref() == Some(owner)
            {
                record.lease_owner = None;
                record.lease_expires_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> OutboxResult<u64> {
        let mut state = self.state();
        let before = state.records.len();
        state.records.retain(|r| {
            !(r.status == OutboxStatus::Published
                && r.published_at.is_some_and(|at| at < older_than))
        });
        Ok((before - state.records.len()) as u64)
    }

    async fn find(&self, id: Uuid) -> OutboxResult<Option<OutboxRecord>> {
        Ok(self.state().records.iter().find(|r| r.id == id).cloned())
    }

    async fn requeue_failed(&self, id: Uuid) -> OutboxResult<bool> {
        self.with_record(id, |record| {
            if record.status != OutboxStatus::Failed {
                return false;
            }
            record.status = OutboxStatus::Pending;
            record.attempts = 0;
            record.next_attempt_at = Utc::now();
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventEnvelope;
    use serde_json::json;

    fn record(aggregate: &str) -> OutboxRecord {
        let envelope = EventEnvelope::new(
            "billing.subscription.created",
            1,
            "subscriptions",
            json!({"subscriptionID": aggregate}),
        )
        .with_aggregate("subscription", aggregate);
        OutboxRecord::pending(&envelope, "billing.subscription.created".into()).unwrap()
    }

    async fn commit(store: &InMemoryOutboxStore, records: &[OutboxRecord]) {
        let mut tx = store.begin();
        for r in records {
            store.insert(&mut tx, r).await.unwrap();
        }
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn rollback_leaves_no_record() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin();
        store.insert(&mut tx, &record("s1")).await.unwrap();
        assert_eq!(tx.staged().len(), 1);
        drop(tx);

        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn commit_assigns_sequence_and_runs_hooks() {
        let store = InMemoryOutboxStore::new();
        let flag = Arc::new(Mutex::new(false));
        let hook_flag = flag.clone();

        let mut tx = store.begin();
        store.insert(&mut tx, &record("s1")).await.unwrap();
        store.insert(&mut tx, &record("s2")).await.unwrap();
        tx.on_commit(move || *hook_flag.lock().unwrap() = true);
        tx.commit().unwrap();

        let seqs: Vec<i64> = store.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(*flag.lock().unwrap());
    }

    #[tokio::test]
    async fn claim_only_heads_of_each_aggregate() {
        let store = InMemoryOutboxStore::new();
        let first = record("s1");
        let second = record("s1");
        let other = record("s2");
        commit(&store, &[first.clone(), second.clone(), other.clone()]).await;

        let claimed = store
            .claim_batch("relay-a", Duration::from_secs(30), 10)
            .await
            .unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, other.id]);

        // Leased heads are not claimable by another relay
        let again = store
            .claim_batch("relay-b", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert!(again.is_empty());

        assert!(store.mark_published(first.id, "relay-a").await.unwrap());
        let next = store
            .claim_batch("relay-b", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, second.id);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_old_owner_cannot_mark() {
        let store = InMemoryOutboxStore::new();
        let r = record("s1");
        commit(&store, &[r.clone()]).await;

        let claimed = store
            .claim_batch("relay-a", Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let reclaimed = store
            .claim_batch("relay-b", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);

        assert!(!store.mark_published(r.id, "relay-a").await.unwrap());
        assert!(store.mark_published(r.id, "relay-b").await.unwrap());
        assert_eq!(store.count_by_status(OutboxStatus::Published), 1);
    }

    #[tokio::test]
    async fn failures_back_off_then_fail_and_requeue() {
        let store = InMemoryOutboxStore::new();
        let r = record("s1");
        commit(&store, &[r.clone()]).await;

        store
            .claim_batch("relay", Duration::from_secs(30), 1)
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(60);
        let status = store
            .record_failure(r.id, "relay", "broker down", later, 2)
            .await
            .unwrap();
        assert_eq!(status, OutboxStatus::Pending);

        // Not due yet
        assert!(store
            .claim_batch("relay", Duration::from_secs(30), 1)
            .await
            .unwrap()
            .is_empty());

        store.with_record(r.id, |rec| rec.next_attempt_at = Utc::now()).unwrap();
        store
            .claim_batch("relay", Duration::from_secs(30), 1)
            .await
            .unwrap();
        let status = store
            .record_failure(r.id, "relay", "broker down", Utc::now(), 2)
            .await
            .unwrap();
        assert_eq!(status, OutboxStatus::Failed);

        let failed = store.find(r.id).await.unwrap().unwrap();
        assert_eq!(failed.attempts, 2);
        assert_eq!(failed.last_error.as_deref(), Some("broker down"));

        assert!(store.requeue_failed(r.id).await.unwrap());
        let requeued = store.find(r.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.attempts, 0);
    }

    #[tokio::test]
    async fn release_and_purge() {
        let store = InMemoryOutboxStore::new();
        let a = record("s1");
        let b = record("s2");
        commit(&store, &[a.clone(), b.clone()]).await;

        store
            .claim_batch("relay", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert!(store.mark_published(a.id, "relay").await.unwrap());
        assert_eq!(store.release(&[b.id], "relay").await.unwrap(), 1);
        assert!(store.find(b.id).await.unwrap().unwrap().lease_owner.is_none());

        let purged = store
            .purge_published(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn failed_head_blocks_its_aggregate() {
        let store = InMemoryOutboxStore::new();
        let first = record("s1");
        let second = record("s1");
        commit(&store, &[first.clone(), second.clone()]).await;

        store
            .claim_batch("relay", Duration::from_secs(30), 10)
            .await
            .unwrap();
        let status = store
            .record_failure(first.id, "relay", "rejected", Utc::now(), 1)
            .await
            .unwrap();
        assert_eq!(status, OutboxStatus::Failed);

        assert!(store
            .claim_batch("relay", Duration::from_secs(30), 10)
            .await
            .unwrap()
            .is_empty());

        store.requeue_failed(first.id).await.unwrap();
        let claimed = store
            .claim_batch("relay", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(claimed[0].id, first.id);
    }
}
