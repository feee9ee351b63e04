use crate::domain::UserId;
use crate::domain::ports::{
    Notification, NotificationSink, StorageBackend, Table, Verdict, Verifier, WriteOp,
};
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// A thread-safe in-memory ordered key-value backend.
///
/// Uses `Arc<RwLock<BTreeMap<..>>>` to allow shared concurrent access.
/// Ideal for testing or deployments where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryBackend {
    rows: Arc<RwLock<BTreeMap<(Table, Vec<u8>), Vec<u8>>>>,
}

impl InMemoryBackend {
    /// Creates a new, empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(table, key.to_vec())).cloned())
    }

    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rows = self.rows.read().await;
        Ok(rows
            .range((table, prefix.to_vec())..)
            .take_while(|((t, key), _)| *t == table && key.starts_with(prefix))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()> {
        let mut rows = self.rows.write().await;
        for op in batch {
            match op {
                WriteOp::Put { table, key, value } => {
                    rows.insert((table, key), value);
                }
                WriteOp::Delete { table, key } => {
                    rows.remove(&(table, key));
                }
            }
        }
        Ok(())
    }
}

/// A verifier answering from facts registered in memory.
///
/// Unknown facts report `NotSatisfied`. Targets can be marked unreadable
/// (`Undetermined`) or broken (transport error) to exercise the failure paths.
#[derive(Default, Clone)]
pub struct StaticVerifier {
    memberships: Arc<RwLock<HashSet<(UserId, String)>>>,
    reactions: Arc<RwLock<HashSet<(UserId, String)>>>,
    unreadable: Arc<RwLock<HashSet<String>>>,
    broken: Arc<RwLock<HashSet<String>>>,
    calls: Arc<AtomicUsize>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant_membership(&self, user: UserId, target: &str) {
        self.memberships
            .write()
            .await
            .insert((user, target.to_string()));
    }

    pub async fn grant_reaction(&self, user: UserId, target: &str) {
        self.reactions
            .write()
            .await
            .insert((user, target.to_string()));
    }

    pub async fn mark_unreadable(&self, target: &str) {
        self.unreadable.write().await.insert(target.to_string());
    }

    pub async fn mark_broken(&self, target: &str) {
        self.broken.write().await.insert(target.to_string());
    }

    pub async fn repair(&self, target: &str) {
        self.broken.write().await.remove(target);
        self.unreadable.write().await.remove(target);
    }

    /// Number of lookups served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn lookup(
        &self,
        facts: &RwLock<HashSet<(UserId, String)>>,
        user: UserId,
        target: &str,
    ) -> Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.read().await.contains(target) {
            return Err(MarketError::Verifier(format!("lookup of {target} failed")));
        }
        if self.unreadable.read().await.contains(target) {
            return Ok(Verdict::Undetermined(format!("{target} is not readable")));
        }
        if facts.read().await.contains(&(user, target.to_string())) {
            Ok(Verdict::Satisfied)
        } else {
            Ok(Verdict::NotSatisfied)
        }
    }
}

#[async_trait]
impl Verifier for StaticVerifier {
    async fn check_membership(&self, user: UserId, target: &str) -> Result<Verdict> {
        self.lookup(&self.memberships, user, target).await
    }

    async fn check_reaction(&self, user: UserId, target: &str) -> Result<Verdict> {
        self.lookup(&self.reactions, user, target).await
    }
}

/// A notification sink that keeps everything it receives.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.sent.write().await.push(notification);
        Ok(())
    }
}
