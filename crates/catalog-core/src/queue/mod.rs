//! Offline mutation queue.
//!
//! Writes attempted while disconnected are persisted as [`QueuedMutation`]s
//! and replayed in creation order once connectivity returns. Each entry gets
//! at most `max_retries + 1` attempts; after that it is removed and reported
//! as [`Error::MutationExhausted`]. Delivery is at-least-once, so processors
//! must tolerate replays.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::events::MutationEvent;
use crate::models::{MutationId, QueuedMutation, UserKey};
use crate::network::{Connectivity, ReachabilityMonitor};
use crate::store::KeyValueStore;

const MUTATIONS_PREFIX: &str = "mutations";
const EVENT_CAPACITY: usize = 64;

/// The real write operation behind a mutation kind.
#[async_trait]
pub trait MutationProcessor: Send + Sync {
    async fn process(&self, mutation: &QueuedMutation) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MutationProcessor for F
where
    F: Fn(QueuedMutation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn process(&self, mutation: &QueuedMutation) -> Result<()> {
        (self)(mutation.clone()).await
    }
}

/// Summary of one [`MutationQueue::drain`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    /// Failed but still within budget
    pub retrying: usize,
    /// Left for the next drain behind an earlier failure of the same kind
    pub deferred: usize,
    /// No processor registered for the kind
    pub unhandled: usize,
    pub exhausted: Vec<Error>,
    /// Another drain was running and will make an extra pass instead
    pub absorbed: bool,
    /// Skipped because the monitor reports no connectivity
    pub offline: bool,
}

impl DrainReport {
    fn absorb(&mut self, pass: Self) {
        self.completed += pass.completed;
        self.retrying += pass.retrying;
        self.deferred += pass.deferred;
        self.unhandled += pass.unhandled;
        self.exhausted.extend(pass.exhausted);
    }
}

/// How [`MutationQueue::submit`] handled a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "id", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Applied,
    Queued(MutationId),
}

#[derive(Debug, Default)]
struct DrainState {
    draining: bool,
    rerun: bool,
}

/// Resets the drain flags if a drain ends early, by error or by being dropped.
struct DrainGuard<'a> {
    state: &'a Mutex<DrainState>,
    armed: bool,
}

impl DrainGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.draining = false;
        state.rerun = false;
    }
}

struct QueueInner {
    kv: Arc<dyn KeyValueStore>,
    user: UserKey,
    monitor: ReachabilityMonitor,
    default_max_retries: u32,
    processors: RwLock<HashMap<String, Arc<dyn MutationProcessor>>>,
    next_sequence: tokio::sync::Mutex<Option<u64>>,
    drain_state: Mutex<DrainState>,
    events: broadcast::Sender<MutationEvent>,
}

/// Durable per-user write queue
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        user: UserKey,
        monitor: ReachabilityMonitor,
        default_max_retries: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                kv,
                user,
                monitor,
                default_max_retries,
                processors: RwLock::new(HashMap::new()),
                next_sequence: tokio::sync::Mutex::new(None),
                drain_state: Mutex::new(DrainState::default()),
                events,
            }),
        }
    }

    pub fn default_max_retries(&self) -> u32 {
        self.inner.default_max_retries
    }

    pub fn user(&self) -> &UserKey {
        &self.inner.user
    }

    /// Associate `kind` with its write function, replacing any previous one.
    pub fn register_processor<P>(&self, kind: impl Into<String>, processor: P)
    where
        P: MutationProcessor + 'static,
    {
        let kind = kind.into().trim().to_string();
        let replaced = self
            .inner
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.clone(), Arc::new(processor))
            .is_some();
        tracing::debug!(%kind, replaced, "Registered mutation processor");
    }

    /// Receive queue notifications. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.inner.events.subscribe()
    }

    /// Persist a mutation for later replay.
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
        max_retries: u32,
    ) -> Result<MutationId> {
        let kind = kind.trim();
        if kind.is_empty() {
            return Err(Error::InvalidInput(
                "mutation kind must not be empty".to_string(),
            ));
        }

        let mut next_sequence = self.inner.next_sequence.lock().await;
        let sequence = match *next_sequence {
            Some(sequence) => sequence,
            None => self.sequence_after_stored().await?,
        };
        let mutation = QueuedMutation::new(kind, payload, max_retries, sequence);
        self.persist(&mutation).await?;
        *next_sequence = Some(sequence + 1);
        drop(next_sequence);

        tracing::debug!(id = %mutation.id, %kind, sequence, "Mutation queued");
        let _ = self.inner.events.send(MutationEvent::Enqueued {
            id: mutation.id,
            kind: mutation.kind.clone(),
        });
        Ok(mutation.id)
    }

    /// Apply a write now when possible, otherwise queue it.
    ///
    /// Writes are queued when offline, when earlier writes of the same kind
    /// are still pending, or when the direct attempt fails transiently.
    pub async fn submit(
        &self,
        kind: &str,
        payload: serde_json::Value,
        max_retries: u32,
    ) -> Result<SubmitOutcome> {
        let kind = kind.trim();
        let offline = self.inner.monitor.current() == Connectivity::Offline;
        let processor = self.processor(kind);
        let must_queue = offline
            || processor.is_none()
            || self
                .pending()
                .await?
                .iter()
                .any(|mutation| mutation.kind == kind);

        let Some(processor) = processor.filter(|_| !must_queue) else {
            let id = self.enqueue(kind, payload, max_retries).await?;
            return Ok(SubmitOutcome::Queued(id));
        };

        let attempt = QueuedMutation::new(kind, payload, max_retries, 0);
        match processor.process(&attempt).await {
            Ok(()) => Ok(SubmitOutcome::Applied),
            Err(error @ Error::TransientNetwork(_)) => {
                tracing::info!(%kind, "Direct write failed, queuing: {error}");
                let id = self
                    .enqueue(kind, attempt.payload, max_retries)
                    .await?;
                Ok(SubmitOutcome::Queued(id))
            }
            Err(error) => Err(error),
        }
    }

    /// Queued mutations in creation order.
    pub async fn pending(&self) -> Result<Vec<QueuedMutation>> {
        let entries = self.inner.kv.scan_prefix(&self.prefix()).await?;
        let mut pending = Vec::with_capacity(entries.len());
        let mut corrupt = Vec::new();
        for (key, value) in entries {
            match serde_json::from_str::<QueuedMutation>(&value) {
                Ok(mutation) => pending.push(mutation),
                Err(error) => {
                    tracing::warn!(%key, "Dropping undecodable queued mutation: {error}");
                    corrupt.push(key);
                }
            }
        }
        if !corrupt.is_empty() {
            self.inner.kv.delete_many(&corrupt).await?;
        }
        Ok(pending)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.inner.kv.scan_prefix(&self.prefix()).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop every queued mutation of this user.
    pub async fn clear(&self) -> Result<usize> {
        let keys: Vec<String> = self
            .inner
            .kv
            .scan_prefix(&self.prefix())
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        self.inner.kv.delete_many(&keys).await?;
        if !keys.is_empty() {
            tracing::info!(user = %self.inner.user, removed = keys.len(), "Mutation queue cleared");
        }
        Ok(keys.len())
    }

    /// Replay queued mutations in creation order.
    ///
    /// A call made while another drain is running returns at once with
    /// `absorbed` set; the running drain then makes one more pass.
    pub async fn drain(&self) -> Result<DrainReport> {
        {
            let mut state = self
                .inner
                .drain_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.draining {
                state.rerun = true;
                tracing::debug!("Drain already running, request absorbed");
                return Ok(DrainReport {
                    absorbed: true,
                    ..DrainReport::default()
                });
            }
            state.draining = true;
        }
        let mut guard = DrainGuard {
            state: &self.inner.drain_state,
            armed: true,
        };

        if self.inner.monitor.current() == Connectivity::Offline {
            tracing::debug!("Offline, drain skipped");
            return Ok(DrainReport {
                offline: true,
                ..DrainReport::default()
            });
        }

        let mut report = DrainReport::default();
        loop {
            let pass = self.drain_pass().await?;
            report.absorb(pass);

            let mut state = self
                .inner
                .drain_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !state.rerun {
                state.draining = false;
                guard.disarm();
                break;
            }
            state.rerun = false;
        }

        if report.completed + report.retrying + report.exhausted.len() > 0 {
            tracing::info!(
                completed = report.completed,
                retrying = report.retrying,
                exhausted = report.exhausted.len(),
                deferred = report.deferred,
                "Mutation queue drained"
            );
        }
        Ok(report)
    }

    /// Drain every time the monitor reports a reconnect.
    ///
    /// Stops at the first reconnect after the queue itself is dropped.
    pub fn spawn_reconnect_drain(&self) -> JoinHandle<()> {
        let mut subscription = self.inner.monitor.subscribe();
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while subscription.reconnected().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let this = Self { inner };
                if let Err(error) = this.drain().await {
                    tracing::warn!("Reconnect drain failed: {error}");
                }
            }
        })
    }

    async fn drain_pass(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut blocked_kinds: HashSet<String> = HashSet::new();

        for mut mutation in self.pending().await? {
            if blocked_kinds.contains(&mutation.kind) {
                report.deferred += 1;
                continue;
            }

            let Some(processor) = self.processor(&mutation.kind) else {
                tracing::warn!(id = %mutation.id, kind = %mutation.kind, "No processor registered, leaving queued");
                report.unhandled += 1;
                continue;
            };

            match processor.process(&mutation).await {
                Ok(()) => {
                    self.remove(&mutation).await?;
                    report.completed += 1;
                    tracing::debug!(id = %mutation.id, kind = %mutation.kind, "Mutation replayed");
                    let _ = self.inner.events.send(MutationEvent::Completed {
                        id: mutation.id,
                        kind: mutation.kind,
                    });
                }
                Err(error) => {
                    mutation.record_failure(error.to_string());
                    if mutation.is_exhausted() {
                        self.remove(&mutation).await?;
                        let exhausted = Error::MutationExhausted {
                            id: mutation.id,
                            kind: mutation.kind.clone(),
                            attempts: mutation.attempt_count,
                            reason: error.to_string(),
                        };
                        tracing::warn!("{exhausted}");
                        let _ = self
                            .inner
                            .events
                            .send(MutationEvent::Exhausted(exhausted.clone()));
                        report.exhausted.push(exhausted);
                    } else {
                        self.persist(&mutation).await?;
                        tracing::info!(
                            id = %mutation.id,
                            kind = %mutation.kind,
                            attempts = mutation.attempt_count,
                            "Mutation failed, will retry: {error}"
                        );
                        let _ = self.inner.events.send(MutationEvent::Retrying {
                            id: mutation.id,
                            kind: mutation.kind.clone(),
                            attempts: mutation.attempt_count,
                            reason: error.to_string(),
                        });
                        report.retrying += 1;
                        blocked_kinds.insert(mutation.kind);
                    }
                }
            }
        }

        Ok(report)
    }

    fn processor(&self, kind: &str) -> Option<Arc<dyn MutationProcessor>> {
        self.inner
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    async fn sequence_after_stored(&self) -> Result<u64> {
        let entries = self.inner.kv.scan_prefix(&self.prefix()).await?;
        let last = entries
            .last()
            .and_then(|(key, _)| key.rsplit('/').next())
            .and_then(|suffix| suffix.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(last + 1)
    }

    async fn persist(&self, mutation: &QueuedMutation) -> Result<()> {
        let serialized = serde_json::to_string(mutation)?;
        self.inner
            .kv
            .put(&self.key(mutation.sequence), &serialized)
            .await
    }

    async fn remove(&self, mutation: &QueuedMutation) -> Result<()> {
        self.inner.kv.delete(&self.key(mutation.sequence)).await?;
        Ok(())
    }

    fn prefix(&self) -> String {
        format!("{MUTATIONS_PREFIX}/{}/", self.inner.user.as_str())
    }

    fn key(&self, sequence: u64) -> String {
        format!("{}{sequence:020}", self.prefix())
    }
}
