//! Async front for the tokenizer worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::job::{GrammarMap, TokenizeJob, TokenizeResult};
use super::message::{InboundMessage, OutboundMessage, OutboundPayload, ReplyPayload};
use super::worker::WorkerHandle;
use crate::error::LockResultExt;
use crate::pending::PendingMap;
use crate::theme::ThemeRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The worker rejected this one job.
    #[error("{op} failed: {message}")]
    Job { op: &'static str, message: String },

    /// The worker died with this job in flight.
    #[error("tokenizer worker crashed: {message}")]
    WorkerCrashed { message: String },

    #[error("failed to start tokenizer worker: {message}")]
    Spawn { message: String },

    #[error("tokenizer worker unavailable")]
    WorkerGone,

    #[error("unexpected worker reply to {op}")]
    UnexpectedReply { op: &'static str },
}

/// Owner of the tokenizer worker and its pending-job table.
///
/// Construct one per process and pass it by reference. The worker thread is
/// spawned on first use. If it dies, every job in flight is rejected, the
/// slot is cleared, and the next call spawns a fresh worker (replaying the
/// last successful grammar registration).
pub struct TokenizerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    themes: Arc<ThemeRegistry>,
    next_id: AtomicU64,
    pending: PendingMap<ReplyPayload, PoolError>,
    worker: Mutex<Option<WorkerHandle>>,
    generations: AtomicU64,
    grammars: Mutex<Option<GrammarMap>>,
}

impl TokenizerPool {
    pub fn new(themes: Arc<ThemeRegistry>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                themes,
                next_id: AtomicU64::new(1),
                pending: PendingMap::new(),
                worker: Mutex::new(None),
                generations: AtomicU64::new(0),
                grammars: Mutex::new(None),
            }),
        }
    }

    /// Replace the worker's registered grammars.
    pub async fn initialize_worker_grammars(&self, grammars: GrammarMap) -> Result<(), PoolError> {
        match self.submit(OutboundPayload::Init(grammars.clone())).await? {
            ReplyPayload::Initialized { grammar_count } => {
                info!(
                    target: "tincture::tokenize::pool",
                    "Worker grammars initialized ({} grammars)",
                    grammar_count
                );
                *self
                    .inner
                    .grammars
                    .lock()
                    .recover_poison("TokenizerPool::initialize_worker_grammars") = Some(grammars);
                Ok(())
            }
            ReplyPayload::Tokenized(_) => Err(PoolError::UnexpectedReply { op: "init" }),
        }
    }

    pub async fn run_tokenize_job(&self, job: TokenizeJob) -> Result<TokenizeResult, PoolError> {
        match self.submit(OutboundPayload::Tokenize(job)).await? {
            ReplyPayload::Tokenized(result) => Ok(result),
            ReplyPayload::Initialized { .. } => Err(PoolError::UnexpectedReply { op: "tokenize" }),
        }
    }

    /// Number of jobs awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// How many worker threads have been spawned so far.
    pub fn worker_generation(&self) -> u64 {
        self.inner.generations.load(Ordering::SeqCst)
    }

    pub fn themes(&self) -> &Arc<ThemeRegistry> {
        &self.inner.themes
    }

    async fn submit(&self, payload: OutboundPayload) -> Result<ReplyPayload, PoolError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = PoolInner::dispatch(&self.inner, id, payload)?;
        rx.await.unwrap_or(Err(PoolError::WorkerGone))
    }

    #[cfg(test)]
    pub(crate) async fn crash_worker(&self) -> Result<(), PoolError> {
        self.submit(OutboundPayload::Crash).await.map(|_| ())
    }
}

impl PoolInner {
    /// Register the job, then hand it to the worker.
    ///
    /// Registration happens before the send so a reply can never beat its
    /// pending entry. A send that finds the worker gone clears the slot and
    /// retries once on a fresh worker.
    fn dispatch(
        this: &Arc<Self>,
        id: u64,
        payload: OutboundPayload,
    ) -> Result<oneshot::Receiver<Result<ReplyPayload, PoolError>>, PoolError> {
        let mut slot = this.worker.lock().recover_poison("TokenizerPool::dispatch");
        let mut message = OutboundMessage { id, payload };

        for _ in 0..2 {
            if slot.is_none() {
                *slot = Some(Self::spawn_worker(this)?);
            }
            let Some(handle) = slot.as_ref() else {
                return Err(PoolError::WorkerGone);
            };

            let rx = this
                .pending
                .register(id, handle.generation)
                .ok_or(PoolError::WorkerGone)?;
            match handle.send(message) {
                Ok(()) => return Ok(rx),
                Err(returned) => {
                    warn!(
                        target: "tincture::tokenize::pool",
                        "Worker generation {} is gone, respawning",
                        handle.generation
                    );
                    this.pending.remove(id);
                    *slot = None;
                    message = returned;
                }
            }
        }

        Err(PoolError::WorkerGone)
    }

    fn spawn_worker(this: &Arc<Self>) -> Result<WorkerHandle, PoolError> {
        let generation = this.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::spawn(generation, Arc::clone(&this.themes), reply_tx)
            .map_err(|e| PoolError::Spawn {
                message: e.to_string(),
            })?;

        // One reply handler per worker instance.
        tokio::spawn(dispatch_replies(Arc::downgrade(this), generation, reply_rx));
        info!(
            target: "tincture::tokenize::pool",
            "Spawned tokenizer worker generation {}",
            generation
        );

        let grammars = this
            .grammars
            .lock()
            .recover_poison("TokenizerPool::spawn_worker")
            .clone();
        if let Some(grammars) = grammars {
            // Unregistered id: the reply is dropped by the dispatcher.
            let id = this.next_id.fetch_add(1, Ordering::SeqCst);
            let replay = OutboundMessage {
                id,
                payload: OutboundPayload::Init(grammars),
            };
            if handle.send(replay).is_err() {
                warn!(
                    target: "tincture::tokenize::pool",
                    "Could not replay grammars to worker generation {}",
                    generation
                );
            }
        }

        Ok(handle)
    }

    /// Forget a dead worker and reject everything it still held.
    fn retire(&self, generation: u64, reason: &str) {
        {
            let mut slot = self.worker.lock().recover_poison("TokenizerPool::retire");
            if slot
                .as_ref()
                .is_some_and(|handle| handle.generation == generation)
            {
                *slot = None;
            }
        }

        let failed = self.pending.fail_tagged(generation, || PoolError::WorkerCrashed {
            message: reason.to_string(),
        });
        if failed > 0 {
            warn!(
                target: "tincture::tokenize::pool",
                "Rejected {} pending jobs of worker generation {}",
                failed,
                generation
            );
        }
    }
}

async fn dispatch_replies(
    inner: Weak<PoolInner>,
    generation: u64,
    mut replies: mpsc::UnboundedReceiver<InboundMessage>,
) {
    let mut fatal: Option<String> = None;

    while let Some(message) = replies.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let tag = message.type_tag();
        match message {
            InboundMessage::Ok { id, payload, .. } => {
                if !inner.pending.complete(id, Ok(payload)) {
                    debug!(
                        target: "tincture::tokenize::pool",
                        "{} for job {} with no waiter",
                        tag,
                        id
                    );
                }
            }
            InboundMessage::Error { id, op, error } => {
                debug!(
                    target: "tincture::tokenize::pool",
                    "{} for job {}: {}",
                    tag,
                    id,
                    error
                );
                inner.pending.complete(
                    id,
                    Err(PoolError::Job {
                        op: op.as_str(),
                        message: error,
                    }),
                );
            }
            InboundMessage::Fatal { error } => {
                error!(
                    target: "tincture::tokenize::pool",
                    "Tokenizer worker generation {} crashed: {}",
                    generation,
                    error
                );
                inner.retire(generation, &error);
                fatal = Some(error);
            }
        }
    }

    // The worker thread has exited; sweep jobs sent after the fatal signal.
    if let Some(inner) = inner.upgrade() {
        let reason = fatal.unwrap_or_else(|| "worker exited".to_string());
        inner.retire(generation, &reason);
    }
}
