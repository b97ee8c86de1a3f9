//! Mirror command queue
//!
//! Applies statements to the legacy store in submission order with bounded
//! retry. One worker task drains the queue at a time; a command that exhausts
//! its attempts stops the queue for good and leaves a snapshot on disk.
//!
//! **Ordering:** FIFO, except that a failed command is put back at the *front*
//! after its backoff delay. Commands enqueued while a retry is waiting run after
//! it, so submission order holds across the queue only for commands that never
//! fail.

use super::backoff::BackoffPolicy;
use super::command::{CommandStatus, MirrorCommand, MirrorStatement, QueueState};
use super::events::QueueEvent;
use super::executor::CommandExecutor;
use super::fatal::FatalInfo;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle event channel capacity
const EVENT_CAPACITY: usize = 256;

/// Queue construction options
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub fatal_log_dir: PathBuf,
    /// Fixed jitter seed (tests); entropy when None
    pub rng_seed: Option<u64>,
}

impl QueueOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
            fatal_log_dir: config.fatal_log_dir.clone(),
            rng_seed: None,
        }
    }
}

/// Ordered, retrying queue of mirror commands
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct MirrorCommandQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    executor: Arc<dyn CommandExecutor>,
    max_attempts: u32,
    backoff: BackoffPolicy,
    fatal_log_dir: PathBuf,
    /// Waiting commands. `alive` is only cleared while this lock is held, so an
    /// accepted command is always either executed or captured in the snapshot.
    pending: Mutex<VecDeque<MirrorCommand>>,
    alive: AtomicBool,
    working: AtomicBool,
    /// Outcome of the fatal snapshot write; set once, when the queue dies
    snapshot_persisted: Mutex<Option<bool>>,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
    rng: Mutex<StdRng>,
    events: broadcast::Sender<QueueEvent>,
}

impl MirrorCommandQueue {
    pub fn new(options: QueueOptions, executor: Arc<dyn CommandExecutor>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            "Mirror queue initialized (maxAttempts={}, fatal log dir {})",
            options.max_attempts,
            options.fatal_log_dir.display()
        );

        Self {
            inner: Arc::new(QueueInner {
                executor,
                max_attempts: options.max_attempts.max(1),
                backoff: options.backoff,
                fatal_log_dir: options.fatal_log_dir,
                pending: Mutex::new(VecDeque::new()),
                alive: AtomicBool::new(true),
                working: AtomicBool::new(false),
                snapshot_persisted: Mutex::new(None),
                worker: Mutex::new(None),
                rng: Mutex::new(rng),
                events,
            }),
        }
    }

    /// Append statements to the queue
    ///
    /// Returns the accepted commands, or `None` if the queue is dead. Execution
    /// failures are never reported back here; watch [`subscribe`](Self::subscribe).
    pub fn enqueue(&self, statements: Vec<MirrorStatement>) -> Option<Vec<MirrorCommand>> {
        let commands: Vec<MirrorCommand> =
            statements.into_iter().map(MirrorCommand::new).collect();

        {
            let mut pending = self.inner.pending.lock();
            if !self.inner.alive.load(Ordering::Acquire) {
                debug!("Mirror queue is stopped, rejecting {} commands", commands.len());
                return None;
            }
            pending.extend(commands.iter().cloned());
        }

        for command in &commands {
            self.inner.emit(QueueEvent::Enqueued {
                command: command.clone(),
            });
        }
        debug!("Enqueued {} mirror commands", commands.len());

        QueueInner::kick(&self.inner);
        Some(commands)
    }

    /// Snapshot of the queue; no side effects
    pub fn get_state(&self) -> QueueState {
        QueueState {
            alive: self.inner.alive.load(Ordering::Acquire),
            working: self.inner.working.load(Ordering::Acquire),
            depth: self.inner.pending.lock().len(),
            max_attempts: self.inner.max_attempts,
            snapshot_persisted: *self.inner.snapshot_persisted.lock(),
        }
    }

    /// Receive lifecycle events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until no worker is running
    ///
    /// Returns the worker's error if it stopped on a failure that must reach an
    /// operator (a fatal snapshot that could not be written).
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            let handle = self.inner.worker.lock().take();
            let Some(handle) = handle else {
                return Ok(());
            };
            handle
                .await
                .map_err(|e| Error::Internal(format!("mirror worker task failed: {}", e)))??;
        }
    }

    /// Release executor resources (connections, tunnels)
    pub async fn shutdown(&self) {
        self.inner.executor.shutdown().await;
    }
}

impl QueueInner {
    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start the worker unless one is already running or the queue is dead
    fn kick(inner: &Arc<QueueInner>) {
        if !inner.alive.load(Ordering::Acquire) {
            return;
        }
        if inner
            .working
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Spawn under the slot lock so a successor kicked by this worker cannot
        // store its handle first and be overwritten.
        let mut slot = inner.worker.lock();
        *slot = Some(tokio::spawn(Self::run_worker(Arc::clone(inner))));
    }

    // Boxed: the worker may kick (spawn) its own successor.
    fn run_worker(inner: Arc<QueueInner>) -> BoxFuture<'static, Result<()>> {
        async move {
            debug!("Mirror worker started");
            let result = match AssertUnwindSafe(inner.drain()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    error!("Mirror worker panicked: {}", panic_message(&*panic));
                    Err(Error::Internal(format!(
                        "mirror worker panicked: {}",
                        panic_message(&*panic)
                    )))
                }
            };
            inner.working.store(false, Ordering::Release);
            debug!("Mirror worker stopped");

            // A producer may have enqueued after the last pop but before the flag
            // was cleared; its kick saw `working` and backed off.
            let leftover = !inner.pending.lock().is_empty();
            if result.is_ok() && leftover {
                Self::kick(&inner);
            }
            result
        }
        .boxed()
    }

    async fn drain(&self) -> Result<()> {
        loop {
            if !self.alive.load(Ordering::Acquire) {
                return Ok(());
            }
            let next = self.pending.lock().pop_front();
            let Some(mut command) = next else {
                return Ok(());
            };

            command.attempts += 1;
            command.status = CommandStatus::InProgress;
            debug!(
                "Mirror command {} attempt {}/{}",
                command.id, command.attempts, self.max_attempts
            );
            self.emit(QueueEvent::Started {
                command: command.clone(),
            });

            // A panicking executor counts as a failed attempt
            let attempt = AssertUnwindSafe(self.executor.execute(&command.payload))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(Error::Internal(format!(
                        "executor panicked: {}",
                        panic_message(&*panic)
                    )))
                });

            match attempt {
                Ok(outcome) => {
                    command.status = CommandStatus::Completed;
                    command.last_result = Some(outcome);
                    command.last_error = None;
                    info!(
                        "Mirror command {} applied after {} attempt(s)",
                        command.id, command.attempts
                    );
                    self.emit(QueueEvent::Succeeded { command });
                }
                Err(e) => {
                    command.last_error = Some(e.to_string());

                    if command.attempts >= self.max_attempts {
                        command.status = CommandStatus::Failed;
                        return self.fatal_stop(command).await;
                    }

                    command.status = CommandStatus::InProgressRetrying;
                    let delay = self
                        .backoff
                        .compute_delay(command.attempts, &mut *self.rng.lock());
                    warn!(
                        "Mirror command {} attempt {} failed: {} (retry in {}ms)",
                        command.id,
                        command.attempts,
                        e,
                        delay.as_millis()
                    );
                    self.emit(QueueEvent::FailedAttempt {
                        command: command.clone(),
                        retry_in_ms: delay.as_millis() as u64,
                    });

                    tokio::time::sleep(delay).await;

                    command.status = CommandStatus::Pending;
                    self.pending.lock().push_front(command);
                }
            }
        }
    }

    /// Kill the queue, snapshot what is left and persist it
    ///
    /// Only the single worker reaches this, so the dead transition and the
    /// `Fatal` event happen once per queue.
    async fn fatal_stop(&self, command: MirrorCommand) -> Result<()> {
        let pending_queue: Vec<MirrorCommand> = {
            let pending = self.pending.lock();
            if !self.alive.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            pending.iter().cloned().collect()
        };

        let reason = Error::FatalQueueExhaustion {
            command_id: command.id,
            attempts: command.attempts,
            reason: command
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
        .to_string();
        error!("{} ({} commands left pending)", reason, pending_queue.len());

        let info = FatalInfo::new(command, pending_queue, reason, &self.fatal_log_dir);
        let persisted = info.persist().await;

        self.emit(QueueEvent::Fatal { info });

        *self.snapshot_persisted.lock() = Some(persisted.is_ok());
        match persisted {
            Ok(path) => {
                self.emit(QueueEvent::Persisted { path });
                Ok(())
            }
            Err(e) => {
                error!("Mirror queue fatal snapshot was NOT written: {}", e);
                let path = match &e {
                    Error::PersistenceFailure { path, .. } => path.clone(),
                    _ => self.fatal_log_dir.clone(),
                };
                self.emit(QueueEvent::PersistFailed {
                    path,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
