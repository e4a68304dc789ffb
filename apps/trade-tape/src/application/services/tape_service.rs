//! Tape Service
//!
//! Runs one [`Reconciler`] on its own tokio task. The task is the only owner
//! of the buffer, queue and epoch; everything else talks to it through
//! [`TapeHandle`] commands, the live print stream and backfill completions.
//!
//! Each step runs to completion before the next is taken, so a live print and
//! a backfill result never interleave their mutations. The backfill fetch is
//! the only thing that suspends, and it runs on a separate task that reports
//! back over a channel tagged with its epoch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::application::ports::{
    ConsumerId, FieldKey, PrintStream, SourceError, SubscriptionGuard, TapeObserver,
    TradeDataSource, notify,
};
use crate::domain::buffer::Depth;
use crate::domain::expression::{ExpressionEvaluator, ScriptEvaluator};
use crate::domain::reconciler::{
    BackfillRequest, BackfillResolution, Epoch, LiveOutcome, Reconciler, TapeState,
};
use crate::domain::threshold::{Predicate, ThresholdSpec};
use crate::domain::trade::{Instrument, TradePrint};
use crate::infrastructure::config::{ConfigError, TapeConfig, ValidatedTapeConfig};
use crate::infrastructure::metrics::{self, PrintSource};

const COMMAND_CAPACITY: usize = 32;
const BACKFILL_CAPACITY: usize = 8;

static NEXT_CONSUMER: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Errors
// =============================================================================

/// Tape service error.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Settings were rejected; nothing changed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The trader refused the live subscription.
    #[error("activation failed: {0}")]
    Activation(#[from] SourceError),

    /// The tape task is no longer running.
    #[error("tape service has stopped")]
    Stopped,

    /// The tape task panicked.
    #[error("tape task failed: {0}")]
    TaskFailed(String),
}

// =============================================================================
// Public Types
// =============================================================================

/// Result of a history query, tagged with the epoch it was issued under.
#[derive(Debug)]
pub struct BackfillOutcome {
    /// Epoch of the instrument selection that requested it.
    pub epoch: Epoch,
    /// Prints returned by the trader, or its error.
    pub result: Result<Vec<TradePrint>, SourceError>,
}

/// Point-in-time view of a tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeSnapshot {
    /// Reconciler state.
    pub state: TapeState,
    /// Current epoch.
    pub epoch: Epoch,
    /// Bound instrument.
    pub instrument: Option<Instrument>,
    /// Buffer content, newest first.
    pub prints: Vec<TradePrint>,
    /// Live prints waiting on the backfill.
    pub queued: usize,
    /// Nothing admitted yet for the current instrument.
    pub empty: bool,
    /// Configured depth.
    pub depth: Depth,
    /// Configured threshold.
    pub threshold: ThresholdSpec,
    /// Header for the price column.
    pub price_label: String,
}

enum Command {
    SelectInstrument {
        instrument: Instrument,
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
    Reconfigure {
        config: TapeConfig,
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
    Teardown {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<TapeSnapshot>,
    },
}

// =============================================================================
// Service
// =============================================================================

/// Builder for a running tape.
pub struct TapeService {
    source: Arc<dyn TradeDataSource>,
    observer: Arc<dyn TapeObserver>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    consumer: ConsumerId,
}

impl TapeService {
    /// Create a tape over `source` reporting to `observer`.
    ///
    /// Uses the [`ScriptEvaluator`] sandbox for threshold expressions.
    #[must_use]
    pub fn new(source: Arc<dyn TradeDataSource>, observer: Arc<dyn TapeObserver>) -> Self {
        Self {
            source,
            observer,
            evaluator: Arc::new(ScriptEvaluator::new()),
            consumer: NEXT_CONSUMER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Use a different expression sandbox.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Consumer id used for trader subscriptions.
    #[must_use]
    pub const fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Validate `config` and start the tape task.
    ///
    /// The tape starts idle; bind it with [`TapeHandle::select_instrument`].
    /// Cancelling `shutdown` stops the task and releases the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid. No task is started.
    pub fn spawn(
        self,
        config: &TapeConfig,
        shutdown: CancellationToken,
    ) -> Result<TapeHandle, ConfigError> {
        let config = config.validate(self.evaluator.as_ref())?;

        let predicate = Predicate::new(config.threshold.clone(), Arc::clone(&self.evaluator));
        let reconciler = Reconciler::new(config.depth, predicate);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (backfill_tx, backfill_rx) = mpsc::channel(BACKFILL_CAPACITY);

        let actor = TapeActor {
            source: self.source,
            observer: self.observer,
            evaluator: self.evaluator,
            consumer: self.consumer,
            config,
            reconciler,
            live: None,
            backfill_tx,
        };

        let span = tracing::info_span!("tape", consumer = self.consumer);
        let task = tokio::spawn(
            actor
                .run(command_rx, backfill_rx, shutdown.clone())
                .instrument(span),
        );

        Ok(TapeHandle {
            commands: command_tx,
            shutdown,
            task,
        })
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Control surface of a running tape.
#[derive(Debug)]
pub struct TapeHandle {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TapeHandle {
    /// Bind the tape to `instrument`, starting a new epoch.
    ///
    /// Clears the tape, subscribes to live prints and, if the trader supports
    /// history, starts a backfill.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Activation`] if the subscription fails (the tape
    /// is left idle) or [`ServiceError::Stopped`] if the task is gone.
    pub async fn select_instrument(&self, instrument: Instrument) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SelectInstrument { instrument, reply })
            .await?;
        rx.await.map_err(|_| ServiceError::Stopped)?
    }

    /// Apply new settings and re-bind the current instrument.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] if `config` is invalid, in which case
    /// nothing changes.
    pub async fn reconfigure(&self, config: TapeConfig) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reconfigure { config, reply }).await?;
        rx.await.map_err(|_| ServiceError::Stopped)?
    }

    /// Unbind the instrument and release the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Stopped`] if the task is gone.
    pub async fn teardown(&self) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Teardown { reply }).await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    /// Current tape state.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Stopped`] if the task is gone.
    pub async fn snapshot(&self) -> Result<TapeSnapshot, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    /// Stop the task and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::TaskFailed`] if the task panicked.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| ServiceError::TaskFailed(e.to_string()))
    }

    async fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceError::Stopped)
    }
}

// =============================================================================
// Actor
// =============================================================================

struct LiveFeed {
    _guard: SubscriptionGuard,
    stream: PrintStream,
}

struct TapeActor {
    source: Arc<dyn TradeDataSource>,
    observer: Arc<dyn TapeObserver>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    consumer: ConsumerId,
    config: ValidatedTapeConfig,
    reconciler: Reconciler,
    live: Option<LiveFeed>,
    backfill_tx: mpsc::Sender<BackfillOutcome>,
}

impl TapeActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut backfills: mpsc::Receiver<BackfillOutcome>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            depth = self.config.depth.get(),
            threshold = %self.config.threshold,
            "Tape service started"
        );

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                print = next_print(&mut self.live) => match print {
                    Some(print) => self.handle_live(print),
                    None => {
                        tracing::warn!("Live feed ended");
                        self.live = None;
                    }
                },

                Some(outcome) = backfills.recv() => self.handle_backfill(outcome),
            }
        }

        self.live = None;
        self.reconciler.teardown();
        self.publish();

        tracing::info!("Tape service stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectInstrument { instrument, reply } => {
                let result = self.select_instrument(instrument).await;
                let _ = reply.send(result);
            }
            Command::Reconfigure { config, reply } => {
                let result = self.reconfigure(config).await;
                let _ = reply.send(result);
            }
            Command::Teardown { reply } => {
                self.live = None;
                self.reconciler.teardown();
                self.publish();
                tracing::info!("Tape torn down");
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn select_instrument(&mut self, instrument: Instrument) -> Result<(), ServiceError> {
        // Release the old subscription before the new epoch starts.
        self.live = None;

        let capabilities = self.source.capabilities();
        let request = self
            .reconciler
            .select_instrument(instrument.clone(), capabilities);
        self.publish();

        let key = FieldKey::market_print(&instrument.symbol);
        match SubscriptionGuard::acquire(Arc::clone(&self.source), self.consumer, key).await {
            Ok((guard, stream)) => {
                self.live = Some(LiveFeed {
                    _guard: guard,
                    stream,
                });
            }
            Err(e) => {
                tracing::warn!(symbol = %instrument.symbol, error = %e, "Activation failed");
                self.reconciler.teardown();
                self.publish();
                return Err(e.into());
            }
        }

        tracing::info!(
            symbol = %instrument.symbol,
            epoch = %self.reconciler.epoch(),
            backfill = request.is_some(),
            "Instrument bound"
        );

        if let Some(request) = request {
            self.spawn_backfill(request);
        }

        Ok(())
    }

    async fn reconfigure(&mut self, config: TapeConfig) -> Result<(), ServiceError> {
        let config = config.validate(self.evaluator.as_ref())?;

        let predicate = Predicate::new(config.threshold.clone(), Arc::clone(&self.evaluator));
        self.reconciler.reconfigure(config.depth, predicate);
        self.publish();

        tracing::info!(
            depth = config.depth.get(),
            threshold = %config.threshold,
            "Tape reconfigured"
        );
        self.config = config;

        if let Some(instrument) = self.reconciler.bound_instrument().cloned() {
            self.select_instrument(instrument).await?;
        }

        Ok(())
    }

    fn spawn_backfill(&self, request: BackfillRequest) {
        let source = Arc::clone(&self.source);
        let tx = self.backfill_tx.clone();

        tokio::spawn(
            async move {
                let BackfillRequest {
                    epoch,
                    instrument,
                    depth,
                } = request;

                tracing::debug!(symbol = %instrument.symbol, %epoch, depth = depth.get(), "Fetching backfill");
                let result = source.fetch_history(&instrument, depth).await;

                if tx.send(BackfillOutcome { epoch, result }).await.is_err() {
                    tracing::debug!(%epoch, "Tape stopped before backfill completed");
                }
            }
            .in_current_span(),
        );
    }

    fn handle_live(&mut self, print: TradePrint) {
        let outcome = self.reconciler.on_live_print(print);
        metrics::record_prints(PrintSource::Live, outcome.as_str(), 1);

        if let LiveOutcome::Ignored(reason) = outcome {
            tracing::trace!(?reason, "Live print ignored");
        }

        self.publish();
    }

    fn handle_backfill(&mut self, outcome: BackfillOutcome) {
        let BackfillOutcome { epoch, result } = outcome;
        let fetched = result.as_ref().map_or(0, Vec::len);

        let resolution = self.reconciler.on_backfill(epoch, result);
        metrics::record_backfill(resolution.as_str());

        match resolution {
            BackfillResolution::Applied { queued, admitted } => {
                metrics::record_prints(PrintSource::Backfill, "admitted", admitted as u64);
                metrics::record_prints(
                    PrintSource::Backfill,
                    "rejected",
                    fetched.saturating_sub(admitted) as u64,
                );
                tracing::info!(%epoch, fetched, admitted, queued, "Backfill applied");
            }
            BackfillResolution::Failed { queued } => {
                tracing::warn!(%epoch, queued, "Backfill failed, continuing with live prints");
            }
            BackfillResolution::Stale => {
                tracing::debug!(%epoch, "Stale backfill discarded");
            }
        }

        self.publish();
    }

    fn publish(&mut self) {
        for event in self.reconciler.take_events() {
            notify(self.observer.as_ref(), &event);
        }
        metrics::set_buffer_len(self.reconciler.buffer().len());
    }

    fn snapshot(&self) -> TapeSnapshot {
        let instrument = self.reconciler.bound_instrument().cloned();
        let price_label = instrument
            .as_ref()
            .map_or_else(|| "Price".to_string(), |i| self.config.price_label(i));

        TapeSnapshot {
            state: self.reconciler.state(),
            epoch: self.reconciler.epoch(),
            instrument,
            prints: self.reconciler.buffer().snapshot(),
            queued: self.reconciler.queued(),
            empty: self.reconciler.is_empty_state(),
            depth: self.config.depth,
            threshold: self.config.threshold.clone(),
            price_label,
        }
    }
}

async fn next_print(live: &mut Option<LiveFeed>) -> Option<TradePrint> {
    match live {
        Some(feed) => feed.stream.next().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
