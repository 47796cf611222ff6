//! BatchOrchestrator: drives fetch → generate → validate → aggregate →
//! persist over many sources.
//!
//! Sources are processed in fixed-size slices. Every source of a slice runs
//! in its own task; the controlling loop joins them in order, updates the
//! [`BatchState`], and checkpoints the run before starting the next slice.
//! A crash loses at most the slice in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use mcpextract_crawler::SourceFetcher;
use mcpextract_shared::{
    BatchConfig, Disposition, ExtractorError, GenerationOutcome, OutputRecord, Result, RunId,
    SourceId,
};
use mcpextract_storage::RecordStore;

use crate::aggregator::ConfidenceAggregator;
use crate::generator::ConfigGenerator;
use crate::validator::validate;

// ---------------------------------------------------------------------------
// Per-source state machine
// ---------------------------------------------------------------------------

/// Lifecycle of one source within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Pending,
    InFlight,
    /// Dispositioned through the pipeline.
    Completed(Disposition),
    /// Terminal fault (fetch error, exhausted generation, panic, or
    /// persistence failure).
    Failed,
}

impl SourceState {
    fn can_become(self, next: SourceState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Completed(_))
                | (Self::InFlight, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Completed(_) => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A source needing a human.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttentionItem {
    pub source: SourceId,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// BatchState
// ---------------------------------------------------------------------------

/// Run-scoped progress, owned and mutated only by the controlling loop.
#[derive(Debug)]
pub struct BatchState {
    pub run_id: RunId,
    order: Vec<SourceId>,
    states: HashMap<SourceId, SourceState>,
    pub approved: usize,
    pub needs_review: usize,
    pub rejected: usize,
    /// Sources that ended in [`SourceState::Failed`].
    pub failed: usize,
    /// Already persisted by an earlier run.
    pub skipped: usize,
    /// Repeated within the input list.
    pub duplicates: usize,
    /// New sources left out by the run limit.
    pub deferred: usize,
    /// Per-unit error log.
    pub errors: Vec<(SourceId, String)>,
    pub attention: Vec<AttentionItem>,
    pub cancelled: bool,
    /// Set when a persistence fault stopped the run.
    pub aborted: Option<String>,
    pub elapsed: Duration,
}

impl BatchState {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            order: Vec::new(),
            states: HashMap::new(),
            approved: 0,
            needs_review: 0,
            rejected: 0,
            failed: 0,
            skipped: 0,
            duplicates: 0,
            deferred: 0,
            errors: Vec::new(),
            attention: Vec::new(),
            cancelled: false,
            aborted: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Add a source in the pending state.
    pub fn register(&mut self, source: SourceId) {
        if self.states.insert(source.clone(), SourceState::Pending).is_none() {
            self.order.push(source);
        }
    }

    pub fn state_of(&self, source: &SourceId) -> Option<SourceState> {
        self.states.get(source).copied()
    }

    /// Apply one transition of the per-source state machine.
    pub fn transition(&mut self, source: &SourceId, next: SourceState) -> Result<()> {
        let current = self.states.get_mut(source).ok_or_else(|| {
            ExtractorError::validation(format!("{source} is not part of this run"))
        })?;
        if !current.can_become(next) {
            return Err(ExtractorError::validation(format!(
                "{source}: illegal transition {} -> {}",
                current.as_str(),
                next.as_str()
            )));
        }
        *current = next;
        Ok(())
    }

    /// Account for a persisted record.
    fn record_outcome(&mut self, record: &OutputRecord, failed: bool) -> Result<()> {
        let next = if failed {
            SourceState::Failed
        } else {
            SourceState::Completed(record.disposition)
        };
        self.transition(&record.source_id, next)?;

        match record.disposition {
            Disposition::Approved => self.approved += 1,
            Disposition::NeedsReview => self.needs_review += 1,
            Disposition::Rejected => self.rejected += 1,
        }
        if failed {
            self.failed += 1;
            if let Some(error) = &record.error {
                self.errors.push((record.source_id.clone(), error.clone()));
            }
        }
        if record.disposition.needs_attention() {
            self.attention.push(AttentionItem {
                source: record.source_id.clone(),
                disposition: record.disposition,
                error: record.error.clone(),
            });
        }
        Ok(())
    }

    /// Account for a source that ended without a persisted record.
    fn record_fault(&mut self, source: &SourceId, error: String) -> Result<()> {
        self.transition(source, SourceState::Failed)?;
        self.failed += 1;
        self.errors.push((source.clone(), error.clone()));
        self.attention.push(AttentionItem {
            source: source.clone(),
            disposition: Disposition::Rejected,
            error: Some(error),
        });
        Ok(())
    }

    fn count(&self, wanted: fn(&SourceState) -> bool) -> usize {
        self.states.values().filter(|s| wanted(s)).count()
    }

    pub fn pending(&self) -> usize {
        self.count(|s| matches!(s, SourceState::Pending))
    }

    pub fn in_flight(&self) -> usize {
        self.count(|s| matches!(s, SourceState::InFlight))
    }

    /// Sources that reached a terminal state in this run.
    pub fn processed(&self) -> usize {
        self.count(|s| matches!(s, SourceState::Completed(_) | SourceState::Failed))
    }

    /// Sources still pending, in input order.
    pub fn pending_sources(&self) -> Vec<&SourceId> {
        self.order
            .iter()
            .filter(|s| self.states.get(*s) == Some(&SourceState::Pending))
            .collect()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            run_id: self.run_id.to_string(),
            processed: self.processed(),
            approved: self.approved,
            needs_review: self.needs_review,
            rejected: self.rejected,
            failed: self.failed,
            skipped: self.skipped,
            duplicates: self.duplicates,
            deferred: self.deferred,
            pending: self.pending(),
            elapsed_ms: self.elapsed.as_millis() as u64,
            attention: self.attention.clone(),
            cancelled: self.cancelled,
            aborted: self.aborted.clone(),
        }
    }
}

/// Serializable end-of-run (or checkpoint) summary.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub processed: usize,
    pub approved: usize,
    pub needs_review: usize,
    pub rejected: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub pending: usize,
    pub elapsed_ms: u64,
    pub attention: Vec<AttentionItem>,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl BatchSummary {
    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for batch runs.
pub trait BatchProgress: Send + Sync {
    /// Called once dedup is done.
    fn run_started(&self, to_process: usize, skipped: usize);
    fn slice_started(&self, index: usize, size: usize);
    fn source_finished(&self, source: &SourceId, disposition: Disposition, confidence: f64);
    fn done(&self, summary: &BatchSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn run_started(&self, _to_process: usize, _skipped: usize) {}
    fn slice_started(&self, _index: usize, _size: usize) {}
    fn source_finished(&self, _source: &SourceId, _disposition: Disposition, _confidence: f64) {}
    fn done(&self, _summary: &BatchSummary) {}
}

// ---------------------------------------------------------------------------
// Per-source pipeline
// ---------------------------------------------------------------------------

/// How one source task ended.
#[derive(Debug)]
enum SourceOutcome {
    /// A record was persisted; `failed` marks a terminal fault record.
    Recorded { record: OutputRecord, failed: bool },
    /// Transient fetch failure. Nothing is persisted, so a later run picks
    /// the source up again.
    Unrecorded { error: String },
}

/// Everything one source task needs; cheap to clone into a task.
#[derive(Clone)]
struct Pipeline {
    fetcher: Arc<dyn SourceFetcher>,
    generator: Arc<ConfigGenerator>,
    store: Arc<dyn RecordStore>,
    aggregator: ConfidenceAggregator,
    config: BatchConfig,
}

impl Pipeline {
    /// Run one source to its outcome. `Err` only for persistence faults.
    #[instrument(skip_all, fields(source = %source))]
    async fn process(&self, source: SourceId) -> Result<SourceOutcome> {
        let bundle = match self.fetcher.fetch(&source).await {
            Ok(bundle) => bundle,
            Err(e) => {
                if !e.is_inaccessible() {
                    warn!(error = %e, "fetch failed, leaving source for a later run");
                    return Ok(SourceOutcome::Unrecorded {
                        error: format!("fetch failed: {e}"),
                    });
                }
                warn!(error = %e, "source inaccessible, not retrying");
                let record = OutputRecord::failed(source, format!("fetch failed: {e}"));
                self.store.save(&record).await?;
                return Ok(SourceOutcome::Recorded {
                    record,
                    failed: true,
                });
            }
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let (record, failed) = loop {
            attempt += 1;
            match self.generator.generate(&bundle).await {
                GenerationOutcome::Failure(failure) => {
                    if attempt < max_attempts {
                        let delay = self.config.backoff(attempt);
                        warn!(
                            attempt,
                            error = %failure.error,
                            delay_ms = delay.as_millis() as u64,
                            "generation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let record = OutputRecord::failed(
                        source.clone(),
                        format!(
                            "generation failed after {attempt} attempts: {}",
                            failure.error
                        ),
                    );
                    break (record, true);
                }
                GenerationOutcome::Success(candidate) => {
                    let report = validate(&candidate);
                    if !report.is_valid() && attempt < max_attempts {
                        let delay = self.config.backoff(attempt);
                        warn!(
                            attempt,
                            errors = report.errors.len(),
                            delay_ms = delay.as_millis() as u64,
                            "candidate structurally invalid, regenerating"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let scored = self.aggregator.aggregate(&candidate, &report);
                    let record = OutputRecord::from_scored(
                        source.clone(),
                        &candidate,
                        &report,
                        scored.disposition,
                        scored.confidence,
                    );
                    break (record, false);
                }
            }
        };

        let record = record
            .with_attempts(attempt)
            .with_bundle_hash(bundle.digest());
        self.store.save(&record).await?;
        info!(
            disposition = %record.disposition,
            confidence = record.confidence,
            attempts = attempt,
            "source dispositioned"
        );
        Ok(SourceOutcome::Recorded { record, failed })
    }
}

// ---------------------------------------------------------------------------
// BatchOrchestrator
// ---------------------------------------------------------------------------

/// Runs the extraction pipeline over a list of sources.
pub struct BatchOrchestrator {
    pipeline: Pipeline,
}

impl BatchOrchestrator {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        generator: Arc<ConfigGenerator>,
        store: Arc<dyn RecordStore>,
        aggregator: ConfidenceAggregator,
        config: BatchConfig,
    ) -> Self {
        Self {
            pipeline: Pipeline {
                fetcher,
                generator,
                store,
                aggregator,
                config,
            },
        }
    }

    /// Process `sources`. Always returns a state describing the run; a
    /// persistence fault sets [`BatchState::aborted`] once the current slice
    /// has drained. Setting `cancel` to `true` stops dispatching new slices.
    #[instrument(skip_all, fields(sources = sources.len()))]
    pub async fn run(
        &self,
        sources: &[SourceId],
        progress: &dyn BatchProgress,
        cancel: &watch::Receiver<bool>,
    ) -> BatchState {
        let start = Instant::now();
        let store = &self.pipeline.store;
        let config = &self.pipeline.config;
        let mut state = BatchState::new(RunId::new());

        info!(run_id = %state.run_id, batch_size = config.batch_size, "starting batch run");

        // --- Dedup against the input list and persisted records ---
        let mut seen = HashSet::new();
        let mut to_process = Vec::new();
        for source in sources {
            if !seen.insert(source) {
                state.duplicates += 1;
                continue;
            }
            match store.exists(source).await {
                Ok(true) => {
                    state.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    return self.abort(state, start, format!("dedup lookup failed: {e}"), progress);
                }
            }
            if config.limit.is_some_and(|limit| to_process.len() >= limit) {
                state.deferred += 1;
                continue;
            }
            state.register(source.clone());
            to_process.push(source.clone());
        }

        progress.run_started(to_process.len(), state.skipped);
        info!(
            to_process = to_process.len(),
            skipped = state.skipped,
            duplicates = state.duplicates,
            deferred = state.deferred,
            "dedup complete"
        );

        if let Err(e) = store.begin_run(&state.run_id).await {
            return self.abort(state, start, format!("could not record run: {e}"), progress);
        }

        // --- Slices ---
        for (index, slice) in to_process.chunks(config.batch_size.max(1)).enumerate() {
            if *cancel.borrow() {
                info!(slice = index, "cancellation requested, not dispatching further slices");
                state.cancelled = true;
                break;
            }
            progress.slice_started(index, slice.len());

            let mut handles: Vec<(SourceId, JoinHandle<Result<SourceOutcome>>)> =
                Vec::with_capacity(slice.len());
            for source in slice {
                if let Err(e) = state.transition(source, SourceState::InFlight) {
                    warn!(error = %e, "state machine rejected dispatch");
                    continue;
                }
                let pipeline = self.pipeline.clone();
                let task_source = source.clone();
                handles.push((
                    source.clone(),
                    tokio::spawn(async move { pipeline.process(task_source).await }),
                ));
            }

            let mut fatal: Option<String> = None;
            for (source, handle) in handles {
                let outcome = match handle.await {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(e)) => Err(e),
                    Err(join_error) => {
                        // Panic inside the pipeline: record it in the task's place.
                        error!(%source, error = %join_error, "source pipeline aborted");
                        let record = OutputRecord::failed(
                            source.clone(),
                            format!("pipeline fault: {join_error}"),
                        );
                        store.save(&record).await.map(|()| SourceOutcome::Recorded {
                            record,
                            failed: true,
                        })
                    }
                };

                let accounted = match outcome {
                    Ok(SourceOutcome::Recorded { record, failed }) => {
                        progress.source_finished(&source, record.disposition, record.confidence);
                        state.record_outcome(&record, failed)
                    }
                    Ok(SourceOutcome::Unrecorded { error }) => {
                        progress.source_finished(&source, Disposition::Rejected, 0.0);
                        state.record_fault(&source, error)
                    }
                    Err(e) => {
                        error!(%source, error = %e, "persistence failed");
                        let reason = format!("persistence failed: {e}");
                        fatal.get_or_insert_with(|| reason.clone());
                        state.record_fault(&source, reason)
                    }
                };
                if let Err(e) = accounted {
                    warn!(%source, error = %e, "state machine rejected outcome");
                }
            }

            state.elapsed = start.elapsed();
            if let Err(e) = store
                .checkpoint_run(&state.run_id, &state.summary().to_json())
                .await
            {
                fatal.get_or_insert_with(|| format!("checkpoint failed: {e}"));
            }

            if let Some(reason) = fatal {
                return self.abort(state, start, reason, progress);
            }
        }

        state.elapsed = start.elapsed();
        if let Err(e) = store
            .finish_run(&state.run_id, &state.summary().to_json())
            .await
        {
            return self.abort(state, start, format!("could not finish run: {e}"), progress);
        }

        let summary = state.summary();
        info!(
            processed = summary.processed,
            approved = summary.approved,
            needs_review = summary.needs_review,
            rejected = summary.rejected,
            failed = summary.failed,
            pending = summary.pending,
            elapsed_ms = summary.elapsed_ms,
            "batch run completed"
        );
        progress.done(&summary);
        state
    }

    fn abort(
        &self,
        mut state: BatchState,
        start: Instant,
        reason: String,
        progress: &dyn BatchProgress,
    ) -> BatchState {
        error!(run_id = %state.run_id, %reason, "batch run aborted");
        state.aborted = Some(reason);
        state.elapsed = start.elapsed();
        progress.done(&state.summary());
        state
    }
}
