// Sweep batch orchestration
// Per-sweep detection state with single-level undo, cancellable batch runs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;

use crate::batch::cancel::{BatchProgress, CancellationToken};
use crate::config::DetectConfig;
use crate::events::detector;
use crate::events::fitter::{self, FitError};
use crate::events::model::ModelBounds;
use crate::events::types::{EventRecord, TemplateSource};
use crate::recording::Recording;
use crate::results::{self, ResultTable};
use crate::template::{self, AlignPolicy, AlignedWaveform, Template, TemplateError};

/// The ordered event records of one detected sweep
pub type SweepDetectionState = Vec<EventRecord>;

/// The single retained prior state of a sweep, enabling one level of undo
/// Overwritten, never stacked, on each new detection
#[derive(Debug, Clone, Default)]
struct UndoSnapshot {
    prior: Option<SweepDetectionState>,
}

/// Errors raised by orchestrator operations
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no recording loaded")]
    NoDataLoaded,

    #[error("no detection channel selected on sweep {0}")]
    NoSignalSelected(usize),

    #[error("sweep index {0} out of range")]
    SweepOutOfRange(usize),

    #[error("wave index {1} out of range on sweep {0}")]
    WaveOutOfRange(usize, usize),

    #[error("a batch operation is already in flight")]
    BatchInFlight,

    #[error(transparent)]
    Fit(#[from] FitError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// One per-sweep failure recorded during a batch run
#[derive(Debug, Clone)]
pub struct SweepFailure {
    pub sweep_index: usize,
    pub error: String,
}

/// Outcome of a batch run; partial when cancelled
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Sweep indices successfully detected, in processing order
    pub completed: Vec<usize>,

    /// Sweeps skipped because their detection or fit failed
    pub failures: Vec<SweepFailure>,

    /// True when the run stopped on a cancellation request
    pub cancelled: bool,
}

/// Handle to a running batch; join it to collect the outcome
pub struct BatchHandle {
    handle: thread::JoinHandle<BatchOutcome>,
    batch_running: Arc<AtomicBool>,
}

impl BatchHandle {
    /// Block until the batch finishes and return its outcome
    pub fn join(self) -> BatchOutcome {
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                log::error!("batch worker panicked");
                self.batch_running.store(false, Ordering::SeqCst);
                BatchOutcome::default()
            }
        }
    }

    /// True once the worker has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

struct DetectionStore {
    states: Vec<Option<SweepDetectionState>>,
    undo: Vec<Option<UndoSnapshot>>,
}

impl DetectionStore {
    fn new(sweep_count: usize) -> Self {
        DetectionStore {
            states: vec![None; sweep_count],
            undo: (0..sweep_count).map(|_| None).collect(),
        }
    }
}

/// Orchestrates detection over a multi-sweep recording
///
/// The control thread owns the orchestrator; `detect_all` runs on a single
/// worker thread, strictly sequential over sweeps, never in parallel with
/// another batch on the same orchestrator. The worker takes the state lock
/// only while installing one sweep's result and yields between sweeps.
pub struct SweepOrchestrator {
    recording: Arc<Recording>,
    config: DetectConfig,
    store: Arc<Mutex<DetectionStore>>,
    batch_running: Arc<AtomicBool>,
}

impl SweepOrchestrator {
    /// Create an orchestrator over a recording
    /// Accepts anything normalizable to a sweep sequence (`RecordingShape`)
    pub fn new(recording: impl Into<Recording>, config: DetectConfig) -> Self {
        let recording: Recording = recording.into();
        let sweep_count = recording.len();
        SweepOrchestrator {
            recording: Arc::new(recording),
            config,
            store: Arc::new(Mutex::new(DetectionStore::new(sweep_count))),
            batch_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    /// Replace the configuration; affects subsequent operations only
    pub fn set_config(&mut self, config: DetectConfig) {
        self.config = config;
    }

    pub fn sweep_count(&self) -> usize {
        self.recording.len()
    }

    /// True while a `detect_all` worker is running
    pub fn is_batch_running(&self) -> bool {
        self.batch_running.load(Ordering::SeqCst)
    }

    /// Current detection state of one sweep (cloned); `None` = never detected
    pub fn sweep_state(&self, sweep_index: usize) -> Result<Option<SweepDetectionState>, BatchError> {
        self.ensure_sweep(sweep_index)?;
        Ok(self.store.lock().unwrap().states[sweep_index].clone())
    }

    /// Detect events on one sweep
    ///
    /// Snapshots the current state into the sweep's undo slot (overwriting
    /// any prior snapshot), runs preprocessing, detection, and fitting, then
    /// installs the new state. Returns the number of events installed.
    pub fn detect_sweep(&self, sweep_index: usize) -> Result<usize, BatchError> {
        self.ensure_sweep(sweep_index)?;
        let records = compute_detection(&self.recording, &self.config, sweep_index)?;
        let count = records.len();
        install_detection(
            &self.store,
            sweep_index,
            records,
            self.config.clear_previous_on_detect,
        );
        log::info!("sweep {}: {} event(s) detected", sweep_index, count);
        Ok(count)
    }

    /// Run detection over every sweep in ascending order on a worker thread
    ///
    /// At most one batch may be in flight. The worker polls the cancellation
    /// token once per sweep, before starting it; on cancellation, already
    /// processed sweeps keep their state and the rest stay untouched. One
    /// progress notification is emitted per processed sweep.
    pub fn detect_all<F>(
        &self,
        token: CancellationToken,
        progress: F,
    ) -> Result<BatchHandle, BatchError>
    where
        F: Fn(BatchProgress) + Send + 'static,
    {
        if self.recording.is_empty() {
            return Err(BatchError::NoDataLoaded);
        }
        if self
            .batch_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BatchError::BatchInFlight);
        }

        let recording = Arc::clone(&self.recording);
        let config = self.config.clone();
        let store = Arc::clone(&self.store);
        let batch_running = Arc::clone(&self.batch_running);
        let flag_for_handle = Arc::clone(&self.batch_running);

        let handle = thread::spawn(move || {
            let outcome = run_batch(&recording, &config, &store, &token, &progress);
            batch_running.store(false, Ordering::SeqCst);
            outcome
        });

        Ok(BatchHandle {
            handle,
            batch_running: flag_for_handle,
        })
    }

    /// Restore the sweep's undo snapshot, discarding it
    ///
    /// Returns true when a snapshot was restored. A sweep that was never
    /// detected (or was already undone) is a no-op returning false.
    pub fn undo_sweep(&self, sweep_index: usize) -> Result<bool, BatchError> {
        self.ensure_sweep(sweep_index)?;
        let mut store = self.store.lock().unwrap();
        match store.undo[sweep_index].take() {
            Some(snapshot) => {
                store.states[sweep_index] = snapshot.prior;
                log::info!("sweep {}: detection undone", sweep_index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop the sweep's detection state; the undo snapshot is untouched
    pub fn clear_sweep(&self, sweep_index: usize) -> Result<(), BatchError> {
        self.ensure_sweep(sweep_index)?;
        self.store.lock().unwrap().states[sweep_index] = None;
        Ok(())
    }

    /// Drop every sweep's detection state; undo snapshots are untouched
    pub fn clear_all(&self) {
        let mut store = self.store.lock().unwrap();
        for state in store.states.iter_mut() {
            *state = None;
        }
    }

    /// Re-derive acceptance flags from stored R-squared values, without
    /// re-fitting
    ///
    /// Scope narrows from the whole recording to one sweep to one wave as the
    /// optional indices are supplied. Idempotent. Returns the number of
    /// records re-evaluated.
    pub fn apply_acceptance_threshold(
        &self,
        r2_threshold: f64,
        sweep_index: Option<usize>,
        wave_index: Option<usize>,
    ) -> Result<usize, BatchError> {
        let mut store = self.store.lock().unwrap();
        let mut touched = 0usize;

        match sweep_index {
            Some(sweep) => {
                if sweep >= store.states.len() {
                    return Err(BatchError::SweepOutOfRange(sweep));
                }
                let state = match store.states[sweep].as_mut() {
                    Some(state) => state,
                    None => return Ok(0),
                };
                match wave_index {
                    Some(wave) => {
                        let record = state
                            .get_mut(wave)
                            .ok_or(BatchError::WaveOutOfRange(sweep, wave))?;
                        record.fit.accepted = record.fit.r2 >= r2_threshold;
                        touched = 1;
                    }
                    None => {
                        for record in state.iter_mut() {
                            record.fit.accepted = record.fit.r2 >= r2_threshold;
                            touched += 1;
                        }
                    }
                }
            }
            None => {
                for state in store.states.iter_mut().flatten() {
                    for record in state.iter_mut() {
                        record.fit.accepted = record.fit.r2 >= r2_threshold;
                        touched += 1;
                    }
                }
            }
        }
        Ok(touched)
    }

    /// Manually toggle one record's acceptance flag
    /// Overridden by the next `apply_acceptance_threshold` over its scope
    pub fn set_accepted(
        &self,
        sweep_index: usize,
        wave_index: usize,
        accepted: bool,
    ) -> Result<(), BatchError> {
        self.ensure_sweep(sweep_index)?;
        let mut store = self.store.lock().unwrap();
        let state = store.states[sweep_index]
            .as_mut()
            .ok_or(BatchError::WaveOutOfRange(sweep_index, wave_index))?;
        let record = state
            .get_mut(wave_index)
            .ok_or(BatchError::WaveOutOfRange(sweep_index, wave_index))?;
        record.fit.accepted = accepted;
        Ok(())
    }

    /// Re-fit exactly one event record in place with new bounds
    ///
    /// The record keeps its identity, its position in the sweep's collection,
    /// and its `aligned` flag; only the fit result is replaced.
    pub fn refit(
        &self,
        sweep_index: usize,
        wave_index: usize,
        bounds: &ModelBounds,
    ) -> Result<(), BatchError> {
        self.ensure_sweep(sweep_index)?;
        let mut store = self.store.lock().unwrap();
        let state = store.states[sweep_index]
            .as_mut()
            .ok_or(BatchError::WaveOutOfRange(sweep_index, wave_index))?;
        let record = state
            .get_mut(wave_index)
            .ok_or(BatchError::WaveOutOfRange(sweep_index, wave_index))?;

        let result = fitter::fit(
            &record.candidate.waveform,
            bounds,
            record.candidate.sample_rate_hz,
            self.config.r2_threshold,
        )?;
        record.fit = result;
        Ok(())
    }

    /// Align every accepted record onto a common origin
    ///
    /// The policy follows `align_on_rising_phase`. Source records that
    /// produced an aligned waveform are marked `aligned`. Excluded while a
    /// batch is in flight.
    pub fn align_accepted(&self) -> Result<Vec<AlignedWaveform>, BatchError> {
        if self.is_batch_running() {
            return Err(BatchError::BatchInFlight);
        }
        let policy = if self.config.align_on_rising_phase {
            AlignPolicy::MaxRise
        } else {
            AlignPolicy::Onset
        };

        let snapshot: Vec<(usize, EventRecord)> = {
            let store = self.store.lock().unwrap();
            store
                .states
                .iter()
                .flatten()
                .flat_map(|state| {
                    state
                        .iter()
                        .enumerate()
                        .filter(|(_, r)| r.fit.accepted)
                        .map(|(w, r)| (w, r.clone()))
                })
                .collect()
        };

        let refs: Vec<(usize, &EventRecord)> = snapshot.iter().map(|(w, r)| (*w, r)).collect();
        let aligned = template::align(&refs, &self.recording, policy, &self.config);

        let mut store = self.store.lock().unwrap();
        for waveform in &aligned {
            if let Some(Some(state)) = store.states.get_mut(waveform.sweep_index) {
                if let Some(record) = state.get_mut(waveform.wave_index) {
                    record.aligned = true;
                }
            }
        }
        Ok(aligned)
    }

    /// Align accepted records and average them into a template
    pub fn build_template(&self) -> Result<Template, BatchError> {
        let aligned = self.align_accepted()?;
        let template =
            template::build_template(&aligned, &self.config.model, self.config.r2_threshold)?;
        Ok(template)
    }

    /// Flatten the current detection state into the result table plus
    /// per-sweep event collections
    pub fn aggregate(&self) -> (ResultTable, Vec<Vec<EventRecord>>) {
        let store = self.store.lock().unwrap();
        results::aggregate(&store.states, self.config.include_all_waves_in_result)
    }

    fn ensure_sweep(&self, sweep_index: usize) -> Result<(), BatchError> {
        if self.recording.is_empty() {
            return Err(BatchError::NoDataLoaded);
        }
        if sweep_index >= self.recording.len() {
            return Err(BatchError::SweepOutOfRange(sweep_index));
        }
        Ok(())
    }
}

/// Detect and fit one sweep; pure with respect to the detection store
fn compute_detection(
    recording: &Recording,
    config: &DetectConfig,
    sweep_index: usize,
) -> Result<Vec<EventRecord>, BatchError> {
    let sweep = recording
        .sweep(sweep_index)
        .ok_or(BatchError::SweepOutOfRange(sweep_index))?;
    let channel = sweep
        .active_channel()
        .ok_or(BatchError::NoSignalSelected(sweep_index))?;

    let processed = crate::signal::process(channel, &config.preprocess);
    let (template_wave, template_source) = resolve_template(config, processed.sample_rate_hz);

    let candidates = detector::detect(&processed, &sweep.epochs, &template_wave, config, sweep_index);

    let mut records = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        // A fit failure abandons this sweep's detection for the run
        let fit = fitter::fit(
            &candidate.waveform,
            &config.model,
            candidate.sample_rate_hz,
            config.r2_threshold,
        )?;
        records.push(EventRecord::new(candidate, fit, template_source.clone()));
    }
    Ok(records)
}

/// Resolve the detection template: a stored one when configured and loadable,
/// otherwise the synthetic model waveform
fn resolve_template(config: &DetectConfig, sample_rate_hz: f64) -> (Vec<f32>, TemplateSource) {
    if config.use_template {
        match &config.template_path {
            Some(path) => match template::load_template(path) {
                Ok(stored) => {
                    if (stored.sample_rate_hz - sample_rate_hz).abs() > 1e-6 {
                        log::warn!(
                            "template sample rate {} Hz differs from channel rate {} Hz",
                            stored.sample_rate_hz,
                            sample_rate_hz
                        );
                    }
                    return (stored.waveform, TemplateSource::Stored(path.clone()));
                }
                Err(e) => {
                    log::warn!("{}; falling back to the model waveform", e);
                }
            },
            None => {
                log::warn!("use_template set without a template path; using the model waveform");
            }
        }
    }
    (
        detector::synthetic_template(config, sample_rate_hz),
        TemplateSource::Synthetic,
    )
}

/// Snapshot the sweep's state into its undo slot, then install new records
fn install_detection(
    store: &Arc<Mutex<DetectionStore>>,
    sweep_index: usize,
    records: Vec<EventRecord>,
    clear_previous: bool,
) {
    let mut store = store.lock().unwrap();
    let prior = store.states[sweep_index].clone();
    store.undo[sweep_index] = Some(UndoSnapshot { prior });

    if clear_previous || store.states[sweep_index].is_none() {
        store.states[sweep_index] = Some(records);
    } else if let Some(state) = store.states[sweep_index].as_mut() {
        state.extend(records);
        state.sort_by(|a, b| {
            a.candidate
                .start_ms
                .partial_cmp(&b.candidate.start_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

/// The batch worker body: strictly sequential, cancellable between sweeps
fn run_batch<F>(
    recording: &Recording,
    config: &DetectConfig,
    store: &Arc<Mutex<DetectionStore>>,
    token: &CancellationToken,
    progress: &F,
) -> BatchOutcome
where
    F: Fn(BatchProgress),
{
    let total_sweeps = recording.len();
    let mut outcome = BatchOutcome::default();
    log::info!("batch detection started over {} sweep(s)", total_sweeps);

    for sweep_index in 0..total_sweeps {
        if token.is_cancelled() {
            outcome.cancelled = true;
            match token.reason() {
                Some(reason) => log::info!("batch cancelled before sweep {}: {}", sweep_index, reason),
                None => log::info!("batch cancelled before sweep {}", sweep_index),
            }
            break;
        }

        match compute_detection(recording, config, sweep_index) {
            Ok(records) => {
                let events_found = records.len();
                install_detection(store, sweep_index, records, config.clear_previous_on_detect);
                outcome.completed.push(sweep_index);
                progress(BatchProgress {
                    sweep_index,
                    total_sweeps,
                    events_found,
                });
            }
            Err(e) => {
                log::warn!("sweep {} skipped: {}", sweep_index, e);
                outcome.failures.push(SweepFailure {
                    sweep_index,
                    error: e.to_string(),
                });
                progress(BatchProgress {
                    sweep_index,
                    total_sweeps,
                    events_found: 0,
                });
            }
        }
    }

    log::info!(
        "batch finished: {} completed, {} failed{}",
        outcome.completed.len(),
        outcome.failures.len(),
        if outcome.cancelled { ", cancelled" } else { "" }
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionMode;
    use crate::events::model::BiexpParams;
    use crate::recording::{Channel, Sweep};

    const RATE: f64 = 10_000.0;

    /// A recording with one inward event per sweep at 50 ms
    fn recording(sweep_count: usize) -> Recording {
        let params = BiexpParams {
            offset: 0.0,
            scale: -10.0,
            onset_ms: 0.0,
            tau_rise_ms: 0.5,
            tau_decay_ms: 5.0,
        };
        let sweeps = (0..sweep_count)
            .map(|s| {
                let n = (200.0 / 1000.0 * RATE) as usize;
                let mut samples = vec![0.0f32; n];
                let mut state = 0x517c_c1b7u32 ^ (s as u32).wrapping_mul(0x9e37_79b9);
                for v in samples.iter_mut() {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    *v += ((state as f64 / u32::MAX as f64) - 0.5) as f32 * 0.1;
                }
                let start = (50.0 / 1000.0 * RATE) as usize;
                for i in start..n {
                    let t_ms = (i - start) as f64 * 1000.0 / RATE;
                    samples[i] += params.value_at(t_ms) as f32;
                }
                Sweep::single_channel(Channel::new("Im0", samples, RATE, "pA"))
            })
            .collect();
        Recording::new(sweeps)
    }

    fn config() -> DetectConfig {
        DetectConfig {
            detection_mode: DetectionMode::Sliding,
            detection_threshold: 3.0,
            event_duration_ms: 30.0,
            baseline_margin_ms: 5.0,
            r2_threshold: 0.9,
            ..Default::default()
        }
    }

    #[test]
    fn test_detect_sweep_installs_state() {
        let orchestrator = SweepOrchestrator::new(recording(2), config());
        let count = orchestrator.detect_sweep(0).unwrap();
        assert_eq!(count, 1);

        let state = orchestrator.sweep_state(0).unwrap().unwrap();
        assert_eq!(state.len(), 1);
        assert!((state[0].candidate.start_ms - 50.0).abs() < 2.0);
        assert!(orchestrator.sweep_state(1).unwrap().is_none());
    }

    #[test]
    fn test_undo_restores_prior_state_exactly() {
        let orchestrator = SweepOrchestrator::new(recording(1), config());

        orchestrator.detect_sweep(0).unwrap();
        let first_ids: Vec<_> = orchestrator
            .sweep_state(0)
            .unwrap()
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();

        orchestrator.detect_sweep(0).unwrap();
        let second_ids: Vec<_> = orchestrator
            .sweep_state(0)
            .unwrap()
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_ne!(first_ids, second_ids);

        assert!(orchestrator.undo_sweep(0).unwrap());
        let restored_ids: Vec<_> = orchestrator
            .sweep_state(0)
            .unwrap()
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(restored_ids, first_ids);
    }

    #[test]
    fn test_second_undo_is_a_no_op() {
        let orchestrator = SweepOrchestrator::new(recording(1), config());
        orchestrator.detect_sweep(0).unwrap();

        // First detection's prior state was "never detected"
        assert!(orchestrator.undo_sweep(0).unwrap());
        assert!(orchestrator.sweep_state(0).unwrap().is_none());

        assert!(!orchestrator.undo_sweep(0).unwrap());
        assert!(orchestrator.sweep_state(0).unwrap().is_none());
    }

    #[test]
    fn test_undo_on_untouched_sweep_is_a_no_op() {
        let orchestrator = SweepOrchestrator::new(recording(2), config());
        assert!(!orchestrator.undo_sweep(1).unwrap());
    }

    #[test]
    fn test_clear_keeps_undo_snapshot() {
        let orchestrator = SweepOrchestrator::new(recording(1), config());
        orchestrator.detect_sweep(0).unwrap();
        orchestrator.detect_sweep(0).unwrap(); // snapshot now holds the first detection

        orchestrator.clear_sweep(0).unwrap();
        assert!(orchestrator.sweep_state(0).unwrap().is_none());

        // Undo still works against the snapshot taken before the second run
        assert!(orchestrator.undo_sweep(0).unwrap());
        assert!(orchestrator.sweep_state(0).unwrap().is_some());
    }

    #[test]
    fn test_detect_all_processes_every_sweep() {
        let orchestrator = SweepOrchestrator::new(recording(5), config());
        let handle = orchestrator
            .detect_all(CancellationToken::new(), |_| {})
            .unwrap();
        let outcome = handle.join();

        assert_eq!(outcome.completed, vec![0, 1, 2, 3, 4]);
        assert!(outcome.failures.is_empty());
        assert!(!outcome.cancelled);
        assert!(!orchestrator.is_batch_running());
        for i in 0..5 {
            assert!(orchestrator.sweep_state(i).unwrap().is_some());
        }
    }

    #[test]
    fn test_cancellation_leaves_prefix_detected_suffix_untouched() {
        let _ = env_logger::builder().is_test(true).try_init();
        let orchestrator = SweepOrchestrator::new(recording(10), config());
        let token = CancellationToken::new();
        let cancel_after = 3usize;

        let token_for_progress = token.clone();
        let handle = orchestrator
            .detect_all(token, move |p: BatchProgress| {
                if p.sweep_index + 1 == cancel_after {
                    token_for_progress.cancel_with_reason("enough");
                }
            })
            .unwrap();
        let outcome = handle.join();

        assert!(outcome.cancelled);
        assert_eq!(outcome.completed, vec![0, 1, 2]);
        for i in 0..cancel_after {
            assert!(orchestrator.sweep_state(i).unwrap().is_some(), "sweep {} detected", i);
        }
        for i in cancel_after..10 {
            assert!(orchestrator.sweep_state(i).unwrap().is_none(), "sweep {} untouched", i);
        }
    }

    #[test]
    fn test_progress_reports_once_per_sweep() {
        let orchestrator = SweepOrchestrator::new(recording(4), config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handle = orchestrator
            .detect_all(CancellationToken::new(), move |p: BatchProgress| {
                seen_clone.lock().unwrap().push((p.sweep_index, p.events_found));
            })
            .unwrap();
        handle.join();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|&(_, events)| events == 1));
    }

    #[test]
    fn test_second_batch_runs_after_first_finishes() {
        let orchestrator = SweepOrchestrator::new(recording(2), config());
        orchestrator
            .detect_all(CancellationToken::new(), |_| {})
            .unwrap()
            .join();
        let outcome = orchestrator
            .detect_all(CancellationToken::new(), |_| {})
            .unwrap()
            .join();
        assert_eq!(outcome.completed.len(), 2);
    }

    #[test]
    fn test_empty_recording_is_no_data() {
        let orchestrator = SweepOrchestrator::new(Recording::new(Vec::new()), config());
        assert!(matches!(
            orchestrator.detect_all(CancellationToken::new(), |_| {}),
            Err(BatchError::NoDataLoaded)
        ));
        assert!(matches!(
            orchestrator.detect_sweep(0),
            Err(BatchError::NoDataLoaded)
        ));
    }

    #[test]
    fn test_unselected_channel_is_reported_and_skipped_in_batch() {
        let mut rec = recording(3);
        rec.sweeps[1].active_channel = None;
        let orchestrator = SweepOrchestrator::new(rec, config());

        assert!(matches!(
            orchestrator.detect_sweep(1),
            Err(BatchError::NoSignalSelected(1))
        ));

        let outcome = orchestrator
            .detect_all(CancellationToken::new(), |_| {})
            .unwrap()
            .join();
        assert_eq!(outcome.completed, vec![0, 2]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].sweep_index, 1);
    }

    #[test]
    fn test_acceptance_threshold_is_idempotent() {
        let orchestrator = SweepOrchestrator::new(recording(3), config());
        orchestrator
            .detect_all(CancellationToken::new(), |_| {})
            .unwrap()
            .join();

        let flags = |o: &SweepOrchestrator| -> Vec<bool> {
            (0..3)
                .flat_map(|i| {
                    o.sweep_state(i)
                        .unwrap()
                        .unwrap()
                        .iter()
                        .map(|r| r.fit.accepted)
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        orchestrator.apply_acceptance_threshold(0.9, None, None).unwrap();
        let once = flags(&orchestrator);
        orchestrator.apply_acceptance_threshold(0.9, None, None).unwrap();
        assert_eq!(flags(&orchestrator), once);

        // Raising the bar past any real fit rejects everything...
        orchestrator.apply_acceptance_threshold(1.0, None, None).unwrap();
        assert!(flags(&orchestrator).iter().all(|&a| !a));
        // ...and re-application at the old threshold restores acceptance
        orchestrator.apply_acceptance_threshold(0.9, None, None).unwrap();
        assert_eq!(flags(&orchestrator), once);
    }

    #[test]
    fn test_refit_preserves_identity_and_aligned_flag() {
        let orchestrator = SweepOrchestrator::new(recording(1), config());
        orchestrator.detect_sweep(0).unwrap();
        orchestrator.align_accepted().unwrap();

        let before = orchestrator.sweep_state(0).unwrap().unwrap()[0].clone();
        assert!(before.aligned);

        let mut bounds = orchestrator.config().model;
        bounds.lower.tau_decay_ms = 8.0;
        bounds.initial.tau_decay_ms = 10.0;
        orchestrator.refit(0, 0, &bounds).unwrap();

        let after = orchestrator.sweep_state(0).unwrap().unwrap()[0].clone();
        assert_eq!(after.id, before.id);
        assert!(after.aligned);
        assert!(after.fit.coefficients.tau_decay_ms >= 8.0);
        assert_ne!(
            after.fit.coefficients.tau_decay_ms,
            before.fit.coefficients.tau_decay_ms
        );
    }

    #[test]
    fn test_manual_toggle_then_threshold_reapplication() {
        let orchestrator = SweepOrchestrator::new(recording(1), config());
        orchestrator.detect_sweep(0).unwrap();

        orchestrator.set_accepted(0, 0, false).unwrap();
        assert!(!orchestrator.sweep_state(0).unwrap().unwrap()[0].fit.accepted);

        // Threshold re-application re-derives the flag from the stored fit
        orchestrator.apply_acceptance_threshold(0.9, Some(0), None).unwrap();
        assert!(orchestrator.sweep_state(0).unwrap().unwrap()[0].fit.accepted);
    }

    #[test]
    fn test_refit_out_of_range() {
        let orchestrator = SweepOrchestrator::new(recording(1), config());
        orchestrator.detect_sweep(0).unwrap();
        let bounds = orchestrator.config().model;
        assert!(matches!(
            orchestrator.refit(0, 5, &bounds),
            Err(BatchError::WaveOutOfRange(0, 5))
        ));
    }

    #[test]
    fn test_detect_then_fit_recovers_onset_and_amplitude() {
        let orchestrator = SweepOrchestrator::new(recording(1), config());
        orchestrator.detect_sweep(0).unwrap();
        let record = &orchestrator.sweep_state(0).unwrap().unwrap()[0];

        // Onset within one sample of the injected 50 ms event
        let fitted_onset_ms =
            record.candidate.window_start_ms + record.fit.coefficients.onset_ms;
        assert!(
            (fitted_onset_ms - 50.0).abs() < 0.1,
            "fitted onset {} ms",
            fitted_onset_ms
        );

        // Amplitude within 1% of the injected event's peak
        let injected = BiexpParams {
            offset: 0.0,
            scale: -10.0,
            onset_ms: 0.0,
            tau_rise_ms: 0.5,
            tau_decay_ms: 5.0,
        };
        let true_amplitude = injected.peak_amplitude();
        assert!(
            (record.fit.amplitude - true_amplitude).abs() < 0.01 * true_amplitude.abs(),
            "amplitude {} vs {}",
            record.fit.amplitude,
            true_amplitude
        );
        assert!(record.fit.r2 > 0.9);
    }

    #[test]
    fn test_ten_sweep_scenario_aggregates_ten_accepted_rows() {
        // Ten sweeps, one event each at 50 ms; r2 threshold 0.9
        let orchestrator = SweepOrchestrator::new(recording(10), config());
        let outcome = orchestrator
            .detect_all(CancellationToken::new(), |_| {})
            .unwrap()
            .join();
        assert_eq!(outcome.completed.len(), 10);

        let (table, per_sweep) = orchestrator.aggregate();
        assert_eq!(table.len(), 10);
        assert!(table.rows.iter().all(|r| r.accepted));
        assert!(table.rows.iter().all(|r| (r.start_ms - 50.0).abs() < 2.0));
        assert_eq!(per_sweep.len(), 10);
    }

    #[test]
    fn test_template_round_trip_drives_detection() {
        let orchestrator = SweepOrchestrator::new(recording(3), config());
        orchestrator
            .detect_all(CancellationToken::new(), |_| {})
            .unwrap()
            .join();

        let built = orchestrator.build_template().unwrap();
        assert_eq!(built.event_count, 3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.json");
        template::save_template(&built, &path).unwrap();

        let mut config = config();
        config.use_template = true;
        config.template_path = Some(path);
        let second = SweepOrchestrator::new(recording(2), config);
        second.detect_sweep(0).unwrap();

        let state = second.sweep_state(0).unwrap().unwrap();
        assert_eq!(state.len(), 1);
        assert!(state[0].template.is_stored());
    }

    #[test]
    fn test_missing_template_falls_back_to_model() {
        let mut config = config();
        config.use_template = true;
        config.template_path = Some(std::path::PathBuf::from("/nonexistent/template.json"));
        let orchestrator = SweepOrchestrator::new(recording(1), config);

        orchestrator.detect_sweep(0).unwrap();
        let state = orchestrator.sweep_state(0).unwrap().unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].template, TemplateSource::Synthetic);
    }

    #[test]
    fn test_append_mode_keeps_prior_detection() {
        let mut cfg = config();
        cfg.clear_previous_on_detect = false;
        let orchestrator = SweepOrchestrator::new(recording(1), cfg);

        orchestrator.detect_sweep(0).unwrap();
        orchestrator.detect_sweep(0).unwrap();
        let state = orchestrator.sweep_state(0).unwrap().unwrap();
        assert_eq!(state.len(), 2);
        // Records stay ordered by start time
        for pair in state.windows(2) {
            assert!(pair[0].candidate.start_ms <= pair[1].candidate.start_ms);
        }
    }
}
