// Result aggregation
// Flattens per-sweep detection state into a single exportable table

use serde::{Deserialize, Serialize};

use crate::events::types::EventRecord;

/// One row of the flat result table: one fitted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub sweep_index: usize,
    pub wave_index: usize,
    pub channel_id: String,
    pub start_ms: f64,
    pub peak_ms: f64,

    /// Peak deviation of the raw waveform from its baseline
    pub amplitude: f64,

    /// Peak deviation of the fitted curve from the fitted offset
    pub fitted_amplitude: f64,

    pub r2: f64,
    pub offset: f64,
    pub scale: f64,
    pub onset_ms: f64,
    pub tau_rise_ms: f64,
    pub tau_decay_ms: f64,
    pub accepted: bool,
    pub used_template: bool,
}

/// Flat result table, ordered by (sweep_index, wave_index) ascending
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultTable {
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Flatten per-sweep detection states into a table plus per-sweep collections
///
/// Rejected waves are filtered out unless `include_all` is set. Returns an
/// empty result when no sweep has ever been detected.
pub fn aggregate(
    states: &[Option<Vec<EventRecord>>],
    include_all: bool,
) -> (ResultTable, Vec<Vec<EventRecord>>) {
    if states.iter().all(|s| s.is_none()) {
        return (ResultTable::default(), Vec::new());
    }

    let mut rows = Vec::new();
    let mut per_sweep = Vec::with_capacity(states.len());

    for (sweep_index, state) in states.iter().enumerate() {
        let records = match state {
            Some(records) => records.clone(),
            None => Vec::new(),
        };

        for (wave_index, record) in records.iter().enumerate() {
            if !include_all && !record.fit.accepted {
                continue;
            }
            let c = &record.fit.coefficients;
            rows.push(ResultRow {
                sweep_index,
                wave_index,
                channel_id: record.candidate.channel_id.clone(),
                start_ms: record.candidate.start_ms,
                peak_ms: record.candidate.peak_ms,
                amplitude: record.candidate.raw_amplitude(),
                fitted_amplitude: record.fit.amplitude,
                r2: record.fit.r2,
                offset: c.offset,
                scale: c.scale,
                onset_ms: c.onset_ms,
                tau_rise_ms: c.tau_rise_ms,
                tau_decay_ms: c.tau_decay_ms,
                accepted: record.fit.accepted,
                used_template: record.template.is_stored(),
            });
        }
        per_sweep.push(records);
    }

    (ResultTable { rows }, per_sweep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::BiexpParams;
    use crate::events::types::{CandidateEvent, FitResult, TemplateSource};

    fn record(sweep_index: usize, start_ms: f64, r2: f64, accepted: bool) -> EventRecord {
        let candidate = CandidateEvent {
            sweep_index,
            channel_id: "Im0".into(),
            start_ms,
            peak_ms: start_ms + 1.5,
            waveform: vec![0.0, 0.0, -5.0, -2.0],
            window_start_ms: start_ms - 5.0,
            baseline_samples: 2,
            sample_rate_hz: 10_000.0,
        };
        let fit = FitResult {
            coefficients: BiexpParams {
                offset: 0.0,
                scale: -10.0,
                onset_ms: 5.0,
                tau_rise_ms: 0.5,
                tau_decay_ms: 5.0,
            },
            r2,
            amplitude: -6.9,
            accepted,
            diagnostics: Vec::new(),
        };
        EventRecord::new(candidate, fit, TemplateSource::Synthetic)
    }

    #[test]
    fn test_never_detected_yields_empty_result() {
        let states: Vec<Option<Vec<EventRecord>>> = vec![None, None, None];
        let (table, per_sweep) = aggregate(&states, true);
        assert!(table.is_empty());
        assert!(per_sweep.is_empty());
    }

    #[test]
    fn test_accepted_only_filter() {
        let states = vec![
            Some(vec![record(0, 100.0, 0.95, true), record(0, 200.0, 0.3, false)]),
            None,
        ];
        let (table, per_sweep) = aggregate(&states, false);
        assert_eq!(table.len(), 1);
        assert!(table.rows[0].accepted);
        // Per-sweep collections keep every record
        assert_eq!(per_sweep[0].len(), 2);
        assert!(per_sweep[1].is_empty());
    }

    #[test]
    fn test_include_all_keeps_rejected_rows() {
        let states = vec![Some(vec![
            record(0, 100.0, 0.95, true),
            record(0, 200.0, 0.3, false),
        ])];
        let (table, _) = aggregate(&states, true);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_rows_ordered_by_sweep_then_wave() {
        let states = vec![
            Some(vec![record(0, 100.0, 0.95, true), record(0, 300.0, 0.9, true)]),
            Some(vec![record(1, 50.0, 0.92, true)]),
        ];
        let (table, _) = aggregate(&states, false);
        let order: Vec<(usize, usize)> = table.rows.iter().map(|r| (r.sweep_index, r.wave_index)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn test_row_carries_fit_columns() {
        let states = vec![Some(vec![record(0, 100.0, 0.95, true)])];
        let (table, _) = aggregate(&states, false);
        let row = &table.rows[0];
        assert_eq!(row.scale, -10.0);
        assert_eq!(row.tau_decay_ms, 5.0);
        assert!(!row.used_template);
        assert!((row.amplitude + 5.0).abs() < 1e-9);
    }
}
