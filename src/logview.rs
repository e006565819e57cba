//! Process-cycle reconstruction from machine logs.
//!
//! Cycles are the cycle-start events of a log. Each one is enriched with the belt speed read
//! from the next confirm event, a machine-error flag, the time to the next raw event, a strip
//! subgroup, and per-frame outlier flags. Clean cycles are then averaged per (frame, speed).

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::config::{LogviewConfig, RoundingConfig};
use crate::stats;
use crate::table::{format_number, Cell, Table};
use crate::types::{FrameSummary, LogEvent, ProcessCycle, MC_ERROR};

/// Label written in the error column of the processed sheet.
const ERROR_LABEL: &str = "MC ERROR";

/// Cycles and summaries for one log file.
#[derive(Clone, Debug, Default)]
pub struct LogAnalysis {
    pub cycles: Vec<ProcessCycle>,
    pub summaries: Vec<FrameSummary>,
    /// Cycles dropped for a negative or over-long duration.
    pub dropped_cycles: usize,
}

/// Run the whole reconstruction over the events of one file.
pub fn analyze(events: &[LogEvent], config: &LogviewConfig, rounding: &RoundingConfig) -> LogAnalysis {
    let (mut cycles, dropped_cycles) = derive_cycles(events, config);
    assign_subgroups(&mut cycles);
    mark_subgroups_without_first_strip(&mut cycles);
    flag_frame_outliers(&mut cycles, config);
    let summaries = summarize_frames(&cycles, config, rounding);
    debug!(
        events = events.len(),
        cycles = cycles.len(),
        dropped = dropped_cycles,
        frames = summaries.len(),
        "reconstructed cycles"
    );
    LogAnalysis {
        cycles,
        summaries,
        dropped_cycles,
    }
}

/// Belt speed in inches per second from the raw confirm-event value. Exact integers stay
/// integral; anything else is rounded to two decimals.
pub fn convert_speed(raw: f64, config: &LogviewConfig) -> f64 {
    let speed = raw / config.speed_raw_divisor / config.speed_units_per_inch;
    if speed.fract() == 0.0 {
        speed
    } else {
        stats::round_to(speed, 2)
    }
}

pub fn speed_label(speed: Option<f64>) -> String {
    speed.map(format_number).unwrap_or_default()
}

/// Build cycles with speed, error flag and duration. Returns the kept cycles and the number
/// dropped for an out-of-range duration.
pub fn derive_cycles(events: &[LogEvent], config: &LogviewConfig) -> (Vec<ProcessCycle>, usize) {
    let starts: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.step == config.cycle_start_step)
        .map(|(i, _)| i)
        .collect();

    let mut cycles: Vec<ProcessCycle> = starts
        .iter()
        .map(|&pos| {
            let mut cycle = ProcessCycle::new(events[pos].clone());
            cycle.raw_speed = events[pos + 1..]
                .iter()
                .find(|e| e.step == config.cycle_confirm_step)
                .and_then(|e| e.value(config.speed_slot));
            cycle.speed = cycle.raw_speed.map(|raw| convert_speed(raw, config));
            cycle.duration_seconds = events.get(pos + 1).and_then(|next| {
                let (start, end) = (cycle.event.timestamp?, next.timestamp?);
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            });
            cycle
        })
        .collect();

    // The earlier cycle of each adjacent pair owns any error logged in between.
    let error_steps: HashSet<&str> = config.error_steps.iter().map(String::as_str).collect();
    for (k, pair) in starts.windows(2).enumerate() {
        let between = &events[pair[0]..=pair[1]];
        if between.iter().any(|e| error_steps.contains(e.step.as_str())) {
            cycles[k].has_machine_error = true;
        }
    }

    let before = cycles.len();
    cycles.retain(|c| match c.duration_seconds {
        Some(d) => (0.0..=config.max_duration_secs).contains(&d),
        None => true,
    });
    let dropped = before - cycles.len();
    (cycles, dropped)
}

/// Number strips: a new subgroup starts on the first sequence value, whenever the sequence
/// does not increase, and after any gap. Cycles without a sequence have no subgroup.
pub fn assign_subgroups(cycles: &mut [ProcessCycle]) {
    let mut next_id = 0u32;
    let mut prev: Option<i64> = None;
    for cycle in cycles.iter_mut() {
        match cycle.event.strip_sequence {
            None => {
                cycle.subgroup_id = None;
                prev = None;
            }
            Some(seq) => {
                if prev.map_or(true, |p| seq <= p) {
                    next_id += 1;
                }
                cycle.subgroup_id = Some(next_id);
                prev = Some(seq);
            }
        }
    }
}

/// Flag subgroups that never contain strip 1.
pub fn mark_subgroups_without_first_strip(cycles: &mut [ProcessCycle]) {
    let mut has_first: HashMap<u32, bool> = HashMap::new();
    for cycle in cycles.iter() {
        if let Some(id) = cycle.subgroup_id {
            let entry = has_first.entry(id).or_insert(false);
            *entry |= cycle.event.strip_sequence == Some(1);
        }
    }
    for cycle in cycles.iter_mut() {
        cycle.is_subgroup_without_first_strip = cycle
            .subgroup_id
            .is_some_and(|id| !has_first.get(&id).copied().unwrap_or(false));
    }
}

/// Flag slow cycles per frame.
///
/// A strip-2 cycle directly followed by a strip-1 cycle is neither used for the statistics nor
/// flagged. A duration is an outlier when it is above `Q3 + k*IQR` and more than the floor away
/// from the median, or when its z-score is above the threshold and it is more than the floor
/// away from the mean.
pub fn flag_frame_outliers(cycles: &mut [ProcessCycle], config: &LogviewConfig) {
    let excluded: Vec<bool> = (0..cycles.len())
        .map(|i| {
            cycles[i].event.strip_sequence == Some(2)
                && cycles
                    .get(i + 1)
                    .is_some_and(|next| next.event.strip_sequence == Some(1))
        })
        .collect();

    let mut by_frame: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, cycle) in cycles.iter().enumerate() {
        if !excluded[i] {
            by_frame.entry(cycle.event.frame_id.as_str()).or_default().push(i);
        }
    }
    let by_frame: Vec<Vec<usize>> = by_frame.into_values().collect();

    for members in by_frame {
        let values: Vec<f64> = members
            .iter()
            .filter_map(|&i| cycles[i].duration_seconds)
            .collect();
        let (Some((q1, q3)), Some(median), Some(mean), Some(std)) = (
            stats::quartiles(&values),
            stats::median(&values),
            stats::mean(&values),
            stats::std_population(&values),
        ) else {
            continue;
        };
        let upper = q3 + config.iqr_factor * (q3 - q1);
        let floor = config.min_diff_seconds;

        for &i in &members {
            let Some(v) = cycles[i].duration_seconds else {
                continue;
            };
            let by_iqr = v > upper && (v - median).abs() > floor;
            let by_z = std > 0.0 && (v - mean) / std > config.z_threshold && (v - mean).abs() > floor;
            if by_iqr || by_z {
                cycles[i].is_statistical_outlier = true;
            }
        }
    }
}

/// Sort key for a speed; speeds carry at most two decimals.
fn speed_key(speed: Option<f64>) -> Option<i64> {
    speed.map(|s| (s * 100.0).round() as i64)
}

/// Mean clean duration per (frame, speed). Cycles without a frame id are not summarized.
pub fn summarize_frames(
    cycles: &[ProcessCycle],
    config: &LogviewConfig,
    rounding: &RoundingConfig,
) -> Vec<FrameSummary> {
    let mut groups: BTreeMap<(String, Option<i64>), (Option<f64>, Vec<&ProcessCycle>)> =
        BTreeMap::new();
    for cycle in cycles.iter().filter(|c| !c.event.frame_id.is_empty()) {
        groups
            .entry((cycle.event.frame_id.clone(), speed_key(cycle.speed)))
            .or_insert_with(|| (cycle.speed, Vec::new()))
            .1
            .push(cycle);
    }

    groups
        .into_iter()
        .map(|((frame_id, _), (speed, members))| {
            let before = members.iter().filter(|c| c.duration_seconds.is_some()).count();
            let clean: Vec<f64> = members
                .iter()
                .filter(|c| c.is_clean())
                .filter_map(|c| c.duration_seconds)
                .collect();
            let seconds_per_strip = if clean.len() >= config.min_clean_samples {
                stats::mean(&clean).map(|m| stats::round_to(m, rounding.duration))
            } else {
                None
            };
            FrameSummary {
                frame_id,
                speed,
                seconds_per_strip,
                before,
                after: clean.len(),
            }
        })
        .collect()
}

// ── Report tables ───────────────────────────────────────────────────

/// `h:mm:ss` rendering of a duration.
fn format_duration(seconds: f64) -> String {
    let total = seconds.round() as i64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Per-cycle sheet. The per-frame average is written on the first cycle of each group.
pub fn processed_table(analysis: &LogAnalysis) -> Table {
    let mut table = Table::new([
        "date", "time", "step", "frame", "G", "No_strip", "value_1", "speed", "MC", "seconds",
        "duration", "Error", "sec/strip",
    ]);
    let averages: HashMap<(&str, Option<i64>), Option<f64>> = analysis
        .summaries
        .iter()
        .map(|s| ((s.frame_id.as_str(), speed_key(s.speed)), s.seconds_per_strip))
        .collect();
    let mut written: HashSet<(&str, Option<i64>)> = HashSet::new();

    for cycle in &analysis.cycles {
        let ev = &cycle.event;
        let key = (ev.frame_id.as_str(), speed_key(cycle.speed));
        let average = match averages.get(&key) {
            Some(avg) if written.insert(key) => *avg,
            _ => None,
        };
        let flagged = cycle.is_statistical_outlier
            || cycle.is_subgroup_without_first_strip
            || cycle.has_machine_error;
        table.push_row(vec![
            Cell::from(ev.date.as_str()),
            Cell::from(ev.time.as_str()),
            Cell::from(ev.step.as_str()),
            Cell::from(ev.frame_id.as_str()),
            Cell::from(ev.group.clone()),
            Cell::from(ev.strip_sequence.map(|s| s as f64)),
            Cell::from(ev.value(1)),
            Cell::from(cycle.speed),
            Cell::from(cycle.has_machine_error.then_some(MC_ERROR)),
            Cell::from(cycle.duration_seconds),
            Cell::from(cycle.duration_seconds.map(format_duration)),
            Cell::from(if flagged { ERROR_LABEL } else { "" }),
            Cell::from(average),
        ]);
    }
    table
}

pub fn summary_table(summaries: &[FrameSummary]) -> Table {
    let mut table = Table::new(["frame", "speed", "sec/strip", "Before", "After"]);
    for s in summaries {
        table.push_row(vec![
            Cell::from(s.frame_id.as_str()),
            Cell::from(s.speed),
            Cell::from(s.seconds_per_strip),
            Cell::from(s.before),
            Cell::from(s.after),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime};

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn event(step: &str, frame: &str, seq: Option<i64>, at: i64) -> LogEvent {
        let ts = base() + Duration::seconds(at);
        LogEvent {
            line_no: 0,
            date: ts.format("%Y/%m/%d").to_string(),
            time: ts.format("%H:%M:%S").to_string(),
            step: step.to_string(),
            frame_id: frame.to_string(),
            group: None,
            strip_sequence: seq,
            values: vec![Some(1.0), None, None, None, Some(762.0)],
            timestamp: Some(ts),
        }
    }

    fn cycle(frame: &str, seq: Option<i64>, duration: Option<f64>) -> ProcessCycle {
        let mut c = ProcessCycle::new(event("PRO", frame, seq, 0));
        c.duration_seconds = duration;
        c.speed = Some(3.0);
        c
    }

    #[test]
    fn test_speed_conversion() {
        let cfg = LogviewConfig::default();
        assert_eq!(convert_speed(762.0, &cfg), 3.0);
        assert_eq!(speed_label(Some(convert_speed(762.0, &cfg))), "3");
        assert_eq!(convert_speed(1000.0, &cfg), 3.94);
        assert_eq!(speed_label(None), "");
    }

    #[test]
    fn test_speed_from_next_confirm_event() {
        let cfg = LogviewConfig::default();
        let mut confirm = event("CUC", "FU0001", Some(1), 5);
        confirm.values = vec![None, None, None, None, Some(1270.0)];
        let events = vec![
            event("PRO", "FU0001", Some(1), 0),
            event("XYZ", "", None, 2),
            confirm,
            event("CUC", "FU0001", Some(1), 9),
        ];
        let (cycles, dropped) = derive_cycles(&events, &cfg);
        assert_eq!(dropped, 0);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].raw_speed, Some(1270.0));
        assert_eq!(cycles[0].speed, Some(5.0));
        // Duration is measured to the next raw event, not the next cycle.
        assert_eq!(cycles[0].duration_seconds, Some(2.0));
    }

    #[test]
    fn test_error_flag_on_earlier_cycle() {
        let cfg = LogviewConfig::default();
        let events = vec![
            event("PRO", "FU0001", Some(1), 0),
            event("ERRSET", "", None, 10),
            event("PRO", "FU0001", Some(2), 20),
            event("PRO", "FU0001", Some(3), 30),
        ];
        let (cycles, _) = derive_cycles(&events, &cfg);
        let flags: Vec<bool> = cycles.iter().map(|c| c.has_machine_error).collect();
        assert_eq!(flags, vec![true, false, false]);
    }

    #[test]
    fn test_out_of_range_durations_dropped() {
        let cfg = LogviewConfig::default();
        let events = vec![
            event("PRO", "FU0001", Some(1), 100),
            event("PRO", "FU0001", Some(2), 50),
            event("PRO", "FU0001", Some(3), 50 + 90_000),
            event("PRO", "FU0001", Some(4), 50 + 90_010),
        ];
        let (cycles, dropped) = derive_cycles(&events, &cfg);
        assert_eq!(dropped, 2);
        let seqs: Vec<_> = cycles.iter().map(|c| c.event.strip_sequence).collect();
        assert_eq!(seqs, vec![Some(3), Some(4)]);
        // Last cycle has no following event.
        assert_eq!(cycles[1].duration_seconds, None);
    }

    #[test]
    fn test_subgroups_increment_on_non_increasing() {
        let mut cycles: Vec<ProcessCycle> = [1, 2, 3, 1, 2]
            .iter()
            .map(|&s| cycle("FU0001", Some(s), Some(10.0)))
            .collect();
        assign_subgroups(&mut cycles);
        let ids: Vec<_> = cycles.iter().map(|c| c.subgroup_id).collect();
        assert_eq!(ids, vec![Some(1), Some(1), Some(1), Some(2), Some(2)]);
    }

    #[test]
    fn test_null_sequence_resets_subgroup() {
        let mut cycles = vec![
            cycle("FU0001", Some(1), None),
            cycle("FU0001", None, None),
            cycle("FU0001", Some(2), None),
            cycle("FU0001", Some(3), None),
        ];
        assign_subgroups(&mut cycles);
        let ids: Vec<_> = cycles.iter().map(|c| c.subgroup_id).collect();
        assert_eq!(ids, vec![Some(1), None, Some(2), Some(2)]);

        mark_subgroups_without_first_strip(&mut cycles);
        let flags: Vec<_> = cycles.iter().map(|c| c.is_subgroup_without_first_strip).collect();
        assert_eq!(flags, vec![false, false, true, true]);
    }

    #[test]
    fn test_duration_outlier_flagged_and_excluded_from_average() {
        let cfg = LogviewConfig::default();
        let mut cycles: Vec<ProcessCycle> = [10.0, 10.0, 10.0, 10.0, 10.0, 200.0]
            .iter()
            .enumerate()
            .map(|(i, &d)| cycle("FU0001", Some(i as i64 + 1), Some(d)))
            .collect();
        assign_subgroups(&mut cycles);
        mark_subgroups_without_first_strip(&mut cycles);
        flag_frame_outliers(&mut cycles, &cfg);
        let flags: Vec<bool> = cycles.iter().map(|c| c.is_statistical_outlier).collect();
        assert_eq!(flags, vec![false, false, false, false, false, true]);

        let summaries = summarize_frames(&cycles, &cfg, &RoundingConfig::default());
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].seconds_per_strip, Some(10.0));
        assert_eq!(summaries[0].before, 6);
        assert_eq!(summaries[0].after, 5);
    }

    #[test]
    fn test_small_differences_are_not_outliers() {
        let cfg = LogviewConfig::default();
        let mut cycles: Vec<ProcessCycle> = [10.0, 10.0, 10.0, 10.0, 10.0, 60.0]
            .iter()
            .map(|&d| cycle("FU0001", Some(1), Some(d)))
            .collect();
        flag_frame_outliers(&mut cycles, &cfg);
        assert!(cycles.iter().all(|c| !c.is_statistical_outlier));
    }

    #[test]
    fn test_strip_two_before_strip_one_is_excluded() {
        let cfg = LogviewConfig::default();
        let mut cycles = vec![
            cycle("FU0001", Some(1), Some(10.0)),
            cycle("FU0001", Some(1), Some(10.0)),
            cycle("FU0001", Some(1), Some(10.0)),
            cycle("FU0001", Some(1), Some(10.0)),
            cycle("FU0001", Some(1), Some(10.0)),
            cycle("FU0001", Some(2), Some(500.0)),
            cycle("FU0001", Some(1), Some(10.0)),
        ];
        flag_frame_outliers(&mut cycles, &cfg);
        assert!(!cycles[5].is_statistical_outlier);
    }

    #[test]
    fn test_summary_requires_five_clean_samples() {
        let cfg = LogviewConfig::default();
        let mut cycles: Vec<ProcessCycle> = (0..5)
            .map(|_| cycle("FU0001", Some(1), Some(12.0)))
            .collect();
        cycles[0].has_machine_error = true;
        cycles.push(cycle("", Some(1), Some(12.0)));
        let summaries = summarize_frames(&cycles, &cfg, &RoundingConfig::default());
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].seconds_per_strip, None);
        assert_eq!(summaries[0].after, 4);
    }

    #[test]
    fn test_analyze_and_tables() {
        let cfg = LogviewConfig::default();
        let mut events = Vec::new();
        for i in 0..6 {
            let seq = (i % 3) + 1;
            events.push(event("PRO", "FA1234", Some(seq), i * 20));
            events.push(event("CUC", "FA1234", Some(seq), i * 20 + 15));
        }
        let analysis = analyze(&events, &cfg, &RoundingConfig::default());
        assert_eq!(analysis.cycles.len(), 6);
        assert!(analysis.cycles.iter().all(|c| c.duration_seconds == Some(15.0)));
        assert_eq!(analysis.summaries[0].seconds_per_strip, Some(15.0));

        let processed = processed_table(&analysis);
        assert_eq!(processed.len(), 6);
        let avg_col = processed.column_index("sec/strip").unwrap();
        assert_eq!(processed.cell(0, avg_col).as_f64(), Some(15.0));
        assert_eq!(processed.cell(1, avg_col), &Cell::Empty);
        let dur_col = processed.column_index("duration").unwrap();
        assert_eq!(processed.cell(0, dur_col).as_text().as_deref(), Some("0:00:15"));

        let summary = summary_table(&analysis.summaries);
        assert_eq!(summary.cell(0, 1).as_text().as_deref(), Some("3"));
    }
}
