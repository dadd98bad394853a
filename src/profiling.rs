// --- File: profiling.rs ---
// Optional per-event timing. Tracked events are held until the zone reports
// their timestamps, then folded into per-label aggregates.
use crate::accel::ComputeZone;
use crate::utils::format_ns;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LabelStats {
    pub count: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl LabelStats {
    fn add(&mut self, ns: u64) {
        if self.count == 0 {
            self.min_ns = ns;
            self.max_ns = ns;
        } else {
            self.min_ns = self.min_ns.min(ns);
            self.max_ns = self.max_ns.max(ns);
        }
        self.count += 1;
        self.total_ns += ns;
    }

    pub fn mean_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ns / self.count
        }
    }
}

pub struct Profiler<E> {
    enabled: bool,
    pending: Vec<(&'static str, E)>,
    labels: BTreeMap<&'static str, LabelStats>,
    started: Instant,
}

impl<E: Clone> Profiler<E> {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            pending: Vec::new(),
            labels: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn track(&mut self, label: &'static str, event: &E) {
        if self.enabled {
            self.pending.push((label, event.clone()));
        }
    }

    // Fold in every tracked event that has completed and release it.
    pub fn harvest<Z: ComputeZone<Event = E>>(&mut self, zone: &Z) {
        let labels = &mut self.labels;
        self.pending.retain(|(label, event)| match zone.event_times(event) {
            Some(times) => {
                labels.entry(*label).or_default().add(times.duration());
                false
            }
            None => true,
        });
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn report(&self) -> ProfileReport {
        ProfileReport {
            labels: self
                .labels
                .iter()
                .map(|(label, stats)| (label.to_string(), *stats))
                .collect(),
            wall_clock: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub labels: Vec<(String, LabelStats)>,
    pub wall_clock: Duration,
}

impl ProfileReport {
    pub fn tracked_ns(&self) -> u64 {
        self.labels.iter().map(|(_, stats)| stats.total_ns).sum()
    }

    pub fn get(&self, label: &str) -> Option<&LabelStats> {
        self.labels
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, stats)| stats)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self.tracked_ns().max(1);
        writeln!(
            f,
            "{:<20} {:>8} {:>14} {:>12} {:>12} {:>7}",
            "event", "count", "total", "min", "max", "share"
        )?;
        for (label, stats) in &self.labels {
            writeln!(
                f,
                "{:<20} {:>8} {:>14} {:>12} {:>12} {:>6.2}%",
                label,
                stats.count,
                format_ns(stats.total_ns),
                format_ns(stats.min_ns),
                format_ns(stats.max_ns),
                100.0 * stats.total_ns as f64 / tracked as f64
            )?;
        }
        writeln!(f, "Tracked event time: {}", format_ns(self.tracked_ns()))?;
        write!(
            f,
            "Total wall-clock time: {}",
            format_ns(self.wall_clock.as_nanos() as u64)
        )
    }
}

// --- End of File: profiling.rs ---
