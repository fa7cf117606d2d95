//! # brain::history — Signal history + accuracy feedback
//!
//! Rolling, bounded list of every signal produced for one symbol (suppressed
//! and fail-safe ones included). Each entry remembers the price at which it
//! was produced; the next cycle grades it against the new price:
//!
//! ```text
//! BUY   correct when move ≥ 0
//! SELL  correct when move ≤ 0
//! HOLD  correct when |move| ≤ 0.5 %
//! ```
//!
//! The grades only feed the prompt (the model sees its own track record);
//! the filter and sizing never look at them.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Action, Signal};

pub const HOLD_TOLERANCE_PCT: f64 = 0.5;
/// Windows reported in the accuracy section of the prompt
pub const ACCURACY_WINDOWS: [usize; 3] = [10, 30, 50];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub price:        f64,
    pub change_pct:   f64,
    pub correct:      bool,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub signal:          Signal,
    /// Last close when the signal was produced
    pub reference_price: f64,
    pub suppressed:      bool,
    #[serde(default)]
    pub validation:      Option<Validation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalHistory {
    cap:     usize,
    entries: VecDeque<HistoryEntry>,
}

/// Correct / graded counts for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Hits {
    pub correct: usize,
    pub total:   usize,
}

impl Hits {
    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.correct as f64 / self.total as f64 * 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracySummary {
    pub window:        usize,
    pub overall:       Hits,
    pub by_action:     BTreeMap<&'static str, Hits>,
    pub by_confidence: BTreeMap<&'static str, Hits>,
}

impl SignalHistory {
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), entries: VecDeque::new() }
    }

    /// Re-apply a (possibly changed) cap after loading from storage.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    pub fn push(&mut self, signal: Signal, reference_price: f64, suppressed: bool) {
        if self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { signal, reference_price, suppressed, validation: None });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// Last `n` entries, oldest → newest.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    /// Last `n` signals, oldest → newest.
    pub fn recent_signals(&self, n: usize) -> Vec<&Signal> {
        self.recent(n).map(|e| &e.signal).collect()
    }

    /// Grade every not-yet-graded entry against `price`. Fail-safe signals
    /// are not the model's opinion, so they stay ungraded.
    pub fn validate_pending(&mut self, price: f64, at: DateTime<Utc>) -> usize {
        let mut graded = 0;
        for entry in self.entries.iter_mut().filter(|e| e.validation.is_none() && !e.signal.fail_safe) {
            if !(entry.reference_price > 0.0) {
                continue;
            }
            let change_pct = (price - entry.reference_price) / entry.reference_price * 100.0;
            let correct = match entry.signal.action {
                Action::Buy  => change_pct >= 0.0,
                Action::Sell => change_pct <= 0.0,
                Action::Hold => change_pct.abs() <= HOLD_TOLERANCE_PCT,
            };
            entry.validation = Some(Validation { price, change_pct, correct, validated_at: at });
            graded += 1;
        }
        graded
    }

    /// Accuracy over the last `window` graded entries.
    pub fn accuracy(&self, window: usize) -> AccuracySummary {
        let graded: Vec<(&HistoryEntry, &Validation)> = self
            .entries
            .iter()
            .rev()
            .filter_map(|e| e.validation.as_ref().map(|v| (e, v)))
            .take(window)
            .collect();

        let mut summary = AccuracySummary {
            window,
            overall:       Hits::default(),
            by_action:     BTreeMap::new(),
            by_confidence: BTreeMap::new(),
        };
        for (entry, v) in graded {
            let hit = usize::from(v.correct);
            for bucket in [
                &mut summary.overall,
                summary.by_action.entry(entry.signal.action.as_str()).or_default(),
                summary.by_confidence.entry(entry.signal.confidence.as_str()).or_default(),
            ] {
                bucket.correct += hit;
                bucket.total   += 1;
            }
        }
        summary
    }
}
