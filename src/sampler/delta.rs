use std::collections::HashMap;

use super::{Cumulative, CumulativeCounters, ProcessIdentity, Snapshot};

/// A non-negative per-interval byte or packet count. The only way to make
/// one is [`Delta::since`], which clamps counter resets to zero — the
/// invariant that keeps a restarted process's cumulative total from being
/// stored as a single giant delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delta(pub u64);

impl Delta {
    /// Difference between consecutive cumulative reads for one identity.
    /// `cur < prev` means the counter reset; the delta is zero and the
    /// caller adopts `cur` as the new baseline.
    pub fn since(cur: Cumulative, prev: Cumulative) -> Self {
        Delta(cur.0.saturating_sub(prev.0))
    }
}

/// Deltas for one identity over one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaSample {
    pub identity: ProcessIdentity,
    pub bytes_out: Delta,
    pub bytes_in: Delta,
    pub packets_out: Delta,
    pub packets_in: Delta,
}

/// Converts successive sampler snapshots into per-interval deltas.
///
/// Owned exclusively by the sampler task; `prev` is never shared.
#[derive(Debug, Default)]
pub struct DeltaEngine {
    prev: HashMap<ProcessIdentity, CumulativeCounters>,
}

impl DeltaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds the next snapshot into the baseline and returns the rows to
    /// store for this tick.
    ///
    /// - An identity seen for the first time yields no row (there is no
    ///   baseline yet); the next tick emits its first delta.
    /// - An identity whose counters decreased yields a zero row and the
    ///   lower value becomes the new baseline.
    /// - Identities that vanished are dropped from the baseline with no
    ///   negative correction.
    pub fn advance(&mut self, snapshot: Snapshot) -> Vec<DeltaSample> {
        let mut rows = Vec::with_capacity(snapshot.counters.len());

        for (identity, cur) in &snapshot.counters {
            if let Some(prev) = self.prev.get(identity) {
                rows.push(DeltaSample {
                    identity: identity.clone(),
                    bytes_out: Delta::since(cur.bytes_out, prev.bytes_out),
                    bytes_in: Delta::since(cur.bytes_in, prev.bytes_in),
                    packets_out: Delta::since(cur.packets_out, prev.packets_out),
                    packets_in: Delta::since(cur.packets_in, prev.packets_in),
                });
            }
        }

        self.prev = snapshot.counters;
        rows
    }

    /// Number of identities with an established baseline.
    pub fn tracked(&self) -> usize {
        self.prev.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, u64, u64)]) -> Snapshot {
        let counters = entries
            .iter()
            .map(|(name, out, r#in)| {
                (
                    ProcessIdentity::named(*name),
                    CumulativeCounters {
                        bytes_out: Cumulative(*out),
                        bytes_in: Cumulative(*r#in),
                        ..Default::default()
                    },
                )
            })
            .collect();
        Snapshot { counters }
    }

    #[test]
    fn test_first_sighting_emits_nothing_but_sets_baseline() {
        let mut engine = DeltaEngine::new();

        let rows = engine.advance(snapshot(&[("app", 1_000_000, 0)]));
        assert!(rows.is_empty());
        assert_eq!(engine.tracked(), 1);

        let rows = engine.advance(snapshot(&[("app", 1_500_000, 0)]));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bytes_out, Delta(500_000));
    }

    #[test]
    fn test_counter_reset_clamps_to_zero_and_rebases() {
        let mut engine = DeltaEngine::new();
        engine.advance(snapshot(&[("app", 1_500_000, 0)]));

        // Process restarted: cumulative dropped.
        let rows = engine.advance(snapshot(&[("app", 100_000, 0)]));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bytes_out, Delta(0));

        // Next tick measures from the new, lower baseline.
        let rows = engine.advance(snapshot(&[("app", 300_000, 0)]));
        assert_eq!(rows[0].bytes_out, Delta(200_000));
    }

    #[test]
    fn test_counter_reset_not_double_counted() {
        // Scenario: 1.0MB -> 1.5MB -> restart to 0.1MB -> 0.3MB.
        // True traffic while observed is 500KB + 200KB.
        let mut engine = DeltaEngine::new();
        let mut total = 0u64;

        for snap in [
            snapshot(&[("app", 1_000_000, 0)]),
            snapshot(&[("app", 1_500_000, 0)]),
            snapshot(&[("app", 100_000, 0)]),
            snapshot(&[("app", 300_000, 0)]),
        ] {
            for row in engine.advance(snap) {
                total += row.bytes_out.0;
            }
        }

        assert_eq!(total, 700_000);
        // Storing cumulative values directly would have yielded 2.9MB.
        assert_ne!(total, 2_900_000);
    }

    #[test]
    fn test_vanished_identity_dropped_without_correction() {
        let mut engine = DeltaEngine::new();
        engine.advance(snapshot(&[("a", 100, 0), ("b", 100, 0)]));

        let rows = engine.advance(snapshot(&[("a", 150, 0)]));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identity, ProcessIdentity::named("a"));
        assert_eq!(engine.tracked(), 1);

        // "b" coming back starts over with a fresh baseline.
        let rows = engine.advance(snapshot(&[("a", 150, 0), ("b", 500, 0)]));
        assert_eq!(rows.len(), 1, "returning identity has no baseline yet");
    }

    #[test]
    fn test_deltas_are_never_negative() {
        let mut engine = DeltaEngine::new();
        engine.advance(snapshot(&[("a", 500, 700)]));

        for snap in [
            snapshot(&[("a", 400, 900)]),
            snapshot(&[("a", 450, 100)]),
            snapshot(&[("a", 460, 110)]),
        ] {
            for row in engine.advance(snap) {
                // Delta wraps u64; the check is that clamping happened.
                assert!(row.bytes_out.0 < u64::MAX / 2);
                assert!(row.bytes_in.0 < u64::MAX / 2);
            }
        }
    }

    #[test]
    fn test_zero_traffic_tick_emits_zero_row() {
        let mut engine = DeltaEngine::new();
        engine.advance(snapshot(&[("a", 100, 100)]));

        let rows = engine.advance(snapshot(&[("a", 100, 100)]));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bytes_out, Delta(0));
        assert_eq!(rows[0].bytes_in, Delta(0));
    }
}
