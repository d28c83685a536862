//! Per-process byte-counter sampling capability.
//!
//! The OS-facing side is abstracted behind [`ProcessSampler`]; the only
//! production implementation shells out to `nettop` (macOS) and parses
//! its CSV output. Counter values are cumulative since an unspecified
//! epoch (process start, boot, rollover) — the [`delta`] module is the
//! one place that converts them into storable deltas.

pub mod delta;

use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// A sampled process identity: name plus optional bundle id.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub process_name: String,
    pub bundle_id: Option<String>,
}

impl ProcessIdentity {
    pub fn named(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            bundle_id: None,
        }
    }
}

/// A counter that only grows while its process lives and resets to an
/// unspecified value on restart. Never store one of these directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct Cumulative(pub u64);

/// Cumulative counters for one identity at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CumulativeCounters {
    pub bytes_out: Cumulative,
    pub bytes_in: Cumulative,
    pub packets_out: Cumulative,
    pub packets_in: Cumulative,
}

/// One sampler reading across all observed processes.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub counters: HashMap<ProcessIdentity, CumulativeCounters>,
}

/// Capability contract for per-process byte enumeration. A failed
/// snapshot means "no data for this tick", never zero.
pub trait ProcessSampler: Send + Sync {
    fn snapshot(&self) -> impl Future<Output = Result<Snapshot>> + Send;
}

/// `nettop`-backed sampler. Runs one sample in CSV mode, which needs no
/// elevated privileges and reports per-process byte counts directly.
pub struct NettopSampler {
    timeout: Duration,
}

impl NettopSampler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ProcessSampler for NettopSampler {
    async fn snapshot(&self) -> Result<Snapshot> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("nettop")
                .args(["-P", "-x", "-L", "1", "-J", "bytes_in,bytes_out"])
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .context("nettop timed out")?
        .context("spawning nettop")?;

        if !output.status.success() {
            bail!(
                "nettop exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_nettop(&text))
    }
}

/// Parses nettop CSV output (`process_name.pid,bytes_in,bytes_out`).
///
/// Rows for separate PIDs of the same process collapse into one identity
/// by summing. Processes that have never transferred anything are
/// skipped; malformed lines are ignored rather than failing the tick.
pub fn parse_nettop(output: &str) -> Snapshot {
    let mut counters: HashMap<ProcessIdentity, CumulativeCounters> = HashMap::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split(',');
        let (Some(name_pid), Some(bytes_in), Some(bytes_out)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        // Header row has an empty first column.
        let Some(dot) = name_pid.rfind('.') else {
            continue;
        };
        let process_name = &name_pid[..dot];
        if process_name.is_empty() || name_pid[dot + 1..].parse::<u32>().is_err() {
            continue;
        }

        let (Ok(bytes_in), Ok(bytes_out)) = (bytes_in.parse::<u64>(), bytes_out.parse::<u64>())
        else {
            continue;
        };

        if bytes_in == 0 && bytes_out == 0 {
            continue;
        }

        let entry = counters
            .entry(ProcessIdentity::named(process_name))
            .or_default();
        entry.bytes_out = Cumulative(entry.bytes_out.0 + bytes_out);
        entry.bytes_in = Cumulative(entry.bytes_in.0 + bytes_in);
    }

    Snapshot { counters }
}
