//! Active-tab ingestion from the cooperating browser agent.

use std::sync::Arc;

use chrono::DateTime;
use serde::Deserialize;

use crate::catalog::{AppCatalog, DomainCatalog};
use crate::error::MonitorError;
use crate::store::models::BrowserDomainSample;
use crate::store::samples::SampleRepository;
use crate::store::Database;

/// Browser names with a known canonical process name. Anything else is
/// accepted verbatim (lowercased) so new browsers work without a release.
const BROWSER_PROCESS_NAMES: &[(&str, &str)] = &[
    ("zen", "zen"),
    ("chrome", "Google Chrome"),
    ("safari", "Safari"),
    ("firefox", "Firefox"),
    ("arc", "Arc"),
    ("brave", "Brave Browser"),
    ("edge", "Microsoft Edge"),
];

/// Wire form of `POST /browser/active-tab`.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveTabReport {
    pub domain: String,
    pub timestamp: Option<Timestamp>,
    pub browser: String,
}

/// Report timestamps arrive either as Unix seconds or ISO-8601 text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Unix(i64),
    Iso(String),
}

impl Timestamp {
    fn resolve(&self) -> Result<i64, MonitorError> {
        match self {
            Timestamp::Unix(secs) => Ok(*secs),
            Timestamp::Iso(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.timestamp())
                .map_err(|e| {
                    MonitorError::validation(format!("timestamp is not ISO-8601: {e}"))
                }),
        }
    }
}

/// Outcome of one recorded report.
#[derive(Debug, Clone, Copy)]
pub struct IngestOutcome {
    pub domain_id: i64,
    /// False when an identical report in the same second already existed.
    pub inserted: bool,
}

/// Accepts active-tab events, interning the domain and attributing the
/// visit to the reporting browser's application row.
pub struct DomainIngest {
    db: Database,
    domains: DomainCatalog,
    apps: Arc<AppCatalog>,
}

impl DomainIngest {
    pub fn new(db: Database, apps: Arc<AppCatalog>) -> Self {
        Self {
            domains: DomainCatalog::new(db.clone()),
            db,
            apps,
        }
    }

    /// Validates and records one report. `now` backs reports that omit a
    /// timestamp.
    pub async fn record(
        &self,
        report: &ActiveTabReport,
        now: i64,
    ) -> Result<IngestOutcome, MonitorError> {
        let browser = report.browser.trim().to_ascii_lowercase();
        if browser.is_empty() {
            return Err(MonitorError::validation("browser must not be empty"));
        }

        let ts = match &report.timestamp {
            Some(ts) => ts.resolve()?,
            None => now,
        };

        let (domain_id, _parent) = self.domains.intern(&report.domain, now).await?;

        let process_name = BROWSER_PROCESS_NAMES
            .iter()
            .find(|(name, _)| *name == browser)
            .map(|(_, process)| (*process).to_string())
            .unwrap_or_else(|| browser.clone());
        let bundle_id = format!("browser.{browser}");

        let app_id = self
            .apps
            .resolve(&process_name, Some(&bundle_id), now)
            .await
            .map_err(|e| MonitorError::TransientIo(format!("browser app intern: {e}")))?;

        let sample = BrowserDomainSample {
            ts,
            domain_id,
            app_id,
            bytes_out: 0,
            bytes_in: 0,
        };
        let inserted = self
            .db
            .execute(move |conn| SampleRepository::new(conn).insert_browser_sample(&sample))
            .await
            .map_err(|e| MonitorError::TransientIo(format!("browser sample insert: {e}")))?;

        tracing::debug!(domain_id, browser = %browser, inserted, "recorded active tab");

        Ok(IngestOutcome {
            domain_id,
            inserted,
        })
    }
}
