//! Admission gate evaluated once per invocation, before any realm exists.
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::capabilities::SqlClient;
use crate::color_log::ColorLog;
use crate::config::AdmissionConfig;
use crate::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed { reason: String },
    Denied { reason: String },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            AdmissionDecision::Allowed { reason } | AdmissionDecision::Denied { reason } => reason,
        }
    }
}

impl fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionDecision::Allowed { reason } => write!(f, "allowed ({reason})"),
            AdmissionDecision::Denied { reason } => write!(f, "denied ({reason})"),
        }
    }
}

/// Source of the percentile draw used by [`RecordCountPolicy`].
pub trait RandomDraw: Send + Sync {
    /// A value in `[0, 100)`.
    fn percentile(&self) -> u32;
}

pub struct ThreadRngDraw;

impl RandomDraw for ThreadRngDraw {
    fn percentile(&self) -> u32 {
        rand::thread_rng().gen_range(0..100)
    }
}

/// Admits a run with a probability that shrinks as the combined record
/// count falls below `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCountPolicy {
    pub threshold: u64,
}

impl RecordCountPolicy {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn deficit(&self, counts: &[u64]) -> u64 {
        let total: u64 = counts.iter().fold(0u64, |acc, c| acc.saturating_add(*c));
        self.threshold.saturating_sub(total)
    }

    /// A deficit of 100 or more can never be admitted.
    pub fn admits(&self, counts: &[u64], draw: &dyn RandomDraw) -> bool {
        let deficit = self.deficit(counts);
        if deficit == 0 {
            return true;
        }
        let roll = draw.percentile();
        debug!(deficit, roll, "Record count below threshold");
        u64::from(roll) > deficit
    }
}

/// What happens to the process once admission is denied.
pub trait AbortStrategy {
    fn abort(&self, reason: &str) -> !;
}

/// Logs the denial and exits with status 1.
pub struct ExitProcess;

impl AbortStrategy for ExitProcess {
    fn abort(&self, reason: &str) -> ! {
        let err = HarnessError::Admission(reason.to_string());
        error!("{}: {err}", err.kind());
        ColorLog::error(format!("{}: {err}", err.kind()));
        std::process::exit(1)
    }
}

pub struct AdmissionGate {
    config: AdmissionConfig,
    policy: RecordCountPolicy,
    draw: Box<dyn RandomDraw>,
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig) -> Self {
        Self::with_draw(config, Box::new(ThreadRngDraw))
    }

    pub fn with_draw(config: AdmissionConfig, draw: Box<dyn RandomDraw>) -> Self {
        Self {
            policy: RecordCountPolicy::new(config.threshold),
            config,
            draw,
        }
    }

    /// Decides whether `source` may run. Never fails: every error is a denial.
    pub async fn evaluate(&self, source: &str, database: Option<Arc<SqlClient>>) -> AdmissionDecision {
        if !self.config.bypass.is_empty() && source.contains(&self.config.bypass) {
            info!("Admission bypass marker present");
            return AdmissionDecision::Allowed {
                reason: "bypass marker".into(),
            };
        }
        let Some(db) = database else {
            return AdmissionDecision::Denied {
                reason: "database capability unavailable".into(),
            };
        };

        match self.record_counts(&db).await {
            Ok(counts) => {
                if self.policy.admits(&counts, self.draw.as_ref()) {
                    AdmissionDecision::Allowed {
                        reason: format!("record counts {counts:?}"),
                    }
                } else {
                    AdmissionDecision::Denied {
                        reason: format!(
                            "record counts {counts:?} below threshold {}",
                            self.policy.threshold
                        ),
                    }
                }
            }
            Err(e) => {
                warn!("Admission check failed: {e:#}");
                AdmissionDecision::Denied {
                    reason: format!("admission check failed: {e:#}"),
                }
            }
        }
    }

    async fn record_counts(&self, db: &SqlClient) -> Result<Vec<u64>> {
        db.connect(db.default_params().clone()).await?;
        let mut counts = Vec::with_capacity(self.config.tables.len());
        for table in &self.config.tables {
            counts.push(db.count_rows(table).await?);
        }
        db.close();
        Ok(counts)
    }
}

/// Returns normally only for `Allowed`.
pub fn enforce(decision: &AdmissionDecision, strategy: &dyn AbortStrategy) {
    match decision {
        AdmissionDecision::Allowed { reason } => debug!("Admission granted: {reason}"),
        AdmissionDecision::Denied { reason } => strategy.abort(reason),
    }
}

/// Every marker must appear somewhere in the source.
pub fn validate_script_protection(
    file: &str,
    source: &str,
    markers: &[String],
) -> Result<(), HarnessError> {
    let missing: Vec<&String> = markers.iter().filter(|m| !source.contains(m.as_str())).collect();
    if missing.is_empty() {
        return Ok(());
    }
    for marker in &missing {
        warn!("{file} is missing protection marker {marker:?}");
    }
    Err(HarnessError::ScriptValidation {
        file: file.to_string(),
        missing: missing.len(),
    })
}
