//! Background cleanup of expired codes, sessions and blacklist entries
//!
//! Every sweep only deletes rows already past their expiry, so passes are
//! idempotent and can run next to live traffic.

use super::codes::AuthorizationCodeIssuer;
use super::revocation::RevocationRegistry;
use super::sessions::SessionStore;
use crate::core::Dependencies;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Rows removed by one pass
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub codes: u64,
    pub sessions: u64,
    pub blacklist: u64,
    /// Sweeps that failed; the others still ran
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.codes + self.sessions + self.blacklist
    }
}

pub struct Sweeper {
    codes: Arc<AuthorizationCodeIssuer>,
    sessions: Arc<SessionStore>,
    revocation: Arc<RevocationRegistry>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        codes: Arc<AuthorizationCodeIssuer>,
        sessions: Arc<SessionStore>,
        revocation: Arc<RevocationRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            codes,
            sessions,
            revocation,
            interval,
        }
    }

    pub fn from_dependencies(deps: &Dependencies) -> Self {
        Self::new(
            deps.codes.clone(),
            deps.sessions.clone(),
            deps.revocation.clone(),
            Duration::from_secs(deps.config.get_sweep().interval_secs.max(1)),
        )
    }

    /// Run all three sweeps once
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.codes.sweep_expired().await {
            Ok(n) => report.codes = n,
            Err(e) => report.errors.push(format!("codes: {e}")),
        }
        match self.sessions.sweep_expired().await {
            Ok(n) => report.sessions = n,
            Err(e) => report.errors.push(format!("sessions: {e}")),
        }
        match self.revocation.sweep_expired().await {
            Ok(n) => report.blacklist = n,
            Err(e) => report.errors.push(format!("blacklist: {e}")),
        }

        if report.errors.is_empty() {
            tracing::debug!(
                codes = report.codes,
                sessions = report.sessions,
                blacklist = report.blacklist,
                "Sweep completed"
            );
        } else {
            tracing::warn!(errors = ?report.errors, "Sweep completed with errors");
        }
        report
    }

    /// Sweep on a fixed interval until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tracing::info!(interval_secs = self.interval.as_secs(), "Starting background sweeper");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
