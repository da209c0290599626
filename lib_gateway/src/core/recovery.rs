//! Startup recovery: rebuild sessions from the store and resume the pollers
//! that were running when the process went down.

use serde::Serialize;
use tracing::{error, info, warn};

use super::scheduler::PollingScheduler;
use super::session_pool::SessionPool;
use crate::connections::{MachineRepository, PollStatus};

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub restored: usize,
    pub healthy: usize,
    pub polling_resumed: usize,
    /// Session ids that could not be restored or resumed.
    pub skipped: Vec<String>,
}

/// Restores every stored session and resumes polling for records stored as
/// `polled` with a positive interval whose device answered the probe. Never
/// fails: problems with one record are logged and that record is skipped.
pub async fn recover(pool: &SessionPool, scheduler: &PollingScheduler, repo: &dyn MachineRepository) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    let records = match repo.get_all().await {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "could not load stored sessions, starting empty");
            return report;
        }
    };
    info!(count = records.len(), "restoring stored sessions");

    for record in records {
        let info = match pool.restore_connection(&record).await {
            Ok(info) => info,
            Err(e) => {
                warn!(session_id = %record.session_id, error = %e, "skipping unrestorable record");
                report.skipped.push(record.session_id);
                continue;
            }
        };
        report.restored += 1;
        if info.is_healthy {
            report.healthy += 1;
        }

        if record.status != PollStatus::Polled || record.interval_ms == 0 {
            continue;
        }
        if !info.is_healthy {
            warn!(session_id = %record.session_id, endpoint = %record.endpoint_url, "device unreachable, polling not resumed");
            report.skipped.push(record.session_id);
            continue;
        }
        match scheduler.start_polling(&record.session_id, record.interval_ms).await {
            Ok(()) => report.polling_resumed += 1,
            Err(e) => {
                warn!(session_id = %record.session_id, error = %e, "could not resume polling");
                report.skipped.push(record.session_id);
            }
        }
    }

    info!(
        restored = report.restored,
        healthy = report.healthy,
        polling_resumed = report.polling_resumed,
        skipped = report.skipped.len(),
        "recovery finished"
    );
    report
}
