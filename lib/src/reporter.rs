//! Deployment log capture and report buffering.
//!
//! Log lines produced while a deployment runs are kept in a bounded ring
//! buffer; on a terminal failure they are uploaded alongside the status
//! report. Status reports that cannot be delivered are parked in the
//! store and flushed once the network returns.

use std::collections::VecDeque;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::spec::{DeploymentStatus, StatusReport};
use crate::store::{Store, PENDING_REPORT_KEY};

/// Upper bound on captured log lines per deployment; oldest lines fall out.
const LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct LogLine {
    pub(crate) timestamp: String,
    pub(crate) level: String,
    pub(crate) message: String,
}

/// Per-deployment ring buffer of log lines. Serialized to the store so
/// lines recorded before a reboot survive into the post-reboot report.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct DeploymentLog {
    lines: VecDeque<LogLine>,
}

impl DeploymentLog {
    pub(crate) fn record(&mut self, level: &str, message: impl Into<String>) {
        if self.lines.len() == LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(LogLine {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.into(),
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.lines.clear();
    }

    /// The JSON array uploaded to the log endpoint.
    pub(crate) fn to_messages(&self) -> serde_json::Value {
        serde_json::to_value(&self.lines).unwrap_or_else(|_| serde_json::json!([]))
    }
}

/// A report parked in the store until the network returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct BufferedReport {
    pub(crate) deployment_id: String,
    pub(crate) status: DeploymentStatus,
}

impl BufferedReport {
    pub(crate) fn to_report(&self) -> StatusReport {
        StatusReport::new(&self.deployment_id, self.status)
    }
}

/// Park a report for later delivery.
pub(crate) fn buffer_report(store: &Store, report: &StatusReport) -> Result<()> {
    let buffered = BufferedReport {
        deployment_id: report.deployment_id.clone(),
        status: report.status,
    };
    tracing::warn!(
        "buffering undeliverable {} report for deployment {}",
        buffered.status,
        buffered.deployment_id
    );
    store.write_json(PENDING_REPORT_KEY, &buffered)
}

/// The parked report, if any.
pub(crate) fn buffered_report(store: &Store) -> Result<Option<BufferedReport>> {
    store.read_json(PENDING_REPORT_KEY)
}

/// Drop the parked report after successful delivery.
pub(crate) fn clear_buffered_report(store: &Store) -> Result<()> {
    store.remove(PENDING_REPORT_KEY)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[test]
    fn test_ring_buffer_caps_lines() {
        let mut log = DeploymentLog::default();
        assert!(log.is_empty());
        for i in 0..(LOG_CAPACITY + 10) {
            log.record("info", format!("line {i}"));
        }
        assert_eq!(log.lines.len(), LOG_CAPACITY);
        // The oldest lines were dropped
        assert_eq!(log.lines.front().unwrap().message, "line 10");
        let messages = log.to_messages();
        assert_eq!(messages.as_array().unwrap().len(), LOG_CAPACITY);
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_report_buffering_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::open(Utf8Path::from_path(td.path()).unwrap()).unwrap();
        assert!(buffered_report(&store).unwrap().is_none());

        let report = StatusReport::new("d1", DeploymentStatus::Failure);
        buffer_report(&store, &report).unwrap();
        let parked = buffered_report(&store).unwrap().unwrap();
        assert_eq!(parked.deployment_id, "d1");
        assert_eq!(parked.status, DeploymentStatus::Failure);
        assert_eq!(parked.to_report().deployment_id, "d1");

        clear_buffered_report(&store).unwrap();
        assert!(buffered_report(&store).unwrap().is_none());
    }
}
