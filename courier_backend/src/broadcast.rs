use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::BroadcastLog;
use crate::error::{BroadcastError, StoreError};
use crate::gateway::MessagingGateway;
use crate::settings::Settings;
use crate::types::{
    AttemptOutcome, BroadcastAttempt, BroadcastSummary, ConversationId, ConversationInfo,
};

/// Sends the configured start message to every broadcast target, one after
/// another, writing one audit record per target.
pub struct BroadcastOrchestrator {
    settings: Arc<Settings>,
    gateway: Arc<dyn MessagingGateway>,
    log: Option<Arc<dyn BroadcastLog>>,
    run_lock: Mutex<()>,
}

impl BroadcastOrchestrator {
    pub fn new(
        settings: Arc<Settings>,
        gateway: Arc<dyn MessagingGateway>,
        log: Option<Arc<dyn BroadcastLog>>,
    ) -> Self {
        Self {
            settings,
            gateway,
            log,
            run_lock: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<BroadcastSummary, BroadcastError> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| BroadcastError::AlreadyRunning)?;

        let settings = self.settings.get_broadcast_settings();
        if settings.start_message.trim().is_empty() {
            tracing::warn!("Broadcast skipped: start message is empty");
            return Err(BroadcastError::EmptyStartMessage);
        }
        if settings.targets.is_empty() {
            tracing::warn!("Broadcast skipped: no targets configured");
            return Err(BroadcastError::NoTargets);
        }

        let run_id = Uuid::new_v4().to_string();
        tracing::info!(
            "Broadcast {} starting for {} target(s)",
            run_id,
            settings.targets.len()
        );

        let mut summary = BroadcastSummary {
            run_id: run_id.clone(),
            total: settings.targets.len(),
            succeeded: 0,
            failed: 0,
            log_failures: 0,
        };

        for &target in &settings.targets {
            let attempt = self
                .attempt(&run_id, target, &settings.start_message)
                .await;

            if attempt.outcome.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }

            if !self.record(&attempt) {
                summary.log_failures += 1;
            }
        }

        tracing::info!(
            "Broadcast {} finished: {} sent, {} failed",
            run_id,
            summary.succeeded,
            summary.failed
        );
        Ok(summary)
    }

    async fn attempt(&self, run_id: &str, target: ConversationId, text: &str) -> BroadcastAttempt {
        let info = match self.gateway.lookup(target).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Lookup of broadcast target {} failed: {:#}", target, e);
                ConversationInfo::unknown(target)
            }
        };

        let (outcome, error_detail) = match self.gateway.send_message(target, text).await {
            Ok(()) => {
                tracing::info!("Broadcast message sent to {} ({})", target, info.display_name);
                (AttemptOutcome::Success, None)
            }
            Err(e) => {
                tracing::warn!("Broadcast to {} failed: {:#}", target, e);
                let detail = format!("{:#}", e);
                let detail = if detail.trim().is_empty() {
                    "send failed".to_string()
                } else {
                    detail
                };
                (AttemptOutcome::Failure, Some(detail))
            }
        };

        BroadcastAttempt {
            run_id: run_id.to_string(),
            target,
            target_kind: info.kind,
            target_name: info.display_name,
            message_text: text.to_string(),
            outcome,
            error_detail,
            attempted_at: Utc::now(),
        }
    }

    /// Returns false when the attempt could not be written.
    fn record(&self, attempt: &BroadcastAttempt) -> bool {
        let Some(log) = &self.log else {
            tracing::warn!(
                "Broadcast log unavailable; attempt for {} not recorded",
                attempt.target
            );
            return false;
        };
        match log.append(attempt) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "Failed to record broadcast attempt for {}: {:#}",
                    attempt.target,
                    e
                );
                false
            }
        }
    }

    /// Most recent attempts first.
    pub fn recent(&self, limit: usize) -> Result<Vec<BroadcastAttempt>, StoreError> {
        let log = self.log.as_ref().ok_or(StoreError::Unavailable)?;
        Ok(log.recent(limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::CourierDatabase;
    use crate::settings::SettingsDefaults;
    use crate::testing::{FailingLog, FakeGateway};
    use crate::types::TargetKind;
    use tempfile::TempDir;

    fn id(raw: i64) -> ConversationId {
        ConversationId::new(raw)
    }

    fn settings(targets: &str, message: &str) -> Arc<Settings> {
        Arc::new(Settings::new(
            None,
            SettingsDefaults {
                system_instructions: "persona".to_string(),
                broadcast_targets: targets.to_string(),
                broadcast_start_message: message.to_string(),
            },
        ))
    }

    fn temp_log() -> (TempDir, Arc<CourierDatabase>) {
        let dir = TempDir::new().expect("temp dir");
        let db = CourierDatabase::new(dir.path().join("broadcast.db")).expect("db init");
        (dir, Arc::new(db))
    }

    fn orchestrator(
        settings: Arc<Settings>,
        gateway: Arc<FakeGateway>,
        log: Option<Arc<dyn BroadcastLog>>,
    ) -> BroadcastOrchestrator {
        BroadcastOrchestrator::new(settings, gateway, log)
    }

    #[tokio::test]
    async fn one_failed_target_does_not_stop_the_run() {
        let (_dir, db) = temp_log();
        let gateway = Arc::new(FakeGateway::new());
        gateway.fail_sends_to(id(2));
        let log: Arc<dyn BroadcastLog> = db.clone();
        let orchestrator = orchestrator(settings("1,2,3", "Hello!"), gateway.clone(), Some(log));

        let summary = orchestrator.run().await.unwrap();

        assert_eq!(
            (summary.total, summary.succeeded, summary.failed),
            (3, 2, 1)
        );
        assert_eq!(summary.log_failures, 0);
        assert_eq!(
            gateway.sent(),
            vec![(id(1), "Hello!".to_string()), (id(3), "Hello!".to_string())]
        );

        let records = db.get_recent_broadcast_attempts(10).unwrap();
        assert_eq!(records.len(), 3);
        // newest first
        let by_target: Vec<(i64, AttemptOutcome)> = records
            .iter()
            .map(|r| (r.target.get(), r.outcome))
            .collect();
        assert_eq!(
            by_target,
            vec![
                (3, AttemptOutcome::Success),
                (2, AttemptOutcome::Failure),
                (1, AttemptOutcome::Success),
            ]
        );
        let failed = &records[1];
        assert!(failed.error_detail.as_deref().is_some_and(|d| !d.is_empty()));
        assert!(records[0].error_detail.is_none());
        assert!(records.iter().all(|r| r.run_id == summary.run_id));
    }

    #[tokio::test]
    async fn empty_targets_or_message_sends_nothing() {
        let gateway = Arc::new(FakeGateway::new());

        let no_targets = orchestrator(settings(" , ", "Hello!"), gateway.clone(), None);
        assert!(matches!(
            no_targets.run().await,
            Err(BroadcastError::NoTargets)
        ));

        let no_message = orchestrator(settings("1,2", "   "), gateway.clone(), None);
        assert!(matches!(
            no_message.run().await,
            Err(BroadcastError::EmptyStartMessage)
        ));

        assert!(gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn lookup_failure_logs_unknown_metadata_but_still_sends() {
        let (_dir, db) = temp_log();
        let gateway = Arc::new(FakeGateway::new());
        gateway.add_known(ConversationInfo {
            id: id(-100),
            kind: TargetKind::Channel,
            display_name: "News".to_string(),
        });
        gateway.fail_lookups_for(id(7));
        let log: Arc<dyn BroadcastLog> = db.clone();
        let orchestrator = orchestrator(settings("-100,7", "hi"), gateway.clone(), Some(log));

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.succeeded, 2);

        let records = db.get_recent_broadcast_attempts(10).unwrap();
        assert_eq!(records[0].target, id(7));
        assert_eq!(records[0].target_kind, TargetKind::Unknown);
        assert_eq!(records[0].target_name, "unknown");
        assert_eq!(records[1].target_kind, TargetKind::Channel);
        assert_eq!(records[1].target_name, "News");
    }

    #[tokio::test]
    async fn recent_returns_newest_attempts_first() {
        let (_dir, db) = temp_log();
        let gateway = Arc::new(FakeGateway::new());
        let log: Arc<dyn BroadcastLog> = db.clone();
        let orchestrator = orchestrator(settings("1,2,3,4,5", "hi"), gateway, Some(log));
        orchestrator.run().await.unwrap();

        let recent = orchestrator.recent(2).unwrap();
        let targets: Vec<i64> = recent.iter().map(|r| r.target.get()).collect();
        assert_eq!(targets, vec![5, 4]);
    }

    #[tokio::test]
    async fn concurrent_runs_are_rejected() {
        let gateway = Arc::new(FakeGateway::new());
        let orchestrator = orchestrator(settings("1", "hi"), gateway.clone(), None);

        let _held = orchestrator.run_lock.try_lock().unwrap();
        assert!(matches!(
            orchestrator.run().await,
            Err(BroadcastError::AlreadyRunning)
        ));
        assert!(gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn log_write_failures_are_counted_without_aborting() {
        let gateway = Arc::new(FakeGateway::new());
        let log: Arc<dyn BroadcastLog> = Arc::new(FailingLog);
        let orchestrator = orchestrator(settings("1,2", "hi"), gateway.clone(), Some(log));

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.log_failures, 2);
        assert_eq!(gateway.sent().len(), 2);
        assert!(matches!(orchestrator.recent(5), Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn recent_without_a_log_reports_unavailable() {
        let orchestrator = orchestrator(settings("", ""), Arc::new(FakeGateway::new()), None);
        assert!(matches!(orchestrator.recent(5), Err(StoreError::Unavailable)));
    }
}
