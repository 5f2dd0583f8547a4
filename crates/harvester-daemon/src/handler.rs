//! Request handler for daemon IPC.

use async_trait::async_trait;
use harvester_core::{
    completed_summary, failed_summary, validate_workspace_id, LatencyTracker, Metrics, RunGuard,
    WorkspaceRegistry,
};
use harvester_engine::{Admission, Harvester, PreparedRun};
use harvester_ipc::{ErrorCode, Request, RequestHandler, Response, ResponseData};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

const RUN_OPERATION: &str = "harvest";

/// Handles incoming IPC requests
pub struct DaemonHandler {
    harvester: Arc<Harvester>,
    registry: Arc<WorkspaceRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    start_time: Instant,
    metrics: Arc<Metrics>,
    latency: Arc<LatencyTracker>,
}

impl DaemonHandler {
    /// Create a new handler
    pub fn new(
        harvester: Arc<Harvester>,
        registry: Arc<WorkspaceRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        start_time: Instant,
    ) -> Self {
        Self {
            harvester,
            registry,
            shutdown_tx,
            start_time,
            metrics: Arc::new(Metrics::new()),
            latency: Arc::new(LatencyTracker::default()),
        }
    }

    fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Validate, claim and admit a run, then execute it in the background.
    async fn trigger(&self, workspace: String) -> Response {
        if let Err(e) = validate_workspace_id(&workspace) {
            return Response::error(ErrorCode::InvalidRequest, e.to_string());
        }

        let Some(guard) = self.registry.try_begin(&workspace) else {
            tracing::info!(workspace = %workspace, "Harvest already running");
            self.metrics.record_throttled();
            return Response::throttled(self.harvester.options().minimum_interval);
        };

        match self.harvester.admit(&workspace).await {
            Admission::TooSoon { retry_after } => {
                self.metrics.record_throttled();
                Response::throttled(retry_after)
            }
            Admission::Accepted(prepared) => {
                self.metrics.record_started();
                self.spawn_run(prepared, guard);
                Response::ack()
            }
        }
    }

    fn spawn_run(&self, prepared: PreparedRun, guard: RunGuard) {
        let harvester = self.harvester.clone();
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let latency = self.latency.clone();
        let span = tracing::info_span!("run", run_id = %Uuid::new_v4());

        tokio::spawn(
            async move {
                let workspace = prepared.workspace_id().to_string();
                let admitted_at = prepared.admitted_at();
                let started = Instant::now();

                match harvester.execute(prepared).await {
                    Ok(report) => {
                        let elapsed = started.elapsed();
                        metrics.record_completed(elapsed, report.batches);
                        latency.record(RUN_OPERATION, elapsed);
                        tracing::info!(
                            workspace = %workspace,
                            changed = report.changed.len(),
                            deleted = report.deleted.len(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Harvest completed"
                        );
                        registry.record(completed_summary(&report));
                    }
                    Err(e) => {
                        metrics.record_failed();
                        tracing::error!(workspace = %workspace, error = %e, "Harvest failed");
                        registry.record(failed_summary(&workspace, admitted_at, e.to_string()));
                    }
                }

                // Release only after the summary is visible
                drop(guard);
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl RequestHandler for DaemonHandler {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::ok_with(ResponseData::Pong {
                timestamp: chrono::Utc::now().timestamp(),
            }),

            Request::Status => Response::ok_with(ResponseData::Status {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.uptime_secs(),
                active_runs: self.registry.active_count(),
                runs_started: self.metrics.runs_started.load(Ordering::Relaxed),
                runs_completed: self.metrics.runs_completed.load(Ordering::Relaxed),
                runs_failed: self.metrics.runs_failed.load(Ordering::Relaxed),
                runs_throttled: self.metrics.runs_throttled.load(Ordering::Relaxed),
                batches_emitted: self.metrics.batches_emitted.load(Ordering::Relaxed),
                avg_run_ms: self.metrics.avg_run_duration().as_millis() as u64,
                p99_run_ms: self.latency.p99(RUN_OPERATION).as_millis() as u64,
            }),

            Request::Harvest { workspace } => self.trigger(workspace).await,

            Request::LastRun { workspace } => Response::ok_with(ResponseData::LastRun {
                summary: self.registry.last_run(&workspace),
            }),

            Request::Shutdown => {
                tracing::info!("Shutdown requested");
                let _ = self.shutdown_tx.send(());
                Response::ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_engine::{
        HarvestOptions, MemoryNotifier, MemoryObjectStore, StoreAccessPolicySink,
    };
    use harvester_ipc::{RunStatus, RunSummary};
    use std::time::Duration;

    struct Fixture {
        handler: DaemonHandler,
        store: Arc<MemoryObjectStore>,
        notifier: Arc<MemoryNotifier>,
        shutdown_tx: broadcast::Sender<()>,
    }

    fn fixture(minimum_interval: Duration) -> Fixture {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("source");
        store.create_bucket("target");
        store.insert(
            "source",
            "alice/eodh-config/cat.json",
            r#"{"type":"Catalog","id":"cat"}"#,
        );

        let notifier = Arc::new(MemoryNotifier::new());
        let policy = Arc::new(StoreAccessPolicySink::new(
            store.clone(),
            "access-control",
            Duration::from_secs(5),
        ));
        let options = HarvestOptions {
            source_bucket: "source".to_string(),
            target_bucket: "target".to_string(),
            minimum_interval,
            storage_timeout: Duration::from_secs(5),
            ..HarvestOptions::default()
        };
        let harvester = Arc::new(Harvester::new(
            store.clone(),
            notifier.clone(),
            policy,
            options,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let handler = DaemonHandler::new(
            harvester,
            Arc::new(WorkspaceRegistry::new(8)),
            shutdown_tx.clone(),
            Instant::now(),
        );

        Fixture {
            handler,
            store,
            notifier,
            shutdown_tx,
        }
    }

    async fn wait_for_last_run(handler: &DaemonHandler, workspace: &str) -> RunSummary {
        for _ in 0..200 {
            if let Some(summary) = handler.registry.last_run(workspace) {
                return summary;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Run for {workspace} never finished");
    }

    #[tokio::test]
    async fn test_ping() {
        let f = fixture(Duration::ZERO);
        let response = f.handler.handle(Request::Ping).await;

        assert!(matches!(
            response,
            Response::Ok {
                data: Some(ResponseData::Pong { .. })
            }
        ));
    }

    #[tokio::test]
    async fn test_status() {
        let f = fixture(Duration::ZERO);
        let response = f.handler.handle(Request::Status).await;

        if let Response::Ok {
            data:
                Some(ResponseData::Status {
                    version,
                    active_runs,
                    ..
                }),
        } = response
        {
            assert_eq!(version, env!("CARGO_PKG_VERSION"));
            assert_eq!(active_runs, 0);
        } else {
            panic!("Expected Status response");
        }
    }

    #[tokio::test]
    async fn test_invalid_workspace_rejected() {
        let f = fixture(Duration::ZERO);

        for workspace in ["", "alice/eodh-config", ".."] {
            let response = f
                .handler
                .handle(Request::Harvest {
                    workspace: workspace.to_string(),
                })
                .await;
            assert!(matches!(
                response,
                Response::Error {
                    code: ErrorCode::InvalidRequest,
                    ..
                }
            ));
        }
        assert_eq!(f.store.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_harvest_runs_in_background() {
        let f = fixture(Duration::ZERO);

        let response = f
            .handler
            .handle(Request::Harvest {
                workspace: "alice".to_string(),
            })
            .await;
        assert!(matches!(response, Response::Ack));

        let summary = wait_for_last_run(&f.handler, "alice").await;
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.batches, 1);
        assert_eq!(f.notifier.batches().len(), 1);
        assert_eq!(f.handler.metrics.runs_completed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_retrigger_within_interval_is_throttled() {
        let f = fixture(Duration::from_secs(60));
        let harvest = || Request::Harvest {
            workspace: "alice".to_string(),
        };

        assert!(matches!(f.handler.handle(harvest()).await, Response::Ack));
        wait_for_last_run(&f.handler, "alice").await;
        while f.handler.registry.is_running("alice") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lists_after_first = f.store.list_calls();

        match f.handler.handle(harvest()).await {
            Response::Throttled { retry_after_secs } => {
                assert!(retry_after_secs > 0 && retry_after_secs <= 60);
            }
            other => panic!("Expected Throttled, got {other:?}"),
        }
        assert_eq!(f.store.list_calls(), lists_after_first);
        assert_eq!(f.handler.metrics.runs_throttled.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_trigger_while_running_is_throttled() {
        let f = fixture(Duration::ZERO);
        let _guard = f.handler.registry.try_begin("alice").unwrap();

        let response = f
            .handler
            .handle(Request::Harvest {
                workspace: "alice".to_string(),
            })
            .await;
        assert!(matches!(response, Response::Throttled { .. }));
    }

    #[tokio::test]
    async fn test_last_run_unknown_workspace() {
        let f = fixture(Duration::ZERO);
        let response = f
            .handler
            .handle(Request::LastRun {
                workspace: "nobody".to_string(),
            })
            .await;

        assert!(matches!(
            response,
            Response::Ok {
                data: Some(ResponseData::LastRun { summary: None })
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_broadcasts() {
        let f = fixture(Duration::ZERO);
        let mut shutdown_rx = f.shutdown_tx.subscribe();

        let response = f.handler.handle(Request::Shutdown).await;
        assert!(matches!(response, Response::Ok { data: None }));
        assert!(shutdown_rx.try_recv().is_ok());
    }
}
