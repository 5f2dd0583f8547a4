//! Daemon lifecycle management.

use anyhow::{Context, Result};
use harvester_core::{HarvesterConfig, WorkspaceRegistry};
use harvester_engine::{
    FsObjectStore, Harvester, ObjectStore, OutboxNotifier, StoreAccessPolicySink,
};
use harvester_ipc::IpcServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::handler::DaemonHandler;
use crate::signals;

/// How often shutdown re-checks for in-flight runs
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// The main daemon process
pub struct Daemon {
    config: HarvesterConfig,
    shutdown_tx: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    start_time: std::time::Instant,
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new(config: HarvesterConfig) -> Result<Self> {
        config
            .ensure_dirs()
            .context("Failed to create data directories")?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            shutdown_tx,
            is_running: Arc::new(AtomicBool::new(false)),
            start_time: std::time::Instant::now(),
        })
    }

    /// Run the daemon
    pub async fn run(&self) -> Result<()> {
        self.acquire_pid_lock()?;
        self.is_running.store(true, Ordering::SeqCst);

        tracing::info!(
            socket = %self.config.socket_path.display(),
            storage_root = %self.config.storage_root.display(),
            source_bucket = %self.config.source_bucket,
            target_bucket = %self.config.target_bucket,
            "Daemon starting"
        );

        let registry = Arc::new(WorkspaceRegistry::new(self.config.recent_runs));
        let handler = Arc::new(DaemonHandler::new(
            Arc::new(self.build_harvester()),
            registry.clone(),
            self.shutdown_tx.clone(),
            self.start_time,
        ));

        let ipc_server = IpcServer::new(&self.config.socket_path, handler)
            .await
            .context("Failed to create IPC server")?;

        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::select! {
            result = ipc_server.run() => {
                if let Err(e) = result {
                    tracing::error!("IPC server error: {}", e);
                }
            }
            _ = signals::wait_for_shutdown(shutdown_rx) => {
                tracing::info!("Shutdown signal received");
            }
        }

        self.drain(&registry).await;
        self.cleanup().await?;

        Ok(())
    }

    fn build_harvester(&self) -> Harvester {
        let timeout = self.config.storage_timeout();
        let store: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(self.config.storage_root.clone()));
        let notifier = Arc::new(OutboxNotifier::new(
            store.clone(),
            self.config.outbox_options(),
        ));
        let policy = Arc::new(StoreAccessPolicySink::new(
            store.clone(),
            self.config.policy_bucket.clone(),
            timeout,
        ));

        Harvester::new(store, notifier, policy, self.config.harvest_options())
    }

    /// Give in-flight runs one storage timeout to persist their ledgers.
    async fn drain(&self, registry: &WorkspaceRegistry) {
        let deadline = tokio::time::Instant::now() + self.config.storage_timeout();

        while registry.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    active_runs = registry.active_count(),
                    "Shutting down with runs in flight"
                );
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Acquire PID lock to ensure single instance
    fn acquire_pid_lock(&self) -> Result<()> {
        let pid_file = &self.config.pid_file;

        if pid_file.exists() {
            if let Ok(pid_str) = std::fs::read_to_string(pid_file) {
                if let Ok(pid) = pid_str.trim().parse::<u32>() {
                    if is_process_running(pid) {
                        anyhow::bail!("Daemon already running (PID: {})", pid);
                    }
                }
            }
            // Stale PID file, remove it
            std::fs::remove_file(pid_file)?;
        }

        std::fs::write(pid_file, std::process::id().to_string())?;

        tracing::debug!(pid = std::process::id(), "PID lock acquired");

        Ok(())
    }

    /// Cleanup resources on shutdown
    async fn cleanup(&self) -> Result<()> {
        tracing::info!("Cleaning up...");

        if self.config.socket_path.exists() {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }

        if self.config.pid_file.exists() {
            let _ = std::fs::remove_file(&self.config.pid_file);
        }

        self.is_running.store(false, Ordering::SeqCst);

        tracing::info!("Cleanup complete");

        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if self.config.pid_file.exists() {
            let _ = std::fs::remove_file(&self.config.pid_file);
        }
    }
}

/// Check if a process is running by PID
fn is_process_running(pid: u32) -> bool {
    // kill(pid, 0) only probes for existence
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(root: &std::path::Path) -> HarvesterConfig {
        HarvesterConfig {
            socket_path: root.join("harvester.sock"),
            pid_file: root.join("harvester.pid"),
            data_dir: root.to_path_buf(),
            storage_root: root.join("storage"),
            outbox_dir: root.join("outbox"),
            storage_timeout_secs: 1,
            ..HarvesterConfig::default()
        }
    }

    #[test]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(999999999));
    }

    #[test]
    fn test_pid_lock() {
        let temp_dir = tempdir().unwrap();
        let config = test_config(temp_dir.path());

        // A stale PID file is replaced
        std::fs::write(&config.pid_file, "999999999").unwrap();
        let daemon = Daemon::new(config.clone()).unwrap();
        daemon.acquire_pid_lock().unwrap();
        assert_eq!(
            std::fs::read_to_string(&config.pid_file).unwrap(),
            std::process::id().to_string()
        );

        // A live PID blocks a second instance
        let second = Daemon::new(config.clone()).unwrap();
        assert!(second.acquire_pid_lock().is_err());
    }

    #[tokio::test]
    async fn test_drain_waits_for_active_runs() {
        let temp_dir = tempdir().unwrap();
        let daemon = Daemon::new(test_config(temp_dir.path())).unwrap();
        let registry = Arc::new(WorkspaceRegistry::new(4));

        let guard = registry.try_begin("alice").unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(guard);
        });

        daemon.drain(&registry).await;
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_daemon_serves_harvest_and_shutdown() {
        let temp_dir = tempdir().unwrap();
        let config = test_config(temp_dir.path());
        let source = config.storage_root.join(&config.source_bucket);
        std::fs::create_dir_all(source.join("alice/eodh-config")).unwrap();
        std::fs::write(
            source.join("alice/eodh-config/cat.json"),
            r#"{"type":"Catalog","id":"cat"}"#,
        )
        .unwrap();

        let daemon = Daemon::new(config.clone()).unwrap();
        let server = tokio::spawn(async move { daemon.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = harvester_ipc::IpcClient::with_socket_path(&config.socket_path);
        assert_eq!(
            client.harvest("alice").await.unwrap(),
            harvester_ipc::HarvestAck::Accepted
        );

        let mut summary = None;
        for _ in 0..100 {
            summary = client.last_run("alice").await.unwrap();
            if summary.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(summary.unwrap().changed, 1);

        client.request(harvester_ipc::Request::Shutdown).await.unwrap();
        server.await.unwrap().unwrap();
        assert!(!config.pid_file.exists());
    }
}
