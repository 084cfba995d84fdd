//! Health Prober: periodic liveness + HTTP health checks over every
//! registered process, escalating to restart after a consecutive-failure
//! threshold and reporting recovery once a process comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quantctl_shared::config::HealthCheckConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::ProcessSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Per-process probing state, held for as long as the process stays
/// registered with the prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub name: String,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_status: HealthStatus,
}

struct Registration {
    config: HealthCheckConfig,
    record: HealthRecord,
}

/// Runs one probe cycle per `interval` across every registered process.
pub struct HealthProber {
    supervisor: Arc<ProcessSupervisor>,
    http: reqwest::Client,
    registrations: DashMap<String, Registration>,
    tick_task: RwLock<Option<JoinHandle<()>>>,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

impl HealthProber {
    pub fn new(supervisor: Arc<ProcessSupervisor>, cancellation: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            http: reqwest::Client::new(),
            registrations: DashMap::new(),
            tick_task: RwLock::new(None),
            cancellation,
        })
    }

    pub fn register(&self, name: &str, config: HealthCheckConfig) {
        self.registrations.insert(
            name.to_string(),
            Registration {
                config,
                record: HealthRecord {
                    name: name.to_string(),
                    consecutive_failures: 0,
                    last_check_at: None,
                    last_status: HealthStatus::Unknown,
                },
            },
        );
    }

    pub fn unregister(&self, name: &str) {
        self.registrations.remove(name);
    }

    pub fn get_health(&self, name: &str) -> Option<HealthRecord> {
        self.registrations.get(name).map(|r| r.record.clone())
    }

    pub fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.registrations
            .iter()
            .map(|r| (r.key().clone(), r.record.clone()))
            .collect()
    }

    /// Start the background tick loop. Idempotent: a second call replaces
    /// the previous loop.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.cancellation.cancelled() => break,
                }
                this.probe_all().await;
            }
        });
        // Best-effort fire-and-forget: a stale handle from a previous call,
        // if any, is simply dropped (aborting on drop is not required since
        // the loop observes the shared cancellation token).
        if let Ok(mut guard) = self.tick_task.try_write() {
            *guard = Some(task);
        }
    }

    /// Probe every registered process concurrently, at most one in-flight
    /// probe per process.
    async fn probe_all(self: &Arc<Self>) {
        let names: Vec<String> = self.registrations.iter().map(|r| r.key().clone()).collect();
        let probes = names.into_iter().map(|name| {
            let this = self.clone();
            async move { this.probe_one(&name).await }
        });
        futures::future::join_all(probes).await;
    }

    async fn probe_one(self: &Arc<Self>, name: &str) {
        let config = match self.registrations.get(name) {
            Some(r) if r.config.enabled => r.config.clone(),
            _ => return,
        };

        let alive = self.supervisor.is_alive(name);
        let endpoint_ok = match &config.endpoint {
            Some(url) => self.probe_endpoint(url, config.timeout()).await,
            None => true,
        };
        let healthy = alive && endpoint_ok;

        let (failures, was_failing, threshold_hit) = {
            let mut entry = match self.registrations.get_mut(name) {
                Some(e) => e,
                None => return,
            };
            let was_failing = entry.record.consecutive_failures > 0;
            if healthy {
                entry.record.consecutive_failures = 0;
                entry.record.last_status = HealthStatus::Healthy;
            } else {
                entry.record.consecutive_failures += 1;
                entry.record.last_status = HealthStatus::Unhealthy;
            }
            entry.record.last_check_at = Some(Utc::now());
            let threshold_hit =
                !healthy && entry.record.consecutive_failures >= config.failure_threshold;
            (entry.record.consecutive_failures, was_failing, threshold_hit)
        };

        if healthy && was_failing {
            info!(service = %name, "health recovered after {} consecutive failures", failures.max(1));
        }

        if threshold_hit {
            warn!(service = %name, failures, "failure threshold reached, restarting");
            if let Err(e) = self
                .supervisor
                .restart_process(name, Duration::from_secs(10))
                .await
            {
                warn!(service = %name, error = %e, "prober-triggered restart failed");
            }
            if let Some(mut entry) = self.registrations.get_mut(name) {
                entry.record.consecutive_failures = 0;
            }
        }
    }

    async fn probe_endpoint(&self, url: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.http.get(url).send()).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(_)) | Err(_) => false,
        }
    }
}
