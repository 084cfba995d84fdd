//! Process Supervisor: owns the fork-exec lifecycle of supervised children.
//!
//! One [`ProcessSupervisor`] instance is shared (behind an `Arc`) by the
//! Orchestrator and the Health Prober. Each service name maps to at most one
//! non-terminal [`ProcessRecord`] at a time; starting a new instance after a
//! prior one has reached a terminal state replaces the record rather than
//! mutating it in place, so historical pids and timestamps are never
//! silently overwritten mid-flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quantctl_shared::error::ErrorKind;
use quantctl_shared::messaging::{topics, MessageBus};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Semantic category of a supervised child, per the configured service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessType {
    Optimizer,
    Trader,
    MarketIngestor,
    Monitor,
}

/// Runtime state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

/// How to (re)launch a process: binary, argv, env overlay, working directory.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
}

/// Restart policy attached to a launch spec.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub auto_restart: bool,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: false,
            max_attempts: 0,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// A registered process and its last-known runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: Uuid,
    pub name: String,
    pub process_type: ProcessType,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_attempts: u32,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service '{0}' already has a running process")]
    AlreadyRunning(String),

    #[error("no process registered for '{0}'")]
    NotFound(String),

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    #[error("operation timed out waiting for '{0}' to exit")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("restart budget exhausted for '{0}'")]
    ResourceExhausted(String),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::AlreadyRunning(_) => ErrorKind::InvalidState,
            SupervisorError::NotFound(_) => ErrorKind::InvalidState,
            SupervisorError::SpawnFailed(_) => ErrorKind::TransientIo,
            SupervisorError::Timeout(_) => ErrorKind::Timeout,
            SupervisorError::Cancelled => ErrorKind::Cancelled,
            SupervisorError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }
}

struct Entry {
    record: ProcessRecord,
    spec: LaunchSpec,
    policy: RestartPolicy,
    child: Option<Arc<RwLock<Child>>>,
}

/// Quadratic backoff per the recorded restart history: `base * attempt^2`,
/// capped so a misbehaving service doesn't push the delay unboundedly high.
fn restart_delay(base: Duration, attempt: u32) -> Duration {
    const CAP: Duration = Duration::from_secs(300);
    let scaled = base.saturating_mul(attempt.saturating_mul(attempt));
    scaled.min(CAP)
}

/// Liveness probe: a pid is alive if the OS still reports a process at that
/// pid. `sysinfo` abstracts the "signal 0" convention across platforms so
/// the supervisor never has to special-case POSIX vs. other OSes.
fn pid_is_alive(pid: u32) -> bool {
    let mut sys = System::new_with_specifics(RefreshKind::nothing());
    let os_pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[os_pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    sys.process(os_pid).is_some()
}

fn send_signal(pid: u32, signal: Signal) -> bool {
    let mut sys = System::new_with_specifics(RefreshKind::nothing());
    let os_pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[os_pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    match sys.process(os_pid) {
        Some(proc_) => proc_.kill_with(signal).unwrap_or(false),
        None => false,
    }
}

/// Owns every supervised child's fork-exec lifecycle.
#[derive(Debug)]
pub struct ProcessSupervisor {
    bus: MessageBus,
    cancellation: CancellationToken,
    entries: DashMap<String, Entry>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("record", &self.record)
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(bus: MessageBus, cancellation: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            bus,
            cancellation,
            entries: DashMap::new(),
        })
    }

    /// Spawn `spec` under `name`, registering it as `process_type`. Fails if
    /// a non-terminal record already exists for `name`.
    pub async fn start_process(
        self: &Arc<Self>,
        name: &str,
        process_type: ProcessType,
        spec: LaunchSpec,
        policy: RestartPolicy,
    ) -> Result<ProcessRecord, SupervisorError> {
        if let Some(entry) = self.entries.get(name) {
            if !entry.record.state.is_terminal() {
                return Err(SupervisorError::AlreadyRunning(name.to_string()));
            }
        }

        let record = self.spawn(name, process_type, spec, policy, 0).await?;
        Ok(record)
    }

    async fn spawn(
        self: &Arc<Self>,
        name: &str,
        process_type: ProcessType,
        spec: LaunchSpec,
        policy: RestartPolicy,
        restart_attempts: u32,
    ) -> Result<ProcessRecord, SupervisorError> {
        let mut command = Command::new(&spec.command);
        command.args(&spec.args).envs(&spec.env).kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
        let pid = child.id();

        let id = Uuid::now_v7();
        let record = ProcessRecord {
            id,
            name: name.to_string(),
            process_type,
            state: ProcessState::Running,
            pid,
            started_at: Some(Utc::now()),
            restart_attempts,
        };

        self.entries.insert(
            name.to_string(),
            Entry {
                record: record.clone(),
                spec: spec.clone(),
                policy,
                child: Some(Arc::new(RwLock::new(child))),
            },
        );

        self.spawn_waiter(name.to_string());
        Ok(record)
    }

    /// Blocks on the child's exit and drives failure recovery. Recursion
    /// through `spawn` on auto-restart is why this returns `()` and runs
    /// detached rather than being awaited directly by callers.
    fn spawn_waiter(self: &Arc<Self>, name: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let child = match this.entries.get(&name) {
                Some(entry) => entry.child.clone(),
                None => return,
            };
            let Some(child) = child else { return };

            let status = {
                let mut guard = child.write().await;
                guard.wait().await
            };

            let was_stopping = this
                .entries
                .get(&name)
                .map(|e| e.record.state == ProcessState::Stopping)
                .unwrap_or(false);

            if was_stopping {
                if let Some(mut entry) = this.entries.get_mut(&name) {
                    entry.record.state = match status {
                        Ok(s) if s.success() => ProcessState::Stopped,
                        _ => ProcessState::Failed,
                    };
                }
                return;
            }

            let (attempts, max_attempts, auto_restart, backoff_base, process_type, spec) = {
                match this.entries.get_mut(&name) {
                    Some(mut entry) => {
                        entry.record.state = ProcessState::Failed;
                        (
                            entry.record.restart_attempts,
                            entry.policy.max_attempts,
                            entry.policy.auto_restart,
                            entry.policy.backoff_base,
                            entry.record.process_type,
                            entry.spec.clone(),
                        )
                    }
                    None => return,
                }
            };

            let error_message = match &status {
                Ok(s) => (!s.success()).then(|| format!("exited with status {s}")),
                Err(e) => Some(e.to_string()),
            };
            let _ = this
                .bus
                .publish(
                    topics::PROCESS_EXIT,
                    serde_json::json!({
                        "process_id": name,
                        "exit_time": Utc::now(),
                        "error": error_message,
                    }),
                )
                .await;

            if !auto_restart || attempts >= max_attempts {
                if auto_restart {
                    warn!(service = %name, attempts, "restart budget exhausted, giving up");
                }
                return;
            }

            let next_attempt = attempts + 1;
            let delay = restart_delay(backoff_base, next_attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = this.cancellation.cancelled() => return,
            }

            if this.cancellation.is_cancelled() {
                return;
            }

            let policy = RestartPolicy {
                auto_restart,
                max_attempts,
                backoff_base,
            };
            if let Err(e) = this
                .spawn(&name, process_type, spec, policy, next_attempt)
                .await
            {
                error!(service = %name, error = %e, "auto-restart failed to spawn replacement");
            }
        });
    }

    /// Transition `name` to `stopping`, signal it, and wait up to `grace`
    /// before escalating to an unconditional kill.
    pub async fn stop_process(&self, name: &str, grace: Duration) -> Result<(), SupervisorError> {
        let (child, pid) = {
            let mut entry = self
                .entries
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            if entry.record.state.is_terminal() {
                return Ok(());
            }
            entry.record.state = ProcessState::Stopping;
            (entry.child.clone(), entry.record.pid)
        };

        let Some(pid) = pid else { return Ok(()) };
        send_signal(pid, Signal::Term);

        if let Some(child) = child {
            let wait = async {
                let mut guard = child.write().await;
                guard.wait().await
            };
            if tokio::time::timeout(grace, wait).await.is_err() {
                warn!(service = %name, "graceful stop timed out, escalating to kill");
                send_signal(pid, Signal::Kill);
                let mut guard = child.write().await;
                let _ = guard.wait().await;
            }
        }

        Ok(())
    }

    /// Stop (tolerating not-running), discard the record, and start again
    /// with the original launch spec.
    pub async fn restart_process(
        self: &Arc<Self>,
        name: &str,
        grace: Duration,
    ) -> Result<ProcessRecord, SupervisorError> {
        let (process_type, spec, policy) = {
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            (entry.record.process_type, entry.spec.clone(), entry.policy)
        };

        let _ = self.stop_process(name, grace).await;
        self.entries.remove(name);
        self.spawn(name, process_type, spec, policy, 0).await
    }

    pub fn get_process(&self, name: &str) -> Option<ProcessRecord> {
        self.entries.get(name).map(|e| e.record.clone())
    }

    pub fn list_processes(&self) -> Vec<ProcessRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    pub fn get_processes_by_type(&self, process_type: ProcessType) -> Vec<ProcessRecord> {
        self.entries
            .iter()
            .filter(|e| e.record.process_type == process_type)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Cross-platform liveness check used both internally and by the
    /// Health Prober.
    pub fn is_alive(&self, name: &str) -> bool {
        match self.entries.get(name).and_then(|e| e.record.pid) {
            Some(pid) => pid_is_alive(pid),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_spec(seconds: u32) -> LaunchSpec {
        LaunchSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), format!("sleep {seconds}")],
            env: HashMap::new(),
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn start_process_reports_running_state_and_pid() {
        let bus = MessageBus::in_memory(16);
        let supervisor = ProcessSupervisor::new(bus, CancellationToken::new());

        let record = supervisor
            .start_process("unit-test", ProcessType::Monitor, sleep_spec(5), RestartPolicy::default())
            .await
            .unwrap();

        assert_eq!(record.state, ProcessState::Running);
        assert!(record.pid.is_some());
        assert!(supervisor.is_alive("unit-test"));

        supervisor
            .stop_process("unit-test", Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn starting_twice_without_stopping_fails() {
        let bus = MessageBus::in_memory(16);
        let supervisor = ProcessSupervisor::new(bus, CancellationToken::new());

        supervisor
            .start_process("dup", ProcessType::Trader, sleep_spec(5), RestartPolicy::default())
            .await
            .unwrap();

        let err = supervisor
            .start_process("dup", ProcessType::Trader, sleep_spec(5), RestartPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));

        supervisor.stop_process("dup", Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_then_start_yields_new_process_id() {
        let bus = MessageBus::in_memory(16);
        let supervisor = ProcessSupervisor::new(bus, CancellationToken::new());

        let first = supervisor
            .start_process("cycle", ProcessType::Monitor, sleep_spec(5), RestartPolicy::default())
            .await
            .unwrap();
        supervisor.stop_process("cycle", Duration::from_secs(2)).await.unwrap();

        let second = supervisor
            .start_process("cycle", ProcessType::Monitor, sleep_spec(5), RestartPolicy::default())
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.state, ProcessState::Running);
        supervisor.stop_process("cycle", Duration::from_secs(2)).await.unwrap();
    }

    #[test]
    fn restart_delay_matches_quadratic_backoff_scenario() {
        let base = Duration::from_secs(1);
        assert_eq!(restart_delay(base, 1), Duration::from_secs(1));
        assert_eq!(restart_delay(base, 2), Duration::from_secs(4));
        assert_eq!(restart_delay(base, 3), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn crash_triggers_auto_restart_with_incrementing_attempts() {
        let bus = MessageBus::in_memory(16);
        let supervisor = ProcessSupervisor::new(bus, CancellationToken::new());

        let policy = RestartPolicy {
            auto_restart: true,
            max_attempts: 2,
            backoff_base: Duration::from_millis(20),
        };
        supervisor
            .start_process("crashy", ProcessType::Optimizer, sleep_spec(0), policy)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let record = supervisor.get_process("crashy").unwrap();
        assert!(record.restart_attempts >= 1);
    }
}
