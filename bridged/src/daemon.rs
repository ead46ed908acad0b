//! The bridge daemon poll loop.
//!
//! One cycle: honor a shutdown signal, hold in quarantine past the error
//! threshold, refresh the heartbeat, drain new inbox messages, then claim
//! and execute at most one task. The loop itself never dies on a cycle
//! error; errors count toward the quarantine threshold instead.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use bridge_store::{
    roster, ChannelStore, Heartbeat, HeartbeatStatus, HeartbeatStore, InboxMessage, OutboxMessage,
    ShutdownSignal, StorePaths, TaskPatch, TaskRecord, TaskStatus, TaskStore,
};
use chrono::Utc;

use crate::config::BridgeConfig;
use crate::executor::{CliExecutor, ExecHandle, ExecRequest, Executor};
use crate::prompt;

/// Grace period between SIGTERM and SIGKILL during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Quarantined daemons poll the signal file at a slower cadence.
const QUARANTINE_SLEEP_MULTIPLIER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    Shutdown,
}

pub struct BridgeDaemon {
    config: BridgeConfig,
    paths: StorePaths,
    tasks: TaskStore,
    channels: ChannelStore,
    heartbeats: HeartbeatStore,
    executor: Arc<dyn Executor>,
    consecutive_errors: u32,
    idle_notified: bool,
    quarantine_notified: bool,
    active: Option<ExecHandle>,
}

impl BridgeDaemon {
    pub fn new(config: BridgeConfig) -> Self {
        let executor: Arc<dyn Executor> = Arc::new(CliExecutor::new(config.executor));
        Self::with_executor(config, executor)
    }

    /// Construct with a custom executor. Tests use this to stub out the
    /// CLI subprocess.
    pub fn with_executor(config: BridgeConfig, executor: Arc<dyn Executor>) -> Self {
        let paths = StorePaths::new(config.state_root());
        Self {
            tasks: TaskStore::new(paths.clone()),
            channels: ChannelStore::new(paths.clone()),
            heartbeats: HeartbeatStore::new(&config.working_directory),
            paths,
            config,
            executor,
            consecutive_errors: 0,
            idle_notified: false,
            quarantine_notified: false,
            active: None,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            team = %self.config.team_name,
            worker = %self.config.worker_name,
            executor = self.config.executor.as_str(),
            "bridge daemon starting"
        );
        loop {
            match self.cycle().await {
                Ok(CycleOutcome::Shutdown) => break,
                Ok(CycleOutcome::Continue) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "poll cycle error");
                    self.consecutive_errors += 1;
                    sleep(self.config.poll_interval()).await;
                }
            }
        }
        info!("bridge daemon stopped");
        Ok(())
    }

    /// One poll cycle. Public so tests can drive the state machine
    /// without the surrounding sleep loop.
    pub async fn cycle(&mut self) -> Result<CycleOutcome> {
        let team = self.config.team_name.clone();
        let worker = self.config.worker_name.clone();

        if let Some(signal) = self.channels.check_shutdown(&team, &worker) {
            self.shutdown(signal).await?;
            return Ok(CycleOutcome::Shutdown);
        }

        if self.consecutive_errors >= self.config.max_consecutive_errors {
            if !self.quarantine_notified {
                self.append_outbox(&OutboxMessage::error(format!(
                    "Self-quarantined after {} consecutive errors. Awaiting lead intervention or shutdown.",
                    self.consecutive_errors
                )))?;
                self.quarantine_notified = true;
                warn!(
                    errors = self.consecutive_errors,
                    "entering quarantine, no further tasks will be claimed"
                );
            }
            self.write_heartbeat(HeartbeatStatus::Quarantined, None)?;
            sleep(self.config.poll_interval() * QUARANTINE_SLEEP_MULTIPLIER).await;
            return Ok(CycleOutcome::Continue);
        }

        self.write_heartbeat(HeartbeatStatus::Polling, None)?;
        let messages = self.channels.read_new_inbox(&team, &worker)?;
        for message in &messages {
            debug!(kind = %message.kind, "inbox message received");
        }

        if let Some(task) = self.tasks.find_next(&team, &worker) {
            self.idle_notified = false;
            self.tasks
                .update(&team, &task.id, TaskPatch::status(TaskStatus::InProgress))?;
            self.write_heartbeat(HeartbeatStatus::Executing, Some(task.id.clone()))?;
            if self.execute_claimed(&task, &messages).await? == CycleOutcome::Shutdown {
                return Ok(CycleOutcome::Shutdown);
            }
        } else if !self.idle_notified {
            self.append_outbox(&OutboxMessage::idle(
                "All assigned tasks complete. Standing by.",
            ))?;
            self.idle_notified = true;
        }

        if let Err(err) = self
            .channels
            .rotate_outbox(&team, &worker, self.config.outbox_max_lines)
        {
            warn!(%err, "outbox rotation failed");
        }

        sleep(self.config.poll_interval()).await;
        Ok(CycleOutcome::Continue)
    }

    /// Run one already-claimed task through the executor and publish the
    /// outcome. The task is `in_progress` on entry; it leaves as
    /// `completed`, or reverts to `pending` on failure or on a shutdown
    /// that raced the claim.
    pub async fn execute_claimed(
        &mut self,
        task: &TaskRecord,
        messages: &[InboxMessage],
    ) -> Result<CycleOutcome> {
        let team = self.config.team_name.clone();
        let worker = self.config.worker_name.clone();

        // A shutdown request that landed between the eligibility scan and
        // this point wins over the claim; the task goes back to the pool.
        if let Some(signal) = self.channels.check_shutdown(&team, &worker) {
            self.tasks
                .update(&team, &task.id, TaskPatch::status(TaskStatus::Pending))?;
            self.shutdown(signal).await?;
            return Ok(CycleOutcome::Shutdown);
        }

        let prompt = prompt::build_task_prompt(task, messages, &self.config);
        let prompt_file = prompt::write_prompt_file(&self.config, &task.id, &prompt)?;
        info!(
            task_id = %task.id,
            subject = %task.subject,
            prompt_file = %prompt_file.display(),
            "executing task"
        );

        let request = ExecRequest {
            prompt,
            model: self.config.model.clone(),
            working_dir: self.config.working_directory.clone(),
            timeout: self.config.task_timeout(),
        };

        let executor = Arc::clone(&self.executor);
        let response = match executor.start(request).await {
            Ok(execution) => {
                self.active = Some(execution.handle);
                let joined = execution.result.await;
                self.active = None;
                match joined {
                    Ok(outcome) => outcome,
                    Err(err) => Err(anyhow!("executor task panicked: {err}")),
                }
            }
            Err(err) => Err(err),
        };

        // Persistence after a successful run is part of the attempt: if
        // the audit write or the completed-status update fails, the task
        // must still revert to pending instead of sticking in_progress.
        match response.and_then(|output| self.publish_success(&team, &task.id, &output)) {
            Ok(()) => {}
            Err(err) => {
                self.consecutive_errors += 1;
                let message = format!("{err:#}");
                self.tasks.record_failure(&team, &task.id, &message)?;
                self.tasks
                    .update(&team, &task.id, TaskPatch::status(TaskStatus::Pending))?;
                let attempt = self
                    .tasks
                    .read_failure(&team, &task.id)
                    .map(|sidecar| sidecar.retry_count)
                    .unwrap_or(1);
                self.append_outbox(&OutboxMessage::task_failed(
                    &task.id,
                    format!("{message} (attempt {attempt})"),
                ))?;
                warn!(task_id = %task.id, error = %message, attempt, "task failed");
            }
        }

        Ok(CycleOutcome::Continue)
    }

    /// Persist and report a successful execution: output audit file,
    /// completed status, outbox entry. Any error here means the attempt
    /// did not land and the caller treats it as a task failure.
    fn publish_success(&mut self, team: &str, task_id: &str, output: &str) -> Result<()> {
        let output_file = prompt::output_file(&self.config, task_id)?;
        fs::write(&output_file, output)
            .with_context(|| format!("failed to write output file '{}'", output_file.display()))?;
        self.tasks
            .update(team, task_id, TaskPatch::status(TaskStatus::Completed))?;
        self.consecutive_errors = 0;
        let summary = prompt::read_output_summary(&output_file);
        self.append_outbox(&OutboxMessage::task_complete(task_id, summary))?;
        info!(task_id, "task completed");
        Ok(())
    }

    /// Orderly shutdown: stop any in-flight executor, acknowledge the
    /// request, then remove this worker's traces from the shared tree.
    /// Cleanup steps past the ack are best-effort.
    pub async fn shutdown(&mut self, signal: ShutdownSignal) -> Result<()> {
        let team = self.config.team_name.clone();
        let worker = self.config.worker_name.clone();
        info!(
            request_id = %signal.request_id,
            reason = %signal.reason,
            "shutdown signal received"
        );

        if let Some(handle) = self.active.take() {
            handle.terminate();
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while handle.is_alive() && Instant::now() < deadline {
                sleep(Duration::from_millis(100)).await;
            }
            if handle.is_alive() {
                warn!("executor ignored SIGTERM, force-killing");
                handle.force_kill();
            }
        }

        self.append_outbox(&OutboxMessage::shutdown_ack(&signal.request_id))?;

        if let Err(err) =
            roster::unregister_worker(&self.paths, &self.config.working_directory, &team, &worker)
        {
            warn!(%err, "roster unregister failed");
        }
        self.channels.delete_shutdown(&team, &worker);
        self.heartbeats.delete(&team, &worker);
        self.kill_host_session().await;

        info!("shutdown complete");
        Ok(())
    }

    /// Kill the tmux session hosting this daemon, if one was configured.
    /// The daemon loop has already decided to exit by the time this runs.
    async fn kill_host_session(&self) {
        let Some(session) = self.config.session_name.as_deref() else {
            return;
        };
        match tokio::process::Command::new("tmux")
            .args(["kill-session", "-t", session])
            .output()
            .await
        {
            Ok(output) if !output.status.success() => {
                debug!(session, "tmux kill-session reported failure");
            }
            Err(err) => debug!(session, %err, "tmux unavailable"),
            _ => {}
        }
    }

    fn write_heartbeat(&self, status: HeartbeatStatus, current_task_id: Option<String>) -> Result<()> {
        self.heartbeats.write(&Heartbeat {
            worker_name: self.config.worker_name.clone(),
            team_name: self.config.team_name.clone(),
            executor: self.config.executor.as_str().to_string(),
            pid: std::process::id(),
            last_poll_at: Utc::now(),
            current_task_id,
            consecutive_errors: self.consecutive_errors,
            status,
        })
    }

    fn append_outbox(&self, message: &OutboxMessage) -> Result<()> {
        self.channels
            .append_outbox(&self.config.team_name, &self.config.worker_name, message)
    }
}
