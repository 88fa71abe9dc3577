use anyhow::Context as _;

use poolhand_core::job::JobConfiguration;
use poolhand_core::schemas::{FlowRun, WorkerResult};
use poolhand_engine::{Infrastructure, StartedToken};

/// Runs flow runs as local child processes.
///
/// The configuration command is split on whitespace and spawned with the
/// configured environment on top of the worker's own; the OS pid is the
/// infrastructure identifier.
pub struct ProcessInfrastructure;

#[async_trait::async_trait]
impl Infrastructure for ProcessInfrastructure {
    fn kind(&self) -> &str {
        "process"
    }

    async fn run(
        &self,
        flow_run: &FlowRun,
        configuration: JobConfiguration,
        started: &StartedToken,
    ) -> anyhow::Result<WorkerResult> {
        let command_line = configuration
            .command
            .clone()
            .context("job configuration has no command")?;
        let mut parts = command_line.split_whitespace();
        let program = parts.next().context("job configuration command is empty")?;

        let mut command = tokio::process::Command::new(program);
        command.args(parts);
        for (key, value) in configuration.env_vars() {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {command_line:?}"))?;
        let pid = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_default();
        tracing::info!(flow_run = %flow_run.id, pid = %pid, "started process for flow run");
        started.started(pid.clone());

        let status = child
            .wait()
            .await
            .context("failed waiting for flow run process")?;
        Ok(WorkerResult {
            identifier: pid,
            status_code: status.code().unwrap_or(-1),
        })
    }
}
