//! Helpers for running checked commands inside a task container

use container_runtime::{redact_tokens, ContainerRuntime, ExecOutput, ExecRequest};
use tracing::debug;

use crate::error::{ExecutorError, Result};

/// Longest command output carried into an error
const MAX_ERROR_OUTPUT: usize = 2000;

/// Keep the tail of long output; failures are usually at the end
pub(crate) fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max).collect();
    format!("…{}", kept)
}

/// Error for a command that exited non-zero
pub(crate) fn failure(step: &str, output: &ExecOutput) -> ExecutorError {
    ExecutorError::process_failed(
        step,
        output.exit_code,
        redact_tokens(&tail(output.error_text(), MAX_ERROR_OUTPUT)),
    )
}

/// Run a command and turn a non-zero exit into [`ExecutorError::ProcessFailed`]
pub(crate) async fn run_step(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    request: &ExecRequest,
    step: &str,
) -> Result<ExecOutput> {
    debug!("[{}] {}", step, redact_tokens(&request.command));
    let output = runtime.execute(container_id, request).await?;
    if !output.success() {
        return Err(failure(step, &output));
    }
    Ok(output)
}
