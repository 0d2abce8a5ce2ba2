use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::InterpreterConfig;

/// Ask the interpreter for its version with a bounded wait.
///
/// Returns `None` when the binary is missing, exits non-zero, or does not
/// answer within `wait`. A hung interpreter is killed on timeout.
pub async fn probe_interpreter(config: &InterpreterConfig, wait: Duration) -> Option<String> {
    let child = Command::new(&config.program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(program = %config.program, "interpreter probe failed to spawn: {}", e);
            return None;
        }
    };

    let output = match tokio::time::timeout(wait, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::debug!(program = %config.program, "interpreter probe failed: {}", e);
            return None;
        }
        Err(_) => {
            tracing::warn!(program = %config.program, ?wait, "interpreter probe timed out");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }

    // Older interpreters print the version on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let version = if stdout.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };
    Some(version.to_string())
}
