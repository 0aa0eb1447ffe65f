use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use crate::error::AgentError;
use crate::jail::PathJail;

/// Exit code conventionally reported for a timed-out command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, serde::Deserialize)]
pub struct ExecuteRequest {
    /// Argv form; the first element is the binary. No shell is involved.
    pub command: Vec<String>,
    /// Human-readable duration such as "30s" or "500ms". Defaults to 60s.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Merged over the agent's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
}

/// Spawn the command and wait for it, bounded by the request timeout.
///
/// Spawn failures and timeouts are reported in the response body, not as
/// transport errors: the caller always receives stdout/stderr/exit_code.
pub async fn run_command(
    jail: &PathJail,
    request: ExecuteRequest,
) -> Result<ExecuteResponse, AgentError> {
    let Some((binary, args)) = request.command.split_first() else {
        return Err(AgentError::BadRequest("command must not be empty".into()));
    };
    let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);

    let mut command = tokio::process::Command::new(binary);
    command
        .args(args)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &request.working_dir {
        command.current_dir(jail.resolve(dir)?);
    }

    let start_time = chrono::Utc::now();
    tracing::debug!(%binary, args = args.len(), ?timeout, "spawning command");

    let (stdout, stderr, exit_code) = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => (
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            output.status.code().unwrap_or(-1),
        ),
        // Spawn or wait failure: the error travels in stderr.
        Ok(Err(err)) => (String::new(), format!("command failed: {err}"), 1),
        // Dropping the output future kills the child.
        Err(_elapsed) => (
            String::new(),
            format!(
                "command timed out after {}",
                humantime::format_duration(timeout)
            ),
            TIMEOUT_EXIT_CODE,
        ),
    };

    let end_time = chrono::Utc::now();
    let duration = (end_time - start_time)
        .to_std()
        .unwrap_or(Duration::ZERO);

    Ok(ExecuteResponse {
        stdout,
        stderr,
        exit_code,
        duration: humantime::format_duration(duration).to_string(),
        start_time,
        end_time,
    })
}
