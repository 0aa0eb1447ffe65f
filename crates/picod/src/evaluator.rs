//! The code-execution kernel behind `/api/run_code`.
//!
//! One long-lived interpreter process is started at agent boot and speaks
//! a line-delimited JSON protocol on stdin/stdout: each request line is
//! either `{"code": …}` or `{"reset": true}`, and every line is answered
//! with exactly one response line. The kernel soft-resets user bindings
//! after each execution so state cannot leak between callers; imported
//! modules and installed packages persist.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, serde::Serialize)]
struct KernelRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset: Option<bool>,
}

#[derive(Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// "ok" for a completed execution, "error" when the code raised;
    /// either way the transport call succeeds.
    pub status: String,
    pub execution_count: u64,
}

#[async_trait::async_trait]
pub trait Evaluator: Send + Sync {
    async fn execute_code(&self, src: &str) -> anyhow::Result<ExecutionResult>;
    async fn shutdown(&self);
}

struct Kernel {
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

impl Kernel {
    async fn round_trip(&mut self, request: &KernelRequest<'_>) -> anyhow::Result<String> {
        let mut line = serde_json::to_string(request).context("encoding kernel request")?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .context("writing to kernel stdin")?;

        let mut response = String::new();
        let n = self
            .stdout
            .read_line(&mut response)
            .await
            .context("reading kernel response")?;
        if n == 0 {
            anyhow::bail!("kernel closed its stdout");
        }
        Ok(response)
    }
}

/// Drives the single kernel process. Callers serialize on the kernel
/// mutex: at most one execution is in flight, and shutdown drains the
/// in-flight call before terminating the process.
pub struct KernelEvaluator {
    kernel: tokio::sync::Mutex<Option<Kernel>>,
}

impl KernelEvaluator {
    /// Spawn the kernel process. Failure here is fatal to the agent.
    pub fn start(argv: &[String]) -> anyhow::Result<Self> {
        let (binary, args) = argv
            .split_first()
            .context("evaluator kernel command is empty")?;

        tracing::info!(%binary, "starting evaluator kernel");
        let mut child = tokio::process::Command::new(binary)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning evaluator kernel {binary:?}"))?;

        let stdin = child.stdin.take().expect("kernel stdin is piped");
        let stdout = BufReader::new(child.stdout.take().expect("kernel stdout is piped"));

        Ok(Self {
            kernel: tokio::sync::Mutex::new(Some(Kernel {
                child,
                stdin,
                stdout,
            })),
        })
    }
}

#[async_trait::async_trait]
impl Evaluator for KernelEvaluator {
    /// Blocks the caller until the kernel reports completion; there is no
    /// caller-supplied timeout.
    async fn execute_code(&self, src: &str) -> anyhow::Result<ExecutionResult> {
        let mut guard = self.kernel.lock().await;
        let kernel = guard.as_mut().context("evaluator kernel is shut down")?;

        let response = kernel
            .round_trip(&KernelRequest {
                code: Some(src),
                reset: None,
            })
            .await?;
        let result: ExecutionResult =
            serde_json::from_str(response.trim()).context("decoding kernel response")?;

        // Soft-reset user bindings before releasing the kernel to the
        // next caller.
        let ack = kernel
            .round_trip(&KernelRequest {
                code: None,
                reset: Some(true),
            })
            .await?;
        match serde_json::from_str::<serde_json::Value>(ack.trim()) {
            Ok(value) if value["status"] == "reset" => (),
            other => tracing::warn!(?other, "kernel returned an unexpected reset ack"),
        }

        Ok(result)
    }

    /// Waits for any in-flight execution, then terminates the kernel.
    async fn shutdown(&self) {
        let mut guard = self.kernel.lock().await;
        if let Some(mut kernel) = guard.take() {
            // Closing stdin asks the kernel to exit; kill if it lingers.
            drop(kernel.stdin);
            match tokio::time::timeout(std::time::Duration::from_secs(5), kernel.child.wait())
                .await
            {
                Ok(Ok(status)) => tracing::info!(?status, "evaluator kernel exited"),
                Ok(Err(err)) => tracing::warn!(%err, "waiting for evaluator kernel failed"),
                Err(_elapsed) => {
                    tracing::warn!("evaluator kernel did not exit, killing it");
                    let _ = kernel.child.kill().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A stand-in kernel: answers every code line with a fixed result and
    /// every reset with an ack, like the real interpreter protocol.
    fn fake_kernel() -> Vec<String> {
        let script = r#"while read line; do
            case "$line" in
            *reset*) printf '%s\n' '{"status":"reset"}';;
            *) printf '%s\n' '{"stdout":"hello\n","stderr":"","status":"ok","execution_count":1}';;
            esac
        done"#;
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_execute_and_reset_round_trip() {
        let evaluator = KernelEvaluator::start(&fake_kernel()).unwrap();

        let result = evaluator.execute_code("print('hello')").await.unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.status, "ok");
        assert_eq!(result.execution_count, 1);

        // The kernel survived the reset and serves the next call.
        let result = evaluator.execute_code("print('hello')").await.unwrap();
        assert_eq!(result.status, "ok");

        evaluator.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_serialize_on_the_kernel() {
        let evaluator = std::sync::Arc::new(KernelEvaluator::start(&fake_kernel()).unwrap());

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let evaluator = evaluator.clone();
                tokio::spawn(async move { evaluator.execute_code("x = 1").await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().status, "ok");
        }

        evaluator.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_errors() {
        let evaluator = KernelEvaluator::start(&fake_kernel()).unwrap();
        evaluator.shutdown().await;
        assert!(evaluator.execute_code("x").await.is_err());
    }

    #[tokio::test]
    async fn test_start_failure_is_fatal() {
        assert!(KernelEvaluator::start(&["/does/not/exist".to_string()]).is_err());
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(KernelEvaluator::start(&[]).is_err());
    }
}
