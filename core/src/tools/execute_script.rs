use crate::error::ToolError;
use crate::tools::{Sandbox, extract_string_arg, truncate_output};
use crate::traits::Tool;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

const MAX_OUTPUT_LEN: usize = 10_000;

/// Runs scripts from the scripts directory as child processes.
///
/// The only guarantees are path containment and the wall-clock timeout;
/// the script itself can do whatever the child process is allowed to do.
pub struct ExecuteScriptTool {
    sandbox: Sandbox,
    interpreter: Option<String>,
    timeout: Duration,
}

impl ExecuteScriptTool {
    pub fn new(sandbox: Sandbox, interpreter: Option<String>, timeout: Duration) -> Self {
        Self {
            sandbox,
            interpreter,
            timeout,
        }
    }

    fn command(&self, script: &std::path::Path) -> Command {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(script);
                c
            }
            None => Command::new(script),
        };
        command
            .current_dir(self.sandbox.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

/// The script's process group. Killing it also reaches anything the script
/// started in the background, which `kill_on_drop` alone would leave running.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    /// Called once the leader has been reaped; its id may be reused after that.
    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::error!("Failed to kill process group {}: {}", pgid, e),
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

fn format_output(stdout: &[u8], stderr: &[u8], exit_code: Option<i32>) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    let mut output = format!("STDOUT:\n{stdout}\n");
    if !stderr.is_empty() {
        output.push_str(&format!("STDERR:\n{stderr}"));
    }
    if exit_code != Some(0) {
        output.push_str(&format!("\nExit code: {}", exit_code.unwrap_or(-1)));
    }
    output
}

#[async_trait]
impl Tool for ExecuteScriptTool {
    fn name(&self) -> &str {
        "execute_script"
    }

    fn description(&self) -> &str {
        "Execute a script from the scripts directory and return its stdout and stderr"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "script_name": {
                    "type": "string",
                    "description": "Script file name as returned by list_scripts"
                }
            },
            "required": ["script_name"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let script_name = extract_string_arg(args, "script_name", self.name())?;
        let script = self.sandbox.resolve(script_name)?;

        if !script.is_file() {
            return Err(ToolError::invalid_arguments(
                self.name(),
                format!("'{script_name}' is not a file"),
            ));
        }

        tracing::info!("Executing script: {}", script.display());

        let mut child = self
            .command(&script)
            .spawn()
            .map_err(ToolError::ProcessSpawnFailure)?;
        // Declared after `child` so a cancelled call kills the group before
        // the leader is reaped.
        let mut group = ProcessGroup::of(&child);

        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));
        let abort_readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];

        let finished = tokio::time::timeout(self.timeout, async {
            let status = child.wait().await;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            (status, stdout, stderr)
        })
        .await;

        match finished {
            Ok((Ok(status), stdout, stderr)) => {
                group.disarm();
                let output = format_output(&stdout, &stderr, status.code());
                Ok(truncate_output(output, MAX_OUTPUT_LEN))
            }
            Ok((Err(source), _, _)) => Err(ToolError::Io {
                path: script,
                source,
            }),
            Err(_) => {
                tracing::warn!(
                    "Script {} exceeded {}s, killing it",
                    script.display(),
                    self.timeout.as_secs()
                );
                group.kill();
                if let Err(e) = child.kill().await {
                    tracing::error!("Failed to kill timed out script: {}", e);
                }
                for handle in abort_readers {
                    handle.abort();
                }
                Err(ToolError::Timeout(self.timeout))
            }
        }
    }
}
