//! Browser backend bridged to an external automation process.
//!
//! Each session is one child process speaking line-delimited JSON:
//!
//! ```text
//! -> {"id":3,"op":{"op":"click","target":{"by":"css","value":"#go"}}}
//! <- {"id":3,"ok":true,"output":{}}
//! <- {"id":4,"ok":false,"error":{"kind":"element_not_found","message":"..."}}
//! ```
//!
//! Responses carry the request id so that the answer to an operation the
//! engine stopped waiting for (timeout, cancellation) is recognised and
//! skipped when it arrives late.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::driver::{Browser, BrowserError, BrowserLauncher, BrowserOp, OpOutput};

/// How long a session gets to exit after its input is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    op: &'a BrowserOp,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct Response {
    id: u64,
    ok: bool,
    #[serde(default)]
    output: OpOutput,
    #[serde(default)]
    error: Option<ErrorBody>,
}

/// Launches sessions by spawning `program args...`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Result<Self, BrowserError> {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(BrowserError::Launch("browser command cannot be empty".into()));
        }
        Ok(Self { program, args })
    }

    /// Splits a whitespace-separated command line into program and args.
    pub fn from_command_line(line: &str) -> Result<Self, BrowserError> {
        let mut parts = line.split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_default();
        Self::new(program, parts.collect())
    }
}

#[async_trait]
impl BrowserLauncher for CommandLauncher {
    async fn launch(&self) -> Result<Box<dyn Browser>, BrowserError> {
        let mut child = Command::new(self.program.trim())
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BrowserError::Launch(format!("failed to start '{}': {}", self.program, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrowserError::Launch("browser process has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrowserError::Launch("browser process has no stdout".into()))?;

        let id = match child.id() {
            Some(pid) => format!("cmd-{}", pid),
            None => format!("cmd-{}", uuid::Uuid::new_v4().simple()),
        };

        Ok(Box::new(CommandBrowser {
            id,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            next_request: 0,
        }))
    }
}

/// A session backed by one child process.
pub struct CommandBrowser {
    id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_request: u64,
}

impl CommandBrowser {
    async fn send(&mut self, request: &Request<'_>) -> Result<(), BrowserError> {
        let stdin = self.stdin.as_mut().ok_or(BrowserError::Closed)?;
        let mut line = serde_json::to_string(request)
            .map_err(|e| BrowserError::Protocol(format!("failed to encode request: {}", e)))?;
        line.push('\n');

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BrowserError::Protocol(format!("browser process write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| BrowserError::Protocol(format!("browser process write failed: {}", e)))
    }

    async fn receive(&mut self, request_id: u64) -> Result<OpOutput, BrowserError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| BrowserError::Protocol(format!("browser process read failed: {}", e)))?
                .ok_or(BrowserError::Closed)?;

            if line.trim().is_empty() {
                continue;
            }

            let response: Response = serde_json::from_str(&line).map_err(|e| {
                BrowserError::Protocol(format!("unreadable browser response '{}': {}", line, e))
            })?;

            if response.id < request_id {
                debug!("[{}] skipping stale response {}", self.id, response.id);
                continue;
            }

            if response.ok {
                return Ok(response.output);
            }
            let body = response.error.unwrap_or(ErrorBody {
                kind: String::new(),
                message: "browser reported failure without details".into(),
            });
            return Err(BrowserError::from_kind(&body.kind, body.message));
        }
    }
}

#[async_trait]
impl Browser for CommandBrowser {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn perform(&mut self, op: &BrowserOp) -> Result<OpOutput, BrowserError> {
        self.next_request += 1;
        let request = Request {
            id: self.next_request,
            op,
        };
        debug!("[{}] -> {}", self.id, op);

        self.send(&request).await?;
        self.receive(request.id).await
    }

    async fn close(&mut self) {
        // Closing stdin asks the process to exit.
        drop(self.stdin.take());

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!("[{}] exited with {}", self.id, status),
            Ok(Err(e)) => warn!("[{}] wait failed: {}", self.id, e),
            Err(_) => {
                warn!("[{}] did not exit in time, killing", self.id);
                if let Err(e) = self.child.kill().await {
                    warn!("[{}] kill failed: {}", self.id, e);
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::browser::Target;
    use tempfile::tempdir;

    const MOCK_DRIVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  case "$line" in
    *'"op":"navigate"'*) printf '{"id":%s,"ok":true,"output":{"url":"https://example.com/home"}}\n' "$id" ;;
    *'"op":"click"'*) printf '{"id":%s,"ok":false,"error":{"kind":"element_not_found","message":"no such element"}}\n' "$id" ;;
    *) printf '{"id":%s,"ok":true}\n' "$id" ;;
  esac
done
"#;

    async fn mock_browser() -> (tempfile::TempDir, Box<dyn Browser>) {
        let dir = tempdir().unwrap();
        let script = dir.path().join("driver.sh");
        std::fs::write(&script, MOCK_DRIVER).unwrap();

        let launcher =
            CommandLauncher::new("sh", vec![script.to_string_lossy().into_owned()]).unwrap();
        let browser = launcher.launch().await.unwrap();
        (dir, browser)
    }

    #[test]
    fn test_rejects_empty_command() {
        assert!(CommandLauncher::from_command_line("   ").is_err());
        assert!(CommandLauncher::from_command_line("node driver.js --headless").is_ok());
    }

    #[tokio::test]
    async fn test_round_trip_with_process() {
        let (_dir, mut browser) = mock_browser().await;

        let out = browser
            .perform(&BrowserOp::Navigate { url: "https://example.com".into() })
            .await
            .unwrap();
        assert_eq!(out.url.as_deref(), Some("https://example.com/home"));

        let err = browser
            .perform(&BrowserOp::Click { target: Target::Css("#missing".into()) })
            .await
            .unwrap_err();
        assert_eq!(err, BrowserError::ElementNotFound("no such element".into()));

        browser.close().await;
    }

    #[tokio::test]
    async fn test_missing_program_fails_launch() {
        let launcher = CommandLauncher::new("/definitely/not/a/browser", Vec::new()).unwrap();
        assert!(matches!(launcher.launch().await, Err(BrowserError::Launch(_))));
    }
}
