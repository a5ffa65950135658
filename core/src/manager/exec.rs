//! Helper execution and socket request handling.
//!
//! Both surfaces share the environment-variable snapshot of the viewer
//! state. Helpers must not delete `AWMAN_CURRENT_FILE`; it stays owned by
//! the page that wrote it.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{error, info};

use crate::types::{Command, Executable};

use super::Manager;

/// Cap on reading a socket request; the manager blocks on this read.
const SOCKET_READ_DEADLINE: Duration = Duration::from_millis(50);

impl Manager {
    /// The state snapshot exposed to helpers and the `status` request.
    pub(super) fn state_env_vars(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let archive = &self.archives[self.current.a];

        env.insert("AWMAN_ARCHIVE".to_string(), archive.path().to_string_lossy().into_owned());
        env.insert("AWMAN_ARCHIVE_TYPE".to_string(), archive.kind().env_name().to_string());
        env.insert("AWMAN_PID".to_string(), std::process::id().to_string());
        env.insert("AWMAN_MANGA_MODE".to_string(), self.modes.manga.to_string());
        env.insert("AWMAN_UPSCALING_ENABLED".to_string(), self.modes.upscaling.to_string());

        if let Some(page) = self.page(self.current) {
            env.insert(
                "AWMAN_RELATIVE_FILE_PATH".to_string(),
                page.in_archive_path().to_string(),
            );
            env.insert("AWMAN_PAGE_NUMBER".to_string(), (self.current.p + 1).to_string());
            if let Some(file) = page.extracted_file() {
                env.insert("AWMAN_CURRENT_FILE".to_string(), file.to_string_lossy().into_owned());
            }
        }

        env
    }

    /// Fire and forget; a helper still running at exit is not our problem.
    pub(super) fn run_executable(&self, exe: Executable) {
        let env = self.state_env_vars();
        tokio::spawn(async move {
            let result = tokio::process::Command::new(&exe.path).envs(&env).output().await;

            let reply = match result {
                Ok(output) if output.status.success() => {
                    if !output.stdout.is_empty() {
                        info!(
                            "ran {} with output: {}",
                            exe.path,
                            String::from_utf8_lossy(&output.stdout).trim()
                        );
                    }
                    Ok(())
                }
                Ok(output) => {
                    let msg = format!("{} exited with {}", exe.path, output.status);
                    error!("{msg}: {}", String::from_utf8_lossy(&output.stderr).trim());
                    Err(msg)
                }
                Err(err) => {
                    let msg = format!("failed to run {}: {err}", exe.path);
                    error!("{msg}");
                    Err(msg)
                }
            };

            if let Some(responder) = exe.responder {
                let _ = responder.send(reply);
            }
        });
    }

    /// Reads one request under the socket deadline and answers it. Replies
    /// are JSON: the env map for `status`, `"done"` or an error string for
    /// actions.
    pub(super) async fn handle_conn(&mut self, mut stream: UnixStream) {
        let mut buf = vec![0u8; 256];
        let read = tokio::time::timeout(SOCKET_READ_DEADLINE, stream.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                error!("socket error: {err}");
                return;
            }
            Err(_) => {
                error!("socket request not readable within the deadline");
                return;
            }
        };

        let request = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        let reply = if request == "status" {
            serde_json::to_string(&self.state_env_vars())
                .unwrap_or_else(|err| format!("\"status serialization failed: {err}\""))
        } else if let Some(command) = Command::parse_action(&request) {
            match self.dispatch_command(command) {
                Ok(()) => "\"done\"".to_string(),
                Err(msg) => serde_json::to_string(&msg).unwrap_or_else(|_| "\"error\"".to_string()),
            }
        } else {
            "\"Unknown request.\"".to_string()
        };

        // Writing can block on a slow client; never in the selector.
        tokio::spawn(async move {
            if let Err(err) = stream.write_all(reply.as_bytes()).await {
                error!("socket error: {err}");
            }
        });
    }
}
