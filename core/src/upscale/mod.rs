//! External upscaler driver.
//!
//! Upscaling is delegated to a user-configured executable. One driver task
//! owns the subprocess: jobs arrive on a rendezvous channel (the manager's
//! send arm doubles as its scheduling point), run strictly one at a time,
//! and resolve the page's upscale outcome with the process's exit status.
//! Shutdown kills the in-flight child.

use std::fmt;
use std::path::PathBuf;

use tokio::process::Command;
use tracing::{debug, error, info};

use crate::events::{self, Outcome};
use crate::types::ImageDimensions;

/// One upscale request: read `input`, write `output` at roughly `target`.
pub struct UpscaleJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub target: ImageDimensions,
    pub resolver: Outcome,
}

impl fmt::Debug for UpscaleJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[u:{} -> {}]", self.input.display(), self.output.display())
    }
}

/// Spawns the driver task. Dropping every sender ends it; so does shutdown.
pub fn spawn_upscaler(
    upscaler: PathBuf,
    jobs: flume::Receiver<UpscaleJob>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = events::shutdown_waiter();
        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                job = jobs.recv_async() => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            debug!("upscaling {job:?}");
            let success = run_one(&upscaler, &job).await;
            job.resolver.resolve(success);
        }
        debug!("upscaler driver exited");
    })
}

async fn run_one(upscaler: &PathBuf, job: &UpscaleJob) -> bool {
    let mut shutdown = events::shutdown_waiter();

    let mut command = Command::new(upscaler);
    command
        .arg(&job.input)
        .arg(&job.output)
        .env("AWMAN_TARGET_RESOLUTION", job.target.to_string())
        .kill_on_drop(true);

    let output = tokio::select! {
        biased;
        // Dropping the in-flight future kills the child.
        _ = shutdown.wait() => return false,
        output = command.output() => output,
    };

    match output {
        Ok(output) if output.status.success() => {
            if !output.stdout.is_empty() {
                info!("upscaler output: {}", String::from_utf8_lossy(&output.stdout).trim());
            }
            true
        }
        Ok(output) => {
            error!(
                "upscaler exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(err) => {
            error!("failed to run upscaler {}: {err}", upscaler.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn runs_jobs_one_at_a_time() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-upscaler.sh");
        std::fs::write(&script, "#!/bin/sh\ncp \"$1\" \"$2\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("in.png");
        std::fs::write(&input, b"pixels").unwrap();

        let (tx, rx) = flume::bounded(0);
        let driver = spawn_upscaler(script, rx);

        for i in 0..2 {
            let output = dir.path().join(format!("out{i}.png"));
            let (resolver, mut waiter) = events::outcome();
            let job = UpscaleJob {
                input: input.clone(),
                output: output.clone(),
                target: ImageDimensions::new(64, 64),
                resolver,
            };
            tx.send_async(job).await.unwrap();
            assert!(waiter.wait().await);
            assert!(output.exists());
        }

        drop(tx);
        driver.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn failing_upscaler_resolves_false() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("broken-upscaler.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, rx) = flume::bounded(0);
        let driver = spawn_upscaler(script, rx);

        let (resolver, mut waiter) = events::outcome();
        let job = UpscaleJob {
            input: dir.path().join("missing.png"),
            output: dir.path().join("out.png"),
            target: ImageDimensions::new(32, 32),
            resolver,
        };
        tx.send_async(job).await.unwrap();
        assert!(!waiter.wait().await);

        drop(tx);
        driver.await.unwrap();
    }
}
