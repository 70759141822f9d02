//! Subprocess plumbing shared by the encoder and relay managers

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, warn};

/// Forward a child's output stream into the log, one line per event
pub fn forward_output<R>(label: String, stream: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                debug!(target: "nestcast::subprocess", "[{}] {}", label, line);
            }
        }
    });
}

/// Terminate a child and wait until the OS confirms exit.
///
/// SIGTERM first on Unix, then a forced kill once `grace` elapses.
/// Returns the exit code (`None` when killed by a signal).
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<Option<i32>> {
    if let Some(status) = child.try_wait()? {
        return Ok(status.code());
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we still own and have not reaped
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return Ok(status?.code());
            }
            warn!("pid {} ignored SIGTERM for {}ms, killing", pid, grace.as_millis());
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    child.start_kill()?;
    let status = child.wait().await?;
    debug!("child reaped after kill: {:?}", status);
    Ok(status.code())
}
