//! Child process helpers

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, TorProxyError};
use crate::supervisor::task::stop_requested;

/// Spawn `program`; output is inherited only when `verbose`
pub fn spawn_child(program: &Path, args: &[String], verbose: bool) -> Result<Child> {
    let (stdout, stderr) = if verbose {
        (Stdio::inherit(), Stdio::inherit())
    } else {
        (Stdio::null(), Stdio::null())
    };

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TorProxyError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    info!(
        program = %program.display(),
        pid = child.id().unwrap_or_default(),
        "Spawned process"
    );
    Ok(child)
}

/// Wait for `child` to exit or for a stop request
///
/// A non-zero exit is an error. On stop the child is killed and reaped.
pub async fn supervise_child(
    mut child: Child,
    name: &'static str,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop_requested(&mut stop) => None,
    };

    match exited {
        Some(Ok(status)) if status.success() => {
            info!(process = name, "Process exited");
            Ok(())
        }
        Some(Ok(status)) => {
            warn!(process = name, %status, "Process exited with failure");
            Err(TorProxyError::ProcessExited(status))
        }
        Some(Err(e)) => Err(TorProxyError::Io(e)),
        None => {
            debug!(process = name, "Killing process");
            if let Err(e) = child.kill().await {
                warn!(process = name, "Failed to kill process: {}", e);
            }
            Ok(())
        }
    }
}
