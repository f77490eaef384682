use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Default wall-clock limit for one re-mux invocation: 15 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

/// Settings for the external re-muxing tool.
///
/// The program is configurable so tests can substitute a stand-in; the
/// argument contract is fixed.
#[derive(Debug, Clone)]
pub struct RemuxSettings {
    /// Re-muxing executable, resolved on the search path.
    pub program: PathBuf,
    /// Maximum wall-clock time for one invocation; the child is killed on
    /// expiry.
    pub timeout: Duration,
}

impl Default for RemuxSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },

    #[error("{program} timed out after {timeout:?} and was killed")]
    Timeout { program: String, timeout: Duration },

    #[error("i/o error waiting for {program}: {source}")]
    Wait { program: String, source: io::Error },
}

/// Re-mux `input` into `output` with a fast-start layout.
///
/// Streams are copied, metadata is taken from the input, and the container
/// index is moved ahead of the sample data so playback can start before the
/// file is fully downloaded. The child's stdout and stderr are forwarded to
/// the console line-by-line as they arrive, so long transforms stay visible.
///
/// No partial output is trusted after a timeout; the caller removes the
/// output path on any error.
pub async fn remux(
    settings: &RemuxSettings,
    input: &Path,
    output: &Path,
) -> Result<(), TransformError> {
    let program = settings.program.display().to_string();

    let mut cmd = Command::new(&settings.program);
    cmd.arg("-i")
        .arg(input)
        .args([
            "-c",
            "copy",
            "-map_metadata",
            "0",
            "-movflags",
            "+faststart",
            "-fflags",
            "+genpts+igndts",
            "-v",
            "info",
            "-progress",
            "pipe:1",
            "-y",
            "-nostdin",
        ])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running {} -i {} ... {}", program, input.display(), output.display());

    let mut child = cmd.spawn().map_err(|source| TransformError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Drain both pipes concurrently with the timed wait; a blocked pipe must
    // never be what stalls the child into the timeout.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = tokio::spawn(forward_lines(stdout));
    let err_task = tokio::spawn(forward_lines(stderr));

    let status = match tokio::time::timeout(settings.timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            return Err(TransformError::Wait { program, source });
        }
        Err(_elapsed) => {
            let _ = child.kill().await;
            return Err(TransformError::Timeout {
                program,
                timeout: settings.timeout,
            });
        }
    };

    let _ = out_task.await;
    let _ = err_task.await;

    if !status.success() {
        return Err(TransformError::Failed { program, status });
    }

    Ok(())
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: Option<R>) {
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        println!("{line}");
    }
}
