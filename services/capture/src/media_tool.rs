//! External media tool used to record, stitch and sample video.
//!
//! The pipeline only needs three operations, so everything goes through the
//! narrow [`MediaTool`] trait. [`Ffmpeg`] is the production implementation;
//! every process it launches runs under a watchdog and is killed when it
//! exceeds its expected duration plus a grace period.

use crate::config::StreamConfig;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Longest stderr tail kept in errors.
const STDERR_TAIL_BYTES: usize = 2048;

/// Errors returned by media tool invocations.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{program} ran longer than {limit:?} and was killed")]
    TimedOut { program: String, limit: Duration },

    #[error("no input segments to concatenate")]
    EmptyInput,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Record, concatenate and thumbnail operations on video files.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Record `duration` of `source` into `output`.
    async fn record_segment(
        &self,
        source: &str,
        duration: Duration,
        output: &Path,
    ) -> Result<(), MediaError>;

    /// Losslessly join `inputs`, in order, into `output`.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MediaError>;

    /// Write a single JPEG frame taken `offset` into `clip` to `output`.
    async fn thumbnail(&self, clip: &Path, offset: Duration, output: &Path)
        -> Result<(), MediaError>;
}

/// `ffmpeg` process wrapper.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: String,
    transport: String,
    grace: Duration,
}

impl Ffmpeg {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            binary: config.ffmpeg_path.clone(),
            transport: config.transport.clone(),
            grace: config.watchdog_grace(),
        }
    }

    fn record_args(&self, source: &str, duration: Duration, output: &Path) -> Vec<OsString> {
        let mut args = base_args();
        if source.starts_with("rtsp://") || source.starts_with("rtsps://") {
            push_all(&mut args, &["-rtsp_transport", &self.transport]);
        }
        let secs = duration.as_secs_f64().to_string();
        push_all(
            &mut args,
            &["-i", source, "-t", &secs, "-c", "copy", "-map", "0", "-y"],
        );
        args.push(output.as_os_str().to_os_string());
        args
    }

    fn concat_args(list: &Path, output: &Path) -> Vec<OsString> {
        let mut args = base_args();
        push_all(&mut args, &["-f", "concat", "-safe", "0", "-i"]);
        args.push(list.as_os_str().to_os_string());
        push_all(&mut args, &["-c", "copy", "-movflags", "+faststart", "-y"]);
        args.push(output.as_os_str().to_os_string());
        args
    }

    fn thumbnail_args(clip: &Path, offset: Duration, output: &Path) -> Vec<OsString> {
        let mut args = base_args();
        let offset = format!("{:.3}", offset.as_secs_f64());
        push_all(&mut args, &["-ss", &offset, "-i"]);
        args.push(clip.as_os_str().to_os_string());
        push_all(&mut args, &["-vframes", "1", "-q:v", "2", "-y"]);
        args.push(output.as_os_str().to_os_string());
        args
    }
}

#[async_trait]
impl MediaTool for Ffmpeg {
    #[instrument(skip(self, output), fields(output = %output.display()))]
    async fn record_segment(
        &self,
        source: &str,
        duration: Duration,
        output: &Path,
    ) -> Result<(), MediaError> {
        let args = self.record_args(source, duration, output);
        run_with_watchdog(&self.binary, &args, duration + self.grace).await
    }

    #[instrument(skip(self, inputs, output), fields(inputs = inputs.len(), output = %output.display()))]
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MediaError> {
        if inputs.is_empty() {
            return Err(MediaError::EmptyInput);
        }

        let list = concat_list_path(output);
        tokio::fs::write(&list, concat_list(inputs)?).await?;

        let args = Self::concat_args(&list, output);
        let limit = self.grace + Duration::from_secs(inputs.len() as u64);
        let result = run_with_watchdog(&self.binary, &args, limit).await;

        if let Err(e) = tokio::fs::remove_file(&list).await {
            debug!(list = %list.display(), error = %e, "Failed to remove concat list");
        }
        result
    }

    #[instrument(skip(self, clip, output), fields(clip = %clip.display()))]
    async fn thumbnail(
        &self,
        clip: &Path,
        offset: Duration,
        output: &Path,
    ) -> Result<(), MediaError> {
        let args = Self::thumbnail_args(clip, offset, output);
        run_with_watchdog(&self.binary, &args, self.grace).await
    }
}

fn base_args() -> Vec<OsString> {
    vec!["-hide_banner".into(), "-loglevel".into(), "error".into()]
}

fn push_all(args: &mut Vec<OsString>, values: &[&str]) {
    args.extend(values.iter().map(OsString::from));
}

/// Concat list file placed next to the output, unique per invocation.
fn concat_list_path(output: &Path) -> PathBuf {
    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".concat-{}.txt", uuid::Uuid::new_v4()))
}

/// Build a concat demuxer list. Paths are made absolute because the demuxer
/// resolves relative entries against the list file's directory.
fn concat_list(inputs: &[PathBuf]) -> std::io::Result<String> {
    let cwd = std::env::current_dir()?;
    let mut list = String::new();
    for input in inputs {
        let absolute = if input.is_absolute() {
            input.clone()
        } else {
            cwd.join(input)
        };
        let escaped = absolute.to_string_lossy().replace('\'', r"'\''");
        list.push_str(&format!("file '{}'\n", escaped));
    }
    Ok(list)
}

/// Run a process to completion, killing it if it outlives `limit`.
async fn run_with_watchdog(
    program: &str,
    args: &[OsString],
    limit: Duration,
) -> Result<(), MediaError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| MediaError::Spawn {
            program: program.to_string(),
            source,
        })?;

    // Dropping the child on timeout kills it.
    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(MediaError::TimedOut {
                program: program.to_string(),
                limit,
            })
        }
    };

    if !output.status.success() {
        return Err(MediaError::ExecutionFailed {
            program: program.to_string(),
            exit_code: output.status.code(),
            stderr: stderr_tail(&output.stderr),
        });
    }

    Ok(())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
