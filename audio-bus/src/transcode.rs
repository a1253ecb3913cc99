//! Transcoder process wrapper.
//!
//! ```text
//!  ByteStream ──► [feeder] ──► stdin ┐
//!                                    ├─ ffmpeg ─► stdout ─► [supervisor] ─► bounded channel ─► ByteStream
//!                     [stderr monitor] ◄─ stderr ┘                  │
//!                                                                   └─ exit status ─► final Err item
//! ```
//!
//! The supervisor owns the child process. A fatal transcoder condition is
//! delivered as the last item of the output stream, so the consumer observes
//! data and failure through one await point.

use std::{collections::VecDeque, path::PathBuf, process::Stdio, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{io::ReaderStream, sync::CancellationToken, task::AbortOnDropHandle};

use crate::{
    pool::{PoolPermit, ProcessPool},
    stream::{ByteStream, StreamError, into_async_read, source_error},
};

pub const SUPPORTED_BITRATES_KBPS: [u32; 5] = [96, 128, 192, 256, 320];
pub const DEFAULT_BITRATE_KBPS: u32 = 192;

const STDERR_TAIL_LINES: usize = 8;
const OUTPUT_BUFFER_CHUNKS: usize = 4;
const DEFAULT_READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("unsupported bitrate: {0} kbps")]
    UnsupportedBitrate(u32),
    /// The transcoder could not be launched: pool exhausted, binary missing,
    /// or stdio could not be captured.
    #[error("transcoder failed to start: {0}")]
    PipeStartFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Mp3,
}

impl TargetFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
        }
    }

    fn ffmpeg_args(&self) -> [&'static str; 4] {
        match self {
            Self::Mp3 => ["-c:a", "libmp3lame", "-f", "mp3"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub format: TargetFormat,
    pub bitrate_kbps: u32,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            format: TargetFormat::Mp3,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
        }
    }
}

impl TranscodeOptions {
    pub fn mp3(bitrate_kbps: u32) -> Result<Self, PipeError> {
        if !SUPPORTED_BITRATES_KBPS.contains(&bitrate_kbps) {
            return Err(PipeError::UnsupportedBitrate(bitrate_kbps));
        }
        Ok(Self {
            format: TargetFormat::Mp3,
            bitrate_kbps,
        })
    }
}

/// Output of [`Transcode::open`]: the encoded stream plus the handle that
/// keeps the process and its pool unit alive.
pub struct PipeOutput {
    pub stream: ByteStream,
    pub handle: ProcessHandle,
}

/// Owns one transcoder process and one pool unit. The pipe never releases
/// it; the holder must call [`ProcessHandle::release`]. Dropping an
/// unreleased handle kills the process.
pub struct ProcessHandle {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    _permit: PoolPermit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The process had exited or exited within the grace period.
    Exited,
    /// The grace period elapsed and the process was killed.
    Killed,
}

impl ProcessHandle {
    /// `task` owns the process; aborting it must kill the process.
    pub fn new(permit: PoolPermit, shutdown: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            shutdown,
            task: Some(task),
            _permit: permit,
        }
    }

    /// Asks the process to stop, waits up to `grace`, then hard-kills it.
    /// The pool unit is returned before this resolves.
    pub async fn release(mut self, grace: Duration) -> ReleaseOutcome {
        self.shutdown.cancel();
        let Some(task) = self.task.take() else {
            return ReleaseOutcome::Exited;
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(grace, task).await {
            Ok(_) => ReleaseOutcome::Exited,
            Err(_) => {
                abort.abort();
                ReleaseOutcome::Killed
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Launches a transcoder for one input stream.
pub trait Transcode: Send + Sync {
    fn open(&self, input: ByteStream, options: &TranscodeOptions)
    -> Result<PipeOutput, PipeError>;

    /// Pool units currently held.
    fn active(&self) -> usize;
}

/// `ffmpeg` reading from stdin and writing the encoded audio to stdout.
pub struct FfmpegTranscoder {
    program: PathBuf,
    args_override: Option<Vec<String>>,
    pool: ProcessPool,
    read_chunk: usize,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, pool: ProcessPool) -> Self {
        Self {
            program: program.into(),
            args_override: None,
            pool,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    /// Runs `program` with exactly `args` instead of the generated ffmpeg
    /// command line, for wrapper scripts.
    pub fn with_command<I, S>(program: impl Into<PathBuf>, args: I, pool: ProcessPool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args_override: Some(args.into_iter().map(Into::into).collect()),
            pool,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    fn build_args(&self, options: &TranscodeOptions) -> Vec<String> {
        if let Some(args) = &self.args_override {
            return args.clone();
        }
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(options.format.ffmpeg_args().iter().map(|s| s.to_string()));
        args.push("-b:a".to_string());
        args.push(format!("{}k", options.bitrate_kbps));
        args.push("pipe:1".to_string());
        args
    }

    fn spawn(&self, options: &TranscodeOptions) -> Result<Child, PipeError> {
        Command::new(&self.program)
            .args(self.build_args(options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PipeError::PipeStartFailure(format!("{} not found", self.program.display()))
                } else {
                    PipeError::PipeStartFailure(e.to_string())
                }
            })
    }
}

impl Transcode for FfmpegTranscoder {
    fn open(
        &self,
        input: ByteStream,
        options: &TranscodeOptions,
    ) -> Result<PipeOutput, PipeError> {
        let permit = self.pool.try_acquire().ok_or_else(|| {
            log::warn!(
                "Transcoder: pool exhausted ({}/{})",
                self.pool.active(),
                self.pool.capacity()
            );
            PipeError::PipeStartFailure("transcoder pool exhausted".to_string())
        })?;

        let mut child = self.spawn(options)?;
        let stdio = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match stdio {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(PipeError::PipeStartFailure(
                    "failed to capture transcoder stdio".to_string(),
                ));
            }
        };

        log::debug!(
            "Transcoder: started pid={:?} format={:?} bitrate={}k active={}",
            child.id(),
            options.format,
            options.bitrate_kbps,
            self.pool.active()
        );

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER_CHUNKS);
        let shutdown = CancellationToken::new();
        let feeder = AbortOnDropHandle::new(tokio::spawn(feed(input, stdin)));
        let monitor = AbortOnDropHandle::new(tokio::spawn(monitor_stderr(stderr)));
        let task = tokio::spawn(supervise(
            Supervised {
                child,
                stdout: ReaderStream::with_capacity(stdout, self.read_chunk),
                feeder,
                monitor,
            },
            tx,
            shutdown.clone(),
        ));

        Ok(PipeOutput {
            stream: ReceiverStream::new(rx).boxed(),
            handle: ProcessHandle::new(permit, shutdown, task),
        })
    }

    fn active(&self) -> usize {
        self.pool.active()
    }
}

enum FeedError {
    /// The input stream itself failed.
    Source(StreamError),
    /// Writing to the transcoder failed, usually because it exited.
    Stdin(std::io::Error),
}

async fn feed(input: ByteStream, mut stdin: ChildStdin) -> Result<u64, FeedError> {
    let mut reader = into_async_read(input);
    let copied = tokio::io::copy(&mut reader, &mut stdin)
        .await
        .map_err(|e| match source_error(&e) {
            Some(err) => FeedError::Source(err),
            None => FeedError::Stdin(e),
        })?;
    stdin.shutdown().await.map_err(FeedError::Stdin)?;
    Ok(copied)
}

/// Logs every diagnostic line and keeps the last few for the failure message.
async fn monitor_stderr(stderr: ChildStderr) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::warn!(target: "ffmpeg", "{}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

/// Helper tasks are aborted with the supervisor, so a killed supervisor also
/// drops the input stream and its connection.
struct Supervised {
    child: Child,
    stdout: ReaderStream<ChildStdout>,
    feeder: AbortOnDropHandle<Result<u64, FeedError>>,
    monitor: AbortOnDropHandle<Vec<String>>,
}

async fn supervise(
    mut proc: Supervised,
    tx: mpsc::Sender<Result<Bytes, StreamError>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                stop(&mut proc).await;
                return;
            }
            next = proc.stdout.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                if !deliver(&tx, Ok(bytes), &shutdown).await {
                    stop(&mut proc).await;
                    return;
                }
            }
            Some(Err(e)) => {
                let failure = StreamError::Transcoder(format!("stdout read failed: {}", e));
                deliver(&tx, Err(failure), &shutdown).await;
                stop(&mut proc).await;
                return;
            }
            None => break,
        }
    }

    let status = tokio::select! {
        _ = shutdown.cancelled() => {
            stop(&mut proc).await;
            return;
        }
        status = proc.child.wait() => status,
    };

    let failure = match status {
        Ok(status) if status.success() => {
            // a clean exit only counts once the whole input was handed over
            tokio::select! {
                _ = shutdown.cancelled() => return,
                fed = &mut proc.feeder => match fed {
                    Ok(Ok(copied)) => {
                        log::debug!("Transcoder: finished after {} input bytes", copied);
                        None
                    }
                    Ok(Err(FeedError::Source(e))) => Some(e),
                    Ok(Err(FeedError::Stdin(e))) => {
                        log::debug!("Transcoder: stdin closed early: {}", e);
                        None
                    }
                    Err(e) => Some(StreamError::Transcoder(format!("feeder failed: {}", e))),
                },
            }
        }
        Ok(status) => {
            proc.feeder.abort();
            let tail = tokio::select! {
                _ = shutdown.cancelled() => Vec::new(),
                tail = &mut proc.monitor => tail.unwrap_or_default(),
            };
            Some(StreamError::Transcoder(format!(
                "exited with {}: {}",
                status,
                tail.join(" | ")
            )))
        }
        Err(e) => {
            proc.feeder.abort();
            Some(StreamError::Transcoder(format!("wait failed: {}", e)))
        }
    };

    if let Some(failure) = failure {
        log::warn!("Transcoder: {}", failure);
        deliver(&tx, Err(failure), &shutdown).await;
    }
}

/// Sends one item, giving up when the receiver is gone or shutdown starts.
async fn deliver(
    tx: &mpsc::Sender<Result<Bytes, StreamError>>,
    item: Result<Bytes, StreamError>,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

/// Closes stdin and waits for the process, discarding any output it still
/// flushes. The caller bounds the wait and kills the process by aborting
/// this task.
async fn stop(proc: &mut Supervised) {
    proc.feeder.abort();
    let discard = async { while proc.stdout.next().await.is_some() {} };
    let (status, ()) = tokio::join!(proc.child.wait(), discard);
    match status {
        Ok(status) => log::debug!("Transcoder: stopped with {}", status),
        Err(e) => log::warn!("Transcoder: wait after stop failed: {}", e),
    }
    proc.monitor.abort();
}

#[cfg(test)]
#[path = "transcode_test.rs"]
mod transcode_test;
