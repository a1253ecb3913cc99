use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use audio_bus::{
    locator::{Locator, LocatorPolicy},
    source::Resolve,
    stream::{ByteStream, StreamError},
    transcode::{PipeOutput, ReleaseOutcome, TargetFormat, Transcode, TranscodeOptions},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::RelayConfig,
    relay::{
        RelayError,
        gate::AdmissionGate,
        job::{Job, JobOutcome, JobState},
    },
};

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
const DEFAULT_SINK_BUFFER: usize = 8;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Admission to completion.
    pub job_timeout: Duration,
    /// Longest wait for the resolver or the transcoder to produce anything.
    pub stall_timeout: Duration,
    /// How long a transcoder may take to exit before it is killed.
    pub kill_grace: Duration,
    /// Largest body chunk handed to the response.
    pub chunk_size: usize,
    /// Chunks buffered between the job and the response.
    pub sink_buffer: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

impl RelaySettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            job_timeout: config.job_timeout,
            stall_timeout: config.stall_timeout,
            kill_grace: config.kill_grace,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sink_buffer: DEFAULT_SINK_BUFFER,
        }
    }
}

pub struct RelayRequest {
    pub locator: String,
    pub bitrate_kbps: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub in_flight: usize,
    pub capacity: usize,
    pub transcoders: usize,
}

/// A job whose headers are committed: the status is success and the body
/// carries the encoded audio.
pub struct RelayStream {
    pub job_id: Uuid,
    pub format: TargetFormat,
    pub body: RelayBody,
}

pub struct RelayController {
    gate: AdmissionGate,
    policy: LocatorPolicy,
    resolver: Arc<dyn Resolve>,
    transcoder: Arc<dyn Transcode>,
    settings: RelaySettings,
    shutdown: CancellationToken,
}

impl RelayController {
    pub fn new(
        gate: AdmissionGate,
        policy: LocatorPolicy,
        resolver: Arc<dyn Resolve>,
        transcoder: Arc<dyn Transcode>,
        settings: RelaySettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            gate,
            policy,
            resolver,
            transcoder,
            settings,
            shutdown,
        }
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            in_flight: self.gate.in_flight(),
            capacity: self.gate.capacity(),
            transcoders: self.transcoder.active(),
        }
    }

    /// Validates and admits the request, then runs the job in its own task.
    /// Resolves once the job either produced its first audio bytes (success
    /// headers may be sent) or failed before that.
    pub async fn start(&self, request: RelayRequest) -> Result<RelayStream, RelayError> {
        let locator = self.policy.validate(&request.locator).map_err(|e| {
            log::info!("Relay: rejected locator {:?}: {}", request.locator, e);
            RelayError::InvalidLocator
        })?;
        let options = match request.bitrate_kbps {
            None => TranscodeOptions::default(),
            Some(kbps) => TranscodeOptions::mp3(kbps)
                .map_err(|_| RelayError::InvalidBitrate(kbps.to_string()))?,
        };

        let slot = self.gate.try_admit().map_err(|_| {
            log::warn!(
                "Relay: at capacity ({}/{}), rejecting {}",
                self.gate.in_flight(),
                self.gate.capacity(),
                locator
            );
            RelayError::AtCapacity
        })?;

        let job = Job::new(locator.as_str(), slot.acquired_at());
        let job_id = job.id();
        log::info!("Job {}: admitted {}", job_id, locator);

        let (sink, body_rx) = mpsc::channel(self.settings.sink_buffer.max(1));
        let (commit_tx, commit_rx) = oneshot::channel();
        let ctx = JobContext {
            job,
            sink,
            commit: Some(HeaderCommit(commit_tx)),
            cancel: self.shutdown.child_token(),
            deadline: slot.acquired_at() + self.settings.job_timeout,
            settings: self.settings.clone(),
        };
        let resolver = Arc::clone(&self.resolver);
        let transcoder = Arc::clone(&self.transcoder);

        tokio::spawn(async move {
            let outcome = run_job(ctx, locator, options, resolver, transcoder).await;
            slot.release();
            if outcome.state.is_terminal() {
                log::info!("Relay: {}", outcome);
            } else {
                log::error!("Relay: {} ended without a terminal state", outcome);
            }
        });

        match commit_rx.await {
            Ok(Ok(())) => Ok(RelayStream {
                job_id,
                format: options.format,
                body: RelayBody::new(body_rx),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RelayError::Transcode(
                "job ended without committing a response".to_string(),
            )),
        }
    }
}

/// Why a job stopped waiting on its current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Shutdown,
    Disconnected,
    Deadline,
    Stalled,
}

enum Chunk {
    Data(Bytes),
    End,
}

/// Consumed on use, so the response status is decided exactly once.
struct HeaderCommit(oneshot::Sender<Result<(), RelayError>>);

impl HeaderCommit {
    fn commit(self, result: Result<(), RelayError>) -> bool {
        self.0.send(result).is_ok()
    }
}

struct JobContext {
    job: Job,
    sink: mpsc::Sender<Chunk>,
    commit: Option<HeaderCommit>,
    cancel: CancellationToken,
    deadline: Instant,
    settings: RelaySettings,
}

impl JobContext {
    /// Awaits `fut` unless the job is cancelled, the client goes away, the
    /// deadline passes, or (when `stall` is set) nothing arrives in time.
    async fn watch<F: Future>(&self, fut: F, stall: bool) -> Result<F::Output, Interrupt> {
        let stall_timer = async {
            if stall {
                tokio::time::sleep(self.settings.stall_timeout).await
            } else {
                std::future::pending::<()>().await
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Shutdown),
            _ = self.sink.closed() => Err(Interrupt::Disconnected),
            _ = tokio::time::sleep_until(self.deadline) => Err(Interrupt::Deadline),
            _ = stall_timer => Err(Interrupt::Stalled),
            out = fut => Ok(out),
        }
    }

    fn commit_headers(&mut self) {
        if let Some(commit) = self.commit.take() {
            if !commit.commit(Ok(())) {
                log::debug!("Job {}: client left before headers", self.job.id());
            }
        }
    }

    /// Sends `bytes` to the response in bounded pieces, waiting for room
    /// before each one.
    async fn send(&mut self, mut bytes: Bytes) -> Result<(), Interrupt> {
        let chunk_size = self.settings.chunk_size.max(1);
        while !bytes.is_empty() {
            let piece = bytes.split_to(chunk_size.min(bytes.len()));
            let len = piece.len();
            match self.watch(self.sink.send(Chunk::Data(piece)), false).await {
                Ok(Ok(())) => self.job.record_sent(len),
                Ok(Err(_)) => return Err(Interrupt::Disconnected),
                Err(interrupt) => return Err(interrupt),
            }
        }
        Ok(())
    }

    async fn complete(&mut self) {
        match self.watch(self.sink.send(Chunk::End), false).await {
            Ok(Ok(())) => {
                self.job.advance(JobState::Completed);
            }
            Ok(Err(_)) => self.interrupt(Interrupt::Disconnected),
            Err(interrupt) => self.interrupt(interrupt),
        }
    }

    /// Unrecoverable error. Before the headers this becomes the response
    /// status; after them the body is cut short when the sink drops.
    fn fail(&mut self, error: RelayError) {
        match self.commit.take() {
            Some(commit) => {
                log::warn!("Job {}: failed before headers: {}", self.job.id(), error);
                commit.commit(Err(error));
            }
            None => log::error!(
                "Job {}: aborted after {} bytes: {}",
                self.job.id(),
                self.job.bytes_sent(),
                error
            ),
        }
        self.job.advance(JobState::Failed);
    }

    fn interrupt(&mut self, interrupt: Interrupt) {
        log::info!(
            "Job {}: {:?} while {}",
            self.job.id(),
            interrupt,
            self.job.state()
        );
        if let Some(commit) = self.commit.take() {
            let error = match interrupt {
                Interrupt::Deadline | Interrupt::Stalled => RelayError::Timeout,
                Interrupt::Disconnected | Interrupt::Shutdown => RelayError::Cancelled,
            };
            commit.commit(Err(error));
        }
        self.job.advance(JobState::Cancelled);
    }
}

fn stream_failure(error: StreamError) -> RelayError {
    match error {
        StreamError::Source(msg) => RelayError::Resolution(msg),
        StreamError::Transcoder(msg) => RelayError::Transcode(msg),
    }
}

async fn run_job(
    mut ctx: JobContext,
    locator: Locator,
    options: TranscodeOptions,
    resolver: Arc<dyn Resolve>,
    transcoder: Arc<dyn Transcode>,
) -> JobOutcome {
    ctx.job.advance(JobState::Resolving);
    log::debug!("Job {}: resolving {}", ctx.job.id(), ctx.job.locator());
    let input = match ctx.watch(resolver.resolve(&locator), true).await {
        Ok(Ok(input)) => input,
        Ok(Err(e)) => {
            ctx.fail(RelayError::Resolution(e.to_string()));
            return ctx.job.outcome();
        }
        Err(interrupt) => {
            ctx.interrupt(interrupt);
            return ctx.job.outcome();
        }
    };

    ctx.job.advance(JobState::Transcoding);
    let PipeOutput { stream, handle } = match transcoder.open(input, &options) {
        Ok(output) => output,
        Err(e) => {
            ctx.fail(RelayError::PipeStart(e.to_string()));
            return ctx.job.outcome();
        }
    };

    relay_output(&mut ctx, stream).await;

    // the response ends now, whether or not the transcoder exits promptly
    let JobContext {
        job, sink, settings, ..
    } = ctx;
    drop(sink);

    if handle.release(settings.kill_grace).await == ReleaseOutcome::Killed {
        log::warn!(
            "Job {}: transcoder killed after {:?} grace",
            job.id(),
            settings.kill_grace
        );
    }
    job.outcome()
}

/// Copies the transcoder output to the response. The next read from the
/// transcoder only starts after the previous chunk found room in the sink.
async fn relay_output(ctx: &mut JobContext, mut stream: ByteStream) {
    let mut pending = loop {
        match ctx.watch(stream.next(), true).await {
            Ok(Some(Ok(bytes))) if bytes.is_empty() => continue,
            Ok(Some(Ok(bytes))) => break bytes,
            Ok(Some(Err(e))) => return ctx.fail(stream_failure(e)),
            Ok(None) => {
                return ctx.fail(RelayError::Transcode(
                    "transcoder produced no output".to_string(),
                ));
            }
            Err(interrupt) => return ctx.interrupt(interrupt),
        }
    };

    ctx.job.advance(JobState::Streaming);
    ctx.commit_headers();

    loop {
        if let Err(interrupt) = ctx.send(pending).await {
            return ctx.interrupt(interrupt);
        }
        pending = match ctx.watch(stream.next(), true).await {
            Ok(Some(Ok(bytes))) => bytes,
            Ok(Some(Err(e))) => return ctx.fail(stream_failure(e)),
            Ok(None) => return ctx.complete().await,
            Err(interrupt) => return ctx.interrupt(interrupt),
        };
    }
}

/// Response body fed by a job. Ends cleanly only when the job reached its
/// end marker; a job that stops early yields an error so the connection is
/// torn down instead of looking like a finished file.
pub struct RelayBody {
    rx: mpsc::Receiver<Chunk>,
    done: bool,
}

impl RelayBody {
    fn new(rx: mpsc::Receiver<Chunk>) -> Self {
        Self { rx, done: false }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Chunk::Data(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Chunk::End)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "relay aborted before end of stream",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
