//! In-process stand-ins for the extraction and transcoding tools.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use audio_bus::{
    locator::{Locator, LocatorPolicy},
    pool::ProcessPool,
    source::{Resolve, ResolveError},
    stream::{ByteStream, StreamError, from_chunks},
    transcode::{PipeError, PipeOutput, ProcessHandle, Transcode, TranscodeOptions},
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    config::RelayConfig,
    relay::{RelayController, RelaySettings, gate::AdmissionGate},
};

pub const VALID_LOCATOR: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

/// Chunks a fake pipe buffers ahead of its reader.
pub const FAKE_PIPE_BUFFER: usize = 2;

#[derive(Clone)]
pub enum SourceBehavior {
    /// Yields these chunks, then ends.
    Chunks(Vec<Bytes>),
    /// Fails resolution with the given reason.
    Unavailable(&'static str),
    /// Never answers.
    Hang,
}

pub struct FakeResolver {
    behavior: SourceBehavior,
    calls: AtomicUsize,
}

impl FakeResolver {
    pub fn new(behavior: SourceBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolve for FakeResolver {
    async fn resolve(&self, _locator: &Locator) -> Result<ByteStream, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            SourceBehavior::Chunks(chunks) => Ok(from_chunks(chunks.clone())),
            SourceBehavior::Unavailable(reason) => {
                Err(ResolveError::ResolutionFailure(reason.to_string()))
            }
            SourceBehavior::Hang => std::future::pending().await,
        }
    }
}

#[derive(Clone)]
pub enum PipeBehavior {
    /// Copies the input to the output in order.
    Passthrough,
    /// Emits `chunk` forever, `interval` apart.
    Endless { chunk: Bytes, interval: Duration },
    /// Emits `prefix`, then reports a transcoder crash.
    CrashAfter(Bytes),
    /// Accepts input but never produces output.
    Silent,
    /// Like `CrashAfter`, then keeps running and ignores shutdown, so only a
    /// kill ends it.
    CrashThenHang(Bytes),
}

/// Transcoder double that holds a real pool unit per open pipe, so tests can
/// watch the pool count return to baseline.
pub struct FakeTranscoder {
    behavior: PipeBehavior,
    pool: ProcessPool,
    opened: AtomicUsize,
    produced: Arc<AtomicUsize>,
}

impl FakeTranscoder {
    pub fn new(behavior: PipeBehavior, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            pool: ProcessPool::new(capacity),
            opened: AtomicUsize::new(0),
            produced: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Output chunks handed to the reader side of any pipe so far.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }
}

impl Transcode for FakeTranscoder {
    fn open(
        &self,
        mut input: ByteStream,
        _options: &TranscodeOptions,
    ) -> Result<PipeOutput, PipeError> {
        let permit = self
            .pool
            .try_acquire()
            .ok_or_else(|| PipeError::PipeStartFailure("transcoder pool exhausted".to_string()))?;
        self.opened.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel::<Result<Bytes, StreamError>>(FAKE_PIPE_BUFFER);
        let produced = Arc::clone(&self.produced);
        let shutdown = CancellationToken::new();
        let behavior = self.behavior.clone();
        let ignores_shutdown = matches!(behavior, PipeBehavior::CrashThenHang(_));
        let stop = shutdown.clone();
        let task = tokio::spawn(async move {
            let produce = async {
                match behavior {
                    PipeBehavior::Passthrough => {
                        while let Some(item) = input.next().await {
                            if tx.send(item).await.is_err() {
                                return;
                            }
                            produced.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    PipeBehavior::Endless { chunk, interval } => loop {
                        if tx.send(Ok(chunk.clone())).await.is_err() {
                            return;
                        }
                        produced.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(interval).await;
                    },
                    PipeBehavior::CrashAfter(prefix) => {
                        let _ = tx.send(Ok(prefix)).await;
                        let _ = tx
                            .send(Err(StreamError::Transcoder("encoder crashed".to_string())))
                            .await;
                    }
                    PipeBehavior::Silent => std::future::pending::<()>().await,
                    PipeBehavior::CrashThenHang(prefix) => {
                        let _ = tx.send(Ok(prefix)).await;
                        let _ = tx
                            .send(Err(StreamError::Transcoder("encoder crashed".to_string())))
                            .await;
                        std::future::pending::<()>().await
                    }
                }
            };
            if ignores_shutdown {
                produce.await;
                return;
            }
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = produce => {}
            }
        });

        Ok(PipeOutput {
            stream: ReceiverStream::new(rx).boxed(),
            handle: ProcessHandle::new(permit, shutdown, task),
        })
    }

    fn active(&self) -> usize {
        self.pool.active()
    }
}

pub fn settings() -> RelaySettings {
    RelaySettings {
        job_timeout: Duration::from_secs(60),
        stall_timeout: Duration::from_secs(5),
        kill_grace: Duration::from_millis(200),
        chunk_size: 4,
        sink_buffer: 2,
    }
}

pub fn controller(
    capacity: usize,
    resolver: Arc<FakeResolver>,
    transcoder: Arc<FakeTranscoder>,
    settings: RelaySettings,
) -> RelayController {
    RelayController::new(
        AdmissionGate::new(capacity),
        LocatorPolicy::new(&RelayConfig::default().allowed_hosts),
        resolver,
        transcoder,
        settings,
        CancellationToken::new(),
    )
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
