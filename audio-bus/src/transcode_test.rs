use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::StreamExt;

use super::{
    DEFAULT_BITRATE_KBPS, FfmpegTranscoder, PipeError, PipeOutput, ReleaseOutcome, TargetFormat,
    Transcode, TranscodeOptions,
};
use crate::{
    pool::ProcessPool,
    stream::{ByteStream, StreamError, from_chunks},
};

fn shell(script: &str, pool: ProcessPool) -> FfmpegTranscoder {
    FfmpegTranscoder::with_command("sh", ["-c", script], pool)
}

fn input(parts: &[&'static [u8]]) -> ByteStream {
    from_chunks(parts.iter().map(|p| Bytes::from_static(p)).collect::<Vec<_>>())
}

async fn collect(mut stream: ByteStream) -> (Vec<u8>, Option<StreamError>) {
    let mut data = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => data.extend_from_slice(&bytes),
            Err(e) => return (data, Some(e)),
        }
    }
    (data, None)
}

fn open_ok(transcoder: &FfmpegTranscoder, input: ByteStream) -> PipeOutput {
    match transcoder.open(input, &TranscodeOptions::default()) {
        Ok(output) => output,
        Err(e) => panic!("open failed: {}", e),
    }
}

#[test]
fn test_options_bitrate() {
    let options = TranscodeOptions::default();
    assert_eq!(options.format, TargetFormat::Mp3);
    assert_eq!(options.bitrate_kbps, DEFAULT_BITRATE_KBPS);
    assert_eq!(options.format.content_type(), "audio/mpeg");
    assert_eq!(options.format.extension(), "mp3");

    for kbps in [96, 128, 192, 256, 320] {
        assert_eq!(TranscodeOptions::mp3(kbps).unwrap().bitrate_kbps, kbps);
    }
    assert_eq!(
        TranscodeOptions::mp3(100),
        Err(PipeError::UnsupportedBitrate(100))
    );
    assert_eq!(TranscodeOptions::mp3(0), Err(PipeError::UnsupportedBitrate(0)));
}

#[test]
fn test_ffmpeg_command_line() {
    let transcoder = FfmpegTranscoder::new("ffmpeg", ProcessPool::new(1));
    let args = transcoder.build_args(&TranscodeOptions::mp3(128).unwrap());
    assert_eq!(
        args,
        vec![
            "-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn", "-c:a", "libmp3lame",
            "-f", "mp3", "-b:a", "128k", "pipe:1",
        ]
    );
}

#[tokio::test]
async fn test_passthrough_preserves_order() {
    let pool = ProcessPool::new(1);
    let transcoder = shell("cat", pool.clone());

    let PipeOutput { stream, handle } =
        open_ok(&transcoder, input(&[b"first ", b"second ", b"third"]));
    assert_eq!(transcoder.active(), 1);

    let (data, failure) = collect(stream).await;
    assert_eq!(data, b"first second third");
    assert!(failure.is_none());

    assert_eq!(handle.release(Duration::from_secs(2)).await, ReleaseOutcome::Exited);
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn test_nonzero_exit_is_reported_in_stream() {
    let pool = ProcessPool::new(1);
    let transcoder = shell(
        "head -c 4; cat > /dev/null; echo 'Invalid data found when processing input' >&2; exit 1",
        pool.clone(),
    );

    let PipeOutput { stream, handle } = open_ok(&transcoder, input(&[b"abcdefgh"]));
    let (data, failure) = collect(stream).await;
    assert_eq!(data, b"abcd");
    match failure {
        Some(StreamError::Transcoder(msg)) => {
            assert!(msg.contains("Invalid data found"), "message: {}", msg)
        }
        other => panic!("expected transcoder failure, got {:?}", other),
    }

    handle.release(Duration::from_secs(2)).await;
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn test_input_failure_is_not_silent_truncation() {
    let pool = ProcessPool::new(1);
    let transcoder = shell("cat", pool.clone());

    let broken: ByteStream = futures::stream::iter(vec![
        Ok(Bytes::from_static(b"partial")),
        Err(StreamError::Source("connection reset".to_string())),
    ])
    .boxed();

    let PipeOutput { stream, handle } = open_ok(&transcoder, broken);
    let (data, failure) = collect(stream).await;
    assert_eq!(data, b"partial");
    assert_eq!(
        failure,
        Some(StreamError::Source("connection reset".to_string()))
    );

    handle.release(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_pool_exhaustion_fails_to_start() {
    let pool = ProcessPool::new(1);
    let transcoder = shell("cat", pool.clone());

    let first = open_ok(&transcoder, futures::stream::pending().boxed());
    match transcoder.open(input(&[b"x"]), &TranscodeOptions::default()) {
        Err(PipeError::PipeStartFailure(msg)) => assert!(msg.contains("exhausted")),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("second open should be rejected"),
    }

    first.handle.release(Duration::from_millis(500)).await;
    assert_eq!(pool.active(), 0);
    assert!(transcoder.open(input(&[b"x"]), &TranscodeOptions::default()).is_ok());
}

#[tokio::test]
async fn test_missing_binary_fails_to_start() {
    let pool = ProcessPool::new(1);
    let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg", pool.clone());

    match transcoder.open(input(&[b"x"]), &TranscodeOptions::default()) {
        Err(PipeError::PipeStartFailure(msg)) => assert!(msg.contains("not found")),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("open should fail"),
    }
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn test_release_kills_hung_process_after_grace() {
    let pool = ProcessPool::new(1);
    let transcoder = shell("exec sleep 30", pool.clone());

    let PipeOutput { stream, handle } = open_ok(&transcoder, input(&[]));
    let started = std::time::Instant::now();
    let outcome = handle.release(Duration::from_millis(200)).await;

    assert_eq!(outcome, ReleaseOutcome::Killed);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(pool.active(), 0);

    // The stream ends once the supervisor is gone.
    let (_, failure) = tokio::time::timeout(Duration::from_secs(5), collect(stream))
        .await
        .expect("stream should end after release");
    assert!(failure.is_none());
}

/// Sets its flag when dropped, i.e. when whoever owns the input lets go of it.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// One chunk, then silence, like a source connection that stopped sending.
fn quiet_source() -> (ByteStream, Arc<AtomicBool>) {
    let dropped = Arc::new(AtomicBool::new(false));
    let guard = DropFlag(Arc::clone(&dropped));
    let stream: ByteStream = futures::stream::once(async { Ok(Bytes::from_static(b"abcdef")) })
        .chain(futures::stream::pending())
        .inspect(move |_| {
            let _held = &guard;
        })
        .boxed();
    (stream, dropped)
}

async fn wait_for(flag: &AtomicBool, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    flag.load(Ordering::SeqCst)
}

#[tokio::test]
async fn test_crash_is_reported_while_source_is_quiet() {
    let pool = ProcessPool::new(1);
    let transcoder = shell("head -c 1 > /dev/null; echo boom >&2; exit 1", pool.clone());
    let (source, dropped) = quiet_source();

    let PipeOutput { mut stream, handle } = open_ok(&transcoder, source);
    let next = tokio::time::timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("crash must be reported without more input");
    match next {
        Some(Err(StreamError::Transcoder(msg))) => assert!(msg.contains("boom"), "{}", msg),
        other => panic!("expected transcoder failure, got {:?}", other),
    }

    assert_eq!(
        handle.release(Duration::from_secs(2)).await,
        ReleaseOutcome::Exited
    );
    assert_eq!(pool.active(), 0);
    assert!(wait_for(&dropped, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_kill_drops_the_input_stream() {
    let pool = ProcessPool::new(1);
    let transcoder = shell("exec sleep 30", pool.clone());
    let (source, dropped) = quiet_source();

    let PipeOutput { stream, handle } = open_ok(&transcoder, source);
    assert_eq!(
        handle.release(Duration::from_millis(200)).await,
        ReleaseOutcome::Killed
    );
    drop(stream);
    assert!(wait_for(&dropped, Duration::from_secs(1)).await);
}
