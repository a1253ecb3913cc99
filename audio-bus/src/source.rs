use std::{collections::HashMap, process::Stdio, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tokio::process::Command;

use crate::{
    locator::Locator,
    stream::{ByteStream, StreamError},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Malformed or non-allow-listed locator. Raised before any tool runs.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    /// The extraction tool or the source host could not produce audio.
    #[error("resolution failed: {0}")]
    ResolutionFailure(String),
}

/// Turns a screened locator into a live input stream positioned at the start
/// of the best audio-only representation.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, locator: &Locator) -> Result<ByteStream, ResolveError>;
}

/// Subset of the `yt-dlp -J` document the resolver looks at.
#[derive(Debug, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

impl FormatInfo {
    /// Audio present, video explicitly absent, and fetchable with one GET.
    pub fn is_audio_only(&self) -> bool {
        let no_video = self.vcodec.as_deref() == Some("none");
        let has_audio = self.acodec.as_deref().is_some_and(|a| a != "none");
        let single_get = matches!(self.protocol.as_deref(), None | Some("http") | Some("https"));
        no_video && has_audio && single_get && self.url.is_some()
    }

    fn rank(&self) -> (f64, f64, u64) {
        (
            self.abr.unwrap_or(0.0),
            self.tbr.unwrap_or(0.0),
            self.filesize.unwrap_or(0),
        )
    }
}

/// Highest-bitrate audio-only format; muxed formats are never picked.
pub fn select_audio_format(formats: &[FormatInfo]) -> Option<&FormatInfo> {
    formats
        .iter()
        .filter(|f| f.is_audio_only())
        .max_by(|a, b| {
            let (a_abr, a_tbr, a_size) = a.rank();
            let (b_abr, b_tbr, b_size) = b.rank();
            a_abr
                .total_cmp(&b_abr)
                .then(a_tbr.total_cmp(&b_tbr))
                .then(a_size.cmp(&b_size))
        })
}

/// Maps the extraction tool's diagnostics onto a short, loggable reason.
pub fn classify_failure(stderr: &str) -> &'static str {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("confirm your age") || lower.contains("age-restricted") {
        "age restricted"
    } else if lower.contains("available in your country")
        || lower.contains("geo restriction")
        || lower.contains("geo-restricted")
    {
        "region locked"
    } else if lower.contains("private video") {
        "private video"
    } else if lower.contains("video unavailable") || lower.contains("has been removed") {
        "unavailable"
    } else {
        "extraction failed"
    }
}

/// Resolver backed by the `yt-dlp` executable for metadata and `reqwest` for
/// the media bytes.
pub struct YtDlpResolver {
    program: String,
    extra_args: Vec<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            program: program.into(),
            extra_args: Vec::new(),
            timeout,
            client,
        })
    }

    /// Arguments placed before the resolver's own, e.g. `--cookies <file>`
    /// or `--proxy <url>`.
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    async fn extract_info(&self, locator: &Locator) -> Result<VideoInfo, ResolveError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .args(["-J", "--no-playlist", "--no-warnings"])
            .arg(locator.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ResolveError::ResolutionFailure(format!(
                    "{} timed out after {:?}",
                    self.program, self.timeout
                ))
            })?
            .map_err(|e| {
                ResolveError::ResolutionFailure(format!("{} could not run: {}", self.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::warn!(
                "Resolver: {} failed for {}: {}",
                self.program,
                locator,
                stderr.trim()
            );
            return Err(ResolveError::ResolutionFailure(
                classify_failure(&stderr).to_string(),
            ));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            ResolveError::ResolutionFailure(format!("malformed {} output: {}", self.program, e))
        })
    }

    async fn open(&self, format: &FormatInfo) -> Result<ByteStream, ResolveError> {
        let url = format
            .url
            .as_deref()
            .ok_or_else(|| ResolveError::ResolutionFailure("format has no url".to_string()))?;

        let response = self
            .client
            .get(url)
            .headers(header_map(&format.http_headers))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ResolveError::ResolutionFailure(format!("source request failed: {}", e)))?;

        let stream = response
            .bytes_stream()
            .map_err(|e| StreamError::Source(e.to_string()));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl Resolve for YtDlpResolver {
    async fn resolve(&self, locator: &Locator) -> Result<ByteStream, ResolveError> {
        let info = self.extract_info(locator).await?;
        let format = select_audio_format(&info.formats).ok_or_else(|| {
            ResolveError::ResolutionFailure("no audio-only representation".to_string())
        })?;
        log::info!(
            "Resolver: {} ({}) -> format {} abr={:?} acodec={:?}",
            locator.video_id(),
            info.title.as_deref().unwrap_or("untitled"),
            format.format_id,
            format.abr,
            format.acodec
        );
        self.open(format).await
    }
}

fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => log::debug!("Resolver: skip unusable header {}", name),
        }
    }
    map
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;
