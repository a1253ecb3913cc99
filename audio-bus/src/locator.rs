use url::Url;

use crate::source::ResolveError;

/// Hosts accepted when no explicit allow-list is configured.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

const VIDEO_ID_LEN: usize = 11;

/// A locator that passed [`LocatorPolicy::validate`]. Only the policy can
/// build one, so anything holding a `Locator` has already been screened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    url: Url,
    video_id: String,
}

impl Locator {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// URL-shape, scheme and host checks applied before any external tool runs.
#[derive(Debug, Clone)]
pub struct LocatorPolicy {
    allowed_hosts: Vec<String>,
}

impl Default for LocatorPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_HOSTS.iter().copied())
    }
}

impl LocatorPolicy {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_hosts = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self { allowed_hosts }
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed_hosts.iter().any(|h| *h == host)
    }

    pub fn validate(&self, raw: &str) -> Result<Locator, ResolveError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ResolveError::InvalidLocator("empty locator".to_string()));
        }
        let url = Url::parse(raw)
            .map_err(|e| ResolveError::InvalidLocator(format!("not a url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ResolveError::InvalidLocator(format!(
                "scheme {} is not allowed",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ResolveError::InvalidLocator("missing host".to_string()))?;
        if !self.allows_host(host) {
            return Err(ResolveError::InvalidLocator(format!(
                "host {} is not allowed",
                host
            )));
        }
        let video_id = video_id(&url)
            .ok_or_else(|| ResolveError::InvalidLocator("no video id".to_string()))?;

        Ok(Locator { url, video_id })
    }
}

/// Extracts the video id from `watch?v=`, `youtu.be/<id>`, `/shorts/<id>`,
/// `/embed/<id>` and `/live/<id>` shapes.
fn video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let mut segments = url.path_segments()?;

    let candidate = if host.eq_ignore_ascii_case("youtu.be") {
        segments.next().map(str::to_string)
    } else {
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned()),
            Some("shorts") | Some("embed") | Some("live") | Some("v") => {
                segments.next().map(str::to_string)
            }
            _ => None,
        }
    }?;

    is_video_id(&candidate).then_some(candidate)
}

fn is_video_id(s: &str) -> bool {
    s.len() == VIDEO_ID_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
#[path = "locator_test.rs"]
mod locator_test;
