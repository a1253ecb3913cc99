use std::{str::FromStr, time::Duration};

use audio_bus::locator::DEFAULT_ALLOWED_HOSTS;

/// Runtime settings, read once at startup and handed to whoever needs them.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub max_jobs: usize,
    pub max_transcoders: usize,
    pub job_timeout: Duration,
    pub stall_timeout: Duration,
    pub kill_grace: Duration,
    pub resolve_timeout: Duration,
    pub ytdlp_bin: String,
    pub ytdlp_args: Vec<String>,
    pub ffmpeg_bin: String,
    pub allowed_hosts: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_jobs: 4,
            max_transcoders: 4,
            job_timeout: Duration::from_secs(600),
            stall_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(3),
            resolve_timeout: Duration::from_secs(30),
            ytdlp_bin: "yt-dlp".to_string(),
            ytdlp_args: Vec::new(),
            ffmpeg_bin: "ffmpeg".to_string(),
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparseable values
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let max_jobs = parse_or(get("MAX_JOBS"), "MAX_JOBS", defaults.max_jobs).max(1);
        let max_transcoders =
            parse_or(get("MAX_TRANSCODERS"), "MAX_TRANSCODERS", max_jobs).max(1);

        Self {
            port: parse_or(get("PORT"), "PORT", defaults.port),
            max_jobs,
            max_transcoders,
            job_timeout: secs_or(get("JOB_TIMEOUT_SECS"), "JOB_TIMEOUT_SECS", defaults.job_timeout),
            stall_timeout: secs_or(
                get("STALL_TIMEOUT_SECS"),
                "STALL_TIMEOUT_SECS",
                defaults.stall_timeout,
            ),
            kill_grace: secs_or(get("KILL_GRACE_SECS"), "KILL_GRACE_SECS", defaults.kill_grace),
            resolve_timeout: secs_or(
                get("RESOLVE_TIMEOUT_SECS"),
                "RESOLVE_TIMEOUT_SECS",
                defaults.resolve_timeout,
            ),
            ytdlp_bin: get("YTDLP_BIN").unwrap_or(defaults.ytdlp_bin),
            ytdlp_args: get("YTDLP_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.ytdlp_args),
            ffmpeg_bin: get("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
            allowed_hosts: get("ALLOWED_HOSTS")
                .map(|v| {
                    v.split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.allowed_hosts),
        }
    }
}

fn parse_or<T: FromStr + Copy>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        None => default,
        Some(v) => v.parse().unwrap_or_else(|_| {
            log::warn!("Config: ignoring unparseable {}={:?}", key, v);
            default
        }),
    }
}

fn secs_or(value: Option<String>, key: &str, default: Duration) -> Duration {
    match parse_or::<u64>(value, key, 0) {
        0 => default,
        secs => Duration::from_secs(secs),
    }
}
