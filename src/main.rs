use std::sync::Arc;

use audio_bus::{
    locator::LocatorPolicy, pool::ProcessPool, source::YtDlpResolver,
    transcode::FfmpegTranscoder,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RelayConfig,
    handler::ytmp3::AppState,
    relay::{RelayController, RelaySettings, gate::AdmissionGate},
};

mod api;
mod config;
mod handler;
mod relay;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("audio_bus", log::LevelFilter::Debug)
        .filter_module("ffmpeg", log::LevelFilter::Warn)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = RelayConfig::from_env();
    log::info!("Config: {:?}", config);

    for (tool, version_arg) in [
        (config.ytdlp_bin.as_str(), "--version"),
        (config.ffmpeg_bin.as_str(), "-version"),
    ] {
        if let Err(e) = audio_bus::probe_tool(tool, version_arg).await {
            log::warn!("{} is not usable, conversions will fail: {:#}", tool, e);
        }
    }

    let resolver = YtDlpResolver::new(config.ytdlp_bin.clone(), config.resolve_timeout)
        .unwrap_or_else(|e| {
            log::error!("Error building resolver: {:#}", e);
            std::process::exit(1);
        })
        .with_extra_args(config.ytdlp_args.clone());
    let transcoder = FfmpegTranscoder::new(
        config.ffmpeg_bin.clone(),
        ProcessPool::new(config.max_transcoders),
    );

    let cancel = CancellationToken::new();

    let relay = RelayController::new(
        AdmissionGate::new(config.max_jobs),
        LocatorPolicy::new(&config.allowed_hosts),
        Arc::new(resolver),
        Arc::new(transcoder),
        RelaySettings::from_config(&config),
        cancel.child_token(),
    );
    let state = AppState {
        relay: Arc::new(relay),
    };

    let cancel_clone = cancel.clone();
    let server = api::start_api_server(&config, state, cancel_clone);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    // in-flight jobs are already cancelled; give their connections a moment to close
    let drain = config.kill_grace * 2;
    let code = match tokio::time::timeout(drain, server).await {
        Ok(result) => exit_code(result),
        Err(_) => {
            log::warn!("API server still draining after {:?}, exiting", drain);
            0
        }
    };

    std::process::exit(code);
}

fn exit_code(server: Result<anyhow::Result<()>, tokio::task::JoinError>) -> i32 {
    match server {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::error!("API server failed: {:#}", e);
            1
        }
        Err(e) => {
            log::error!("API server task failed: {}", e);
            1
        }
    }
}
