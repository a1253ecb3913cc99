use std::process::Stdio;

use tokio::process::Command;

/// Checks that an external tool can be launched by running it with
/// `version_arg`. Call once at startup so a missing binary is reported early
/// instead of on the first request.
pub async fn probe_tool(program: &str, version_arg: &str) -> anyhow::Result<()> {
    let status = Command::new(program)
        .arg(version_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("{} could not be launched: {}", program, e))?;
    if !status.success() {
        return Err(anyhow::anyhow!("{} {} exited with {}", program, version_arg, status));
    }
    Ok(())
}

pub mod locator;
pub mod pool;
pub mod source;
pub mod stream;
pub mod transcode;
