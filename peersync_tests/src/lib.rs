//! Shared helpers for the integration tests.

use std::time::Duration;

use anyhow::Context;
use peersync_client::{SceneBinding, SyncClient};

/// How long any single wait may take before a test fails.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Handles transport events until `done` holds.
pub async fn pump_until<B, F>(
    client: &mut SyncClient<B>,
    what: &str,
    mut done: F,
) -> anyhow::Result<()>
where
    B: SceneBinding,
    F: FnMut(&SyncClient<B>) -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !done(client) {
            if !client.step().await {
                anyhow::bail!("transport ended while waiting for {what}");
            }
        }
        Ok(())
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))?
}
