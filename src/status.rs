//! Online-user count from the backend's status endpoint.
//!
//! Polled only while the chat connection is open: once on connect,
//! then every `poll_interval`. Polling stops as soon as the connection
//! leaves `Open` and resumes on the next open.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::chat::ChatError;
use crate::client::ConnectionStatus;

/// HTTP request timeout for a single status fetch.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// Body of `GET /status`; other fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub client_count: u32,
}

/// Source of status reports.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self) -> Result<StatusReport, ChatError>;
}

/// Fetches the status report over HTTP.
pub struct HttpStatusSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpStatusSource {
    pub fn new(url: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self) -> Result<StatusReport, ChatError> {
        let report = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json::<StatusReport>()
            .await?;
        debug!("Status response: {} clients", report.client_count);
        Ok(report)
    }
}

/// Runs until the connection status channel closes, publishing the
/// latest client count to `count`. Failed fetches keep the last count.
pub async fn poll_while_connected<S: StatusSource>(
    source: S,
    mut status: watch::Receiver<ConnectionStatus>,
    count: watch::Sender<Option<u32>>,
    poll_interval: Duration,
) {
    loop {
        // Wait for the connection to open
        if status.wait_for(|s| s.connected()).await.is_err() {
            break;
        }
        info!("Connected, polling status every {}s", poll_interval.as_secs());

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match source.fetch().await {
                    Ok(report) => {
                        count.send_if_modified(|current| {
                            let changed = *current != Some(report.client_count);
                            *current = Some(report.client_count);
                            changed
                        });
                    }
                    Err(e) => warn!("Error fetching user count: {e}"),
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !status.borrow_and_update().connected() {
                        debug!("Disconnected, status polling paused");
                        break;
                    }
                }
            }
        }
    }
}
