//! Bootstrap client for the control plane: the allowed-channel list for
//! the channel picker and the advertised software version.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use funk_protocol::types::{all_channels, ChannelId};

#[derive(Debug, Deserialize)]
struct ChannelEntry {
    channel_id: ChannelId,
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub changelog: String,
}

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(host: &str, port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base: format!("http://{}:{}", host, port),
            http,
        }
    }

    /// Fetch the channels this credential may use. Any failure falls back
    /// to the full channel plan so the picker is never empty.
    pub async fn allowed_channels(&self, funk_key: &str) -> Vec<ChannelId> {
        let url = format!("{}/api/channels/{}", self.base, funk_key);
        match self.fetch_channels(&url).await {
            Ok(channels) if !channels.is_empty() => {
                info!(count = channels.len(), "channel list loaded from server");
                channels
            }
            Ok(_) => {
                warn!("server returned an empty channel list, using full plan");
                all_channels()
            }
            Err(e) => {
                warn!("channel list fetch failed ({}), using full plan", e);
                all_channels()
            }
        }
    }

    async fn fetch_channels(&self, url: &str) -> Result<Vec<ChannelId>, reqwest::Error> {
        let response = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<ChannelsResponse>()
            .await?;
        Ok(response.channels.into_iter().map(|c| c.channel_id).collect())
    }

    /// The server's advertised client version, if reachable.
    pub async fn version(&self) -> Option<VersionInfo> {
        let url = format!("{}/api/version", self.base);
        match self.http.get(&url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => response.json::<VersionInfo>().await.ok(),
                Err(e) => {
                    warn!("version check failed: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("version check unreachable: {}", e);
                None
            }
        }
    }
}
