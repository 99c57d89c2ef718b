//! Keeps the broadcast title in line with the entry that should be playing.
//!
//! The notifier runs its own clock: it advances an elapsed counter on every
//! tick and derives the current entry from it, independent of what the loop
//! controller is actually streaming.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::playlist::Playlist;
use crate::{Error, Result};

pub const DEFAULT_TITLE_PREFIX: &str = "[24/7 VOD] ";

const TWITCH_API_BASE: &str = "https://api.twitch.tv/helix";
const TWITCH_AUTH_BASE: &str = "https://id.twitch.tv/oauth2";

/// Publishes a new broadcast title.
#[async_trait]
pub trait TitleUpdater: Send + Sync {
    async fn update_title(&self, title: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TitleSyncConfig {
    pub enabled: bool,
    pub prefix: String,
    pub interval_secs: u64,
    /// Twitch application client id.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Broadcaster whose channel title is changed.
    pub channel_id: Option<String>,
    /// Directory holding `tokens.<channel_id>.json`.
    pub token_dir: PathBuf,
}

impl Default for TitleSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: DEFAULT_TITLE_PREFIX.to_string(),
            interval_secs: 10,
            client_id: None,
            client_secret: None,
            channel_id: None,
            token_dir: PathBuf::from("./token"),
        }
    }
}

impl TitleSyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Build the updater these settings describe.
    ///
    /// Without a channel id titles are only logged.
    pub fn build_updater(&self) -> Result<Arc<dyn TitleUpdater>> {
        let Some(channel_id) = self.channel_id.as_deref().filter(|id| !id.is_empty()) else {
            info!("No Twitch channel configured, titles will only be logged");
            return Ok(Arc::new(LogTitleUpdater));
        };

        let client_id = self
            .client_id
            .clone()
            .ok_or_else(|| Error::config("CLIENTID is required for title sync"))?;
        let client_secret = self
            .client_secret
            .clone()
            .ok_or_else(|| Error::config("CLIENTSECRET is required for title sync"))?;

        let updater = TwitchTitleUpdater::new(
            TwitchCredentials {
                client_id,
                client_secret,
                broadcaster_id: channel_id.to_string(),
            },
            &self.token_dir,
        )?;
        Ok(Arc::new(updater))
    }
}

/// Periodically derives the current entry title and publishes changes.
pub struct TitleSync {
    playlist: Arc<Playlist>,
    updater: Arc<dyn TitleUpdater>,
    prefix: String,
    interval: Duration,
}

impl TitleSync {
    pub fn new(
        playlist: Arc<Playlist>,
        updater: Arc<dyn TitleUpdater>,
        prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            playlist,
            updater,
            prefix: prefix.into(),
            interval,
        }
    }

    /// Prefixed title of the entry playing at `elapsed_ms`.
    pub fn title_for(&self, elapsed_ms: u64) -> String {
        format!("{}{}", self.prefix, self.playlist.current(elapsed_ms).title)
    }

    /// Publish the title at start and re-evaluate on every tick until
    /// cancelled. Failed updates are retried on the next tick.
    pub async fn run(&self, seed_ms: u64, cancel: CancellationToken) {
        let mut elapsed_ms = seed_ms;
        let mut published: Option<String> = None;
        self.sync(elapsed_ms, &mut published).await;

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    elapsed_ms += self.interval.as_millis() as u64;
                    self.sync(elapsed_ms, &mut published).await;
                }
            }
        }
        debug!("Title sync stopped");
    }

    async fn sync(&self, elapsed_ms: u64, published: &mut Option<String>) {
        let title = self.title_for(elapsed_ms);
        if published.as_deref() == Some(title.as_str()) {
            return;
        }
        match self.updater.update_title(&title).await {
            Ok(()) => {
                info!(title = %title, "Broadcast title changed");
                *published = Some(title);
            }
            Err(e) => warn!(title = %title, error = %e, "Failed to change broadcast title"),
        }
    }
}

/// Updater used when no broadcast platform is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTitleUpdater;

#[async_trait]
impl TitleUpdater for LogTitleUpdater {
    async fn update_title(&self, title: &str) -> Result<()> {
        info!(title, "Title change (not published)");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TwitchCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub broadcaster_id: String,
}

/// Stored user token, in the layout the token file has always used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub obtainment_timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Vec<String>,
}

/// Twitch Helix channel title updater with refreshing user tokens.
pub struct TwitchTitleUpdater {
    client: Client,
    credentials: TwitchCredentials,
    token_path: PathBuf,
    tokens: Mutex<TokenData>,
    api_base: String,
    auth_base: String,
}

impl TwitchTitleUpdater {
    /// Load the broadcaster's tokens from `<token_dir>/tokens.<id>.json`.
    pub fn new(credentials: TwitchCredentials, token_dir: &Path) -> Result<Self> {
        let token_path = token_dir.join(format!("tokens.{}.json", credentials.broadcaster_id));
        let content = std::fs::read(&token_path).map_err(|e| {
            Error::config(format!("cannot read token file {}: {e}", token_path.display()))
        })?;
        let tokens: TokenData = serde_json::from_slice(&content).map_err(|e| {
            Error::config(format!("invalid token file {}: {e}", token_path.display()))
        })?;

        Ok(Self {
            client: Client::new(),
            credentials,
            token_path,
            tokens: Mutex::new(tokens),
            api_base: TWITCH_API_BASE.to_string(),
            auth_base: TWITCH_AUTH_BASE.to_string(),
        })
    }

    /// Point the updater at different API hosts.
    pub fn with_endpoints(mut self, api_base: impl Into<String>, auth_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.auth_base = auth_base.into();
        self
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    async fn patch_title(&self, access_token: &str, title: &str) -> Result<StatusCode> {
        let response = self
            .client
            .patch(format!("{}/channels", self.api_base))
            .query(&[("broadcaster_id", self.credentials.broadcaster_id.as_str())])
            .header("Client-Id", &self.credentials.client_id)
            .bearer_auth(access_token)
            .json(&json!({ "title": title }))
            .send()
            .await
            .map_err(|e| Error::TitleUpdate(format!("request failed: {e}")))?;
        Ok(response.status())
    }

    async fn refresh(&self) -> Result<String> {
        let refresh_token = self
            .tokens
            .lock()
            .refresh_token
            .clone()
            .ok_or_else(|| Error::TitleUpdate("access token expired and no refresh token".into()))?;

        debug!("Refreshing Twitch access token");
        let response = self
            .client
            .post(format!("{}/token", self.auth_base))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::TitleUpdate(format!("token refresh failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TitleUpdate(format!("token refresh failed: {status} - {body}")));
        }
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| Error::TitleUpdate(format!("invalid token response: {e}")))?;

        let obtainment_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let snapshot = {
            let mut tokens = self.tokens.lock();
            tokens.access_token = refreshed.access_token.clone();
            if refreshed.refresh_token.is_some() {
                tokens.refresh_token = refreshed.refresh_token;
            }
            tokens.expires_in = refreshed.expires_in;
            tokens.scope = refreshed.scope;
            tokens.obtainment_timestamp = obtainment_timestamp;
            tokens.clone()
        };

        // The refresh token may have rotated; losing it would lock us out.
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&self.token_path, json).await {
                    warn!(path = %self.token_path.display(), error = %e, "Failed to persist refreshed token");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode refreshed token"),
        }

        Ok(refreshed.access_token)
    }
}

#[async_trait]
impl TitleUpdater for TwitchTitleUpdater {
    async fn update_title(&self, title: &str) -> Result<()> {
        let token = self.tokens.lock().access_token.clone();
        let mut status = self.patch_title(&token, title).await?;

        if status == StatusCode::UNAUTHORIZED {
            let token = self.refresh().await?;
            status = self.patch_title(&token, title).await?;
        }

        if status.is_success() {
            Ok(())
        } else {
            Err(Error::TitleUpdate(format!("Helix returned {status}")))
        }
    }
}
