//! The remote playback service.
//!
//! [`PlaybackService`] is the narrow interface through which the rest of
//! the crate talks to Spotify. [`WebApi`] implements it on top of the
//! Spotify Web API; tests substitute their own implementations.

use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    http::Client as HttpClient,
};

/// Identifier of a playback device, as reported by the Web Playback SDK.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps a device id.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is empty.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::invalid_argument("device id is empty"));
        }

        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The track that is currently loaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
}

/// Snapshot of the remote player, fetched on demand.
///
/// Never treat this as authoritative: by the time it is used, another client
/// may already have changed the remote state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerState {
    pub playing: bool,
    pub shuffle: bool,

    /// The active device, if any.
    pub device_id: Option<DeviceId>,

    pub track: Option<Track>,
}

/// Operations on the remote playback service.
///
/// Every call may fail with a transient network or service error.
#[async_trait]
pub trait PlaybackService: Send + Sync {
    async fn player_state(&self) -> Result<PlayerState>;
    async fn play(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn next(&self) -> Result<()>;
    async fn previous(&self) -> Result<()>;
    async fn shuffle(&self, state: bool) -> Result<()>;

    /// Transfers playback to `device_id`, optionally starting playback.
    async fn transfer_playback(&self, device_id: &DeviceId, play: bool) -> Result<()>;
}

/// Spotify Web API client for the player endpoints.
pub struct WebApi {
    http_client: HttpClient,
    base_url: Url,
}

/// Playback state as returned by `GET /me/player`.
///
/// Only the fields that are used are declared.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PlaybackResponse {
    device: Option<DeviceResponse>,
    shuffle_state: bool,
    is_playing: bool,
    item: Option<ItemResponse>,
}

#[derive(Debug, Deserialize)]
struct DeviceResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<ArtistResponse>,
}

#[derive(Debug, Deserialize)]
struct ArtistResponse {
    name: String,
}

impl From<PlaybackResponse> for PlayerState {
    fn from(response: PlaybackResponse) -> Self {
        let device_id = response
            .device
            .and_then(|device| device.id)
            .and_then(|id| DeviceId::new(id).ok());

        let track = response.item.map(|item| Track {
            id: item.id.unwrap_or_default(),
            name: item.name,
            artists: item.artists.into_iter().map(|artist| artist.name).collect(),
        });

        Self {
            playing: response.is_playing,
            shuffle: response.shuffle_state,
            device_id,
            track,
        }
    }
}

impl WebApi {
    /// Creates a Web API client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(config)?,
            base_url: config.api_url.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(Into::into)
    }

    /// Sends `request` and returns the body of a successful response.
    async fn send(&self, request: reqwest::Request) -> Result<(StatusCode, Vec<u8>)> {
        let method = request.method().clone();
        let path = request.url().path().to_owned();
        trace!("{method} {path}");

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if !status.is_success() {
            let message = String::from_utf8_lossy(&body);
            return Err(Error::from_status(
                status,
                format!("{method} {path} returned {status}: {message}"),
            ));
        }

        Ok((status, body))
    }

    async fn command(&self, request: reqwest::Request) -> Result<()> {
        self.send(request).await.map(|_| ())
    }

    /// Parses the body of a `GET /me/player` response.
    ///
    /// `204 No Content` means no device is active.
    fn parse_player_state(status: StatusCode, body: &[u8]) -> Result<PlayerState> {
        if status == StatusCode::NO_CONTENT || body.is_empty() {
            return Ok(PlayerState::default());
        }

        let response: PlaybackResponse = serde_json::from_slice(body)?;
        Ok(response.into())
    }
}

#[async_trait]
impl PlaybackService for WebApi {
    async fn player_state(&self) -> Result<PlayerState> {
        let request = self.http_client.get(self.url("me/player")?);
        let (status, body) = self.send(request).await?;
        Self::parse_player_state(status, &body)
    }

    async fn play(&self) -> Result<()> {
        let request = self.http_client.put(self.url("me/player/play")?, "");
        self.command(request).await
    }

    async fn pause(&self) -> Result<()> {
        let request = self.http_client.put(self.url("me/player/pause")?, "");
        self.command(request).await
    }

    async fn next(&self) -> Result<()> {
        let request = self.http_client.post(self.url("me/player/next")?, "");
        self.command(request).await
    }

    async fn previous(&self) -> Result<()> {
        let request = self.http_client.post(self.url("me/player/previous")?, "");
        self.command(request).await
    }

    async fn shuffle(&self, state: bool) -> Result<()> {
        let mut url = self.url("me/player/shuffle")?;
        url.query_pairs_mut()
            .append_pair("state", if state { "true" } else { "false" });
        let request = self.http_client.put(url, "");
        self.command(request).await
    }

    async fn transfer_playback(&self, device_id: &DeviceId, play: bool) -> Result<()> {
        let body = json!({
            "device_ids": [device_id.as_str()],
            "play": play,
        });
        let request = self
            .http_client
            .put(self.url("me/player")?, serde_json::to_vec(&body)?);
        self.command(request).await
    }
}
