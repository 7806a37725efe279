use std::time::Duration;

use url::Url;

use crate::token::AccessToken;

/// Runtime configuration, constructed once at startup and handed to every
/// component that needs it.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Name of the playback device as shown in Spotify clients.
    pub device_name: String,

    /// Initial volume of the browser-side player, from 0.0 to 1.0.
    pub volume: f32,

    /// Start playing on the new device right after transfer.
    pub transfer_autoplay: bool,

    pub user_agent: String,

    pub access_token: AccessToken,

    /// Base URL of the Web API, with trailing slash.
    pub api_url: Url,

    /// DevTools endpoint of the browser, either `http://` for discovery or
    /// the `ws://` debugger URL itself.
    pub devtools_url: Url,

    /// Location of the Web Playback SDK script.
    pub sdk_url: Url,

    /// How long command and notification sends wait for a free slot.
    pub send_timeout: Duration,

    /// How long the handshake waits for the browser to report a device id.
    pub handshake_timeout: Duration,

    /// Handshake attempts before giving up.
    pub handshake_attempts: u32,

    /// Interval between player state polls for track changes.
    pub poll_interval: Duration,
}

impl Config {
    pub const DEFAULT_API_URL: &'static str = "https://api.spotify.com/v1/";
    pub const DEFAULT_DEVTOOLS_URL: &'static str = "http://127.0.0.1:9222";
    pub const DEFAULT_SDK_URL: &'static str = "https://sdk.scdn.co/spotify-player.js";

    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
    pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 3;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_VOLUME: f32 = 0.5;

    /// Creates a configuration with defaults for everything but the token.
    #[must_use]
    pub fn with_access_token(access_token: AccessToken) -> Self {
        let app_name = env!("CARGO_PKG_NAME");
        let app_version = env!("CARGO_PKG_VERSION");

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        let device_name = sysinfo::System::host_name()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| app_name.to_owned());

        Self {
            device_name,
            volume: Self::DEFAULT_VOLUME,
            transfer_autoplay: true,

            user_agent,
            access_token,

            api_url: Self::parse_default(Self::DEFAULT_API_URL),
            devtools_url: Self::parse_default(Self::DEFAULT_DEVTOOLS_URL),
            sdk_url: Self::parse_default(Self::DEFAULT_SDK_URL),

            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_attempts: Self::DEFAULT_HANDSHAKE_ATTEMPTS,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// # Panics
    ///
    /// Panics if a built-in default URL is invalid.
    fn parse_default(url: &str) -> Url {
        Url::parse(url).expect("invalid default url")
    }
}
