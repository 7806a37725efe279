//! Device handshake with the Web Playback SDK.
//!
//! The SDK only runs in a browser. A handshake allocates a page, exposes a
//! binding to it, injects a bootstrap script that creates the player and
//! loads the SDK, then waits for the player to report its device id through
//! the binding. Playback is finally transferred to that device.
//!
//! The page must outlive the handshake: it *is* the playback device. A
//! successful handshake therefore returns a [`Device`] that keeps the page
//! open until it is dropped. Failed handshakes release their page right
//! away.
//!
//! Only the first device id reported within an attempt counts. Later ones
//! (the SDK re-reports after reconnecting) are logged and dropped.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use exponential_backoff::Backoff;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    browser::{Browser, BrowserEvent, Category, Context},
    config::Config,
    error::{Error, ErrorKind, Result},
    remote::{DeviceId, PlaybackService},
    token::AccessToken,
};

/// Name of the binding through which the page reports its device id.
pub const BINDING_NAME: &str = "sendDeviceID";

/// Progress of a handshake attempt.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Stage {
    #[default]
    Idle,
    AllocatingContext,
    NavigatingBlank,
    BindingRegistered,
    ScriptInjected,
    AwaitingDeviceId,
    DeviceIdReceived,
    TimedOut,
    TransferringPlayback,
    Ready,

    AllocationFailed,
    InjectionFailed,
    HandshakeTimeout,
    TransferFailed,
    Cancelled,
}

impl Stage {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ready
                | Self::AllocationFailed
                | Self::InjectionFailed
                | Self::HandshakeTimeout
                | Self::TransferFailed
                | Self::Cancelled
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Idle => "idle",
            Self::AllocatingContext => "allocating context",
            Self::NavigatingBlank => "navigating to blank page",
            Self::BindingRegistered => "binding registered",
            Self::ScriptInjected => "script injected",
            Self::AwaitingDeviceId => "awaiting device id",
            Self::DeviceIdReceived => "device id received",
            Self::TransferringPlayback => "transferring playback",
            Self::Ready => "ready",
            Self::AllocationFailed => "allocation failed",
            Self::InjectionFailed => "injection failed",
            Self::TimedOut => "timed out",
            Self::HandshakeTimeout => "handshake timeout",
            Self::TransferFailed => "transfer failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{stage}")
    }
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("cannot allocate browser context: {0}")]
    AllocationFailed(#[source] Error),

    #[error("injection failed after {stage}: {error}")]
    InjectionFailed {
        stage: Stage,
        #[source]
        error: Error,
    },

    #[error("no device id within {:.1}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("cannot transfer playback to {device_id}: {error}")]
    TransferFailed {
        device_id: DeviceId,
        #[source]
        error: Error,
    },

    #[error("handshake cancelled")]
    Cancelled,
}

impl HandshakeError {
    /// Stage in which an attempt ending with this error stops.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::AllocationFailed(_) => Stage::AllocationFailed,
            Self::InjectionFailed { .. } => Stage::InjectionFailed,
            Self::Timeout(_) => Stage::HandshakeTimeout,
            Self::TransferFailed { .. } => Stage::TransferFailed,
            Self::Cancelled => Stage::Cancelled,
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Cancellation is final, and so is a transfer the service refuses to
    /// authorize: a fresh device will not fix a bad token.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::TransferFailed { error, .. } => !matches!(
                error.kind,
                ErrorKind::Unauthenticated | ErrorKind::PermissionDenied
            ),
            _ => true,
        }
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        let kind = match &e {
            HandshakeError::AllocationFailed(_) => ErrorKind::Unavailable,
            HandshakeError::InjectionFailed { .. } => ErrorKind::FailedPrecondition,
            HandshakeError::Timeout(_) => ErrorKind::DeadlineExceeded,
            HandshakeError::TransferFailed { error, .. } => error.kind,
            HandshakeError::Cancelled => ErrorKind::Cancelled,
        };
        Self::new(kind, e)
    }
}

/// Decodes a binding payload: a JSON array holding the device id.
///
/// # Errors
///
/// Returns an error if the payload is not a one-element string array or
/// the id is empty.
pub fn decode_device_id(payload: &str) -> Result<DeviceId> {
    let ids: Vec<String> = serde_json::from_str(payload)?;
    match <[String; 1]>::try_from(ids) {
        Ok([id]) => DeviceId::new(id),
        Err(ids) => Err(Error::invalid_argument(format!(
            "expected one device id, got {}",
            ids.len()
        ))),
    }
}

/// Write end of the single device id slot of an attempt.
#[derive(Clone, Debug)]
pub struct SlotSender(mpsc::Sender<DeviceId>);

impl SlotSender {
    /// Offers a device id. Returns whether the slot took it.
    pub fn offer(&self, device_id: DeviceId) -> bool {
        match self.0.try_send(device_id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(device_id)) => {
                debug!("already have a device id, dropping {device_id}");
                false
            }
            Err(mpsc::error::TrySendError::Closed(device_id)) => {
                debug!("handshake is over, dropping {device_id}");
                false
            }
        }
    }
}

/// Holds at most one device id. Later offers are dropped, never block.
#[derive(Debug)]
pub struct DeviceSlot {
    tx: mpsc::Sender<DeviceId>,
    rx: mpsc::Receiver<DeviceId>,
}

impl Default for DeviceSlot {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx }
    }
}

impl DeviceSlot {
    #[must_use]
    pub fn sender(&self) -> SlotSender {
        SlotSender(self.tx.clone())
    }

    /// Waits for the device id.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Timeout`] if nothing arrives within
    /// `timeout`, or [`HandshakeError::Cancelled`] once `cancel` fires.
    pub async fn wait(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<DeviceId, HandshakeError> {
        tokio::select! {
            biased;

            () = cancel.cancelled() => Err(HandshakeError::Cancelled),

            device_id = self.rx.recv() => device_id.ok_or(HandshakeError::Cancelled),

            () = tokio::time::sleep(timeout) => Err(HandshakeError::Timeout(timeout)),
        }
    }
}

type Listener = Box<dyn Fn(BrowserEvent) + Send + Sync>;

/// Reactions to browser events, one per [`Category`].
#[derive(Default)]
pub struct Listeners {
    table: HashMap<Category, Listener>,
}

impl Listeners {
    /// Registers `listener` for `category`, replacing any previous one.
    pub fn on<F>(&mut self, category: Category, listener: F) -> &mut Self
    where
        F: Fn(BrowserEvent) + Send + Sync + 'static,
    {
        self.table.insert(category, Box::new(listener));
        self
    }

    /// Passes `event` to its listener. Returns whether one was registered.
    pub fn handle(&self, event: BrowserEvent) -> bool {
        match self.table.get(&event.category()) {
            Some(listener) => {
                listener(event);
                true
            }
            None => {
                trace!("unhandled browser event: {event}");
                false
            }
        }
    }

    /// The listeners of a handshake attempt:
    ///
    /// * device id reports fill `slot`
    /// * dialogs are accepted, so they never block the page
    /// * console output and exceptions are logged
    #[must_use]
    pub fn for_handshake(context: Arc<dyn Context>, slot: SlotSender) -> Self {
        let mut listeners = Self::default();

        listeners
            .on(Category::Binding, move |event| {
                let BrowserEvent::BindingCalled { name, payload } = event else {
                    return;
                };
                if name != BINDING_NAME {
                    trace!("ignoring binding {name}");
                    return;
                }
                match decode_device_id(&payload) {
                    Ok(device_id) => {
                        slot.offer(device_id);
                    }
                    Err(e) => warn!("ignoring device id report {payload}: {e}"),
                }
            })
            .on(Category::Dialog, move |event| {
                debug!("accepting {event}");
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    if let Err(e) = context.accept_dialog().await {
                        warn!("cannot accept dialog: {e}");
                    }
                });
            })
            .on(Category::Console, |event| {
                if let BrowserEvent::ConsoleApiCalled { level, text } = &event {
                    match level.as_str() {
                        "error" | "assert" => error!("player: {text}"),
                        "warning" | "warn" => warn!("player: {text}"),
                        _ => debug!("player: {text}"),
                    }
                }
            })
            .on(Category::Exception, |event| {
                warn!("player: {event}");
            });

        listeners
    }
}

/// Keeps a page open and its listeners running. Releases both on drop.
struct PageGuard {
    context: Arc<dyn Context>,
    listener: JoinHandle<()>,
}

impl PageGuard {
    fn spawn(
        context: Arc<dyn Context>,
        mut events: mpsc::Receiver<BrowserEvent>,
        listeners: Listeners,
    ) -> Self {
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                listeners.handle(event);
            }
            trace!("browser event stream ended");
        });

        Self { context, listener }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.listener.abort();
        self.context.release();
    }
}

/// A playback device hosted by a browser page.
///
/// Dropping it closes the page, which takes the device offline.
pub struct Device {
    id: DeviceId,
    _guard: PageGuard,
}

impl Device {
    #[must_use]
    pub fn id(&self) -> &DeviceId {
        &self.id
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("id", &self.id).finish()
    }
}

/// Creates the player once the SDK has loaded.
const PLAYER_SCRIPT: &str = r"
window.onSpotifyWebPlaybackSDKReady = () => {
  const player = new Spotify.Player({
    name: __NAME__,
    getOAuthToken: callback => callback(__TOKEN__),
    volume: __VOLUME__,
  });
  player.addListener('ready', ({ device_id }) => {
    window.__BINDING__(JSON.stringify([device_id]));
  });
  player.addListener('not_ready', ({ device_id }) => {
    console.warn('device went offline:', device_id);
  });
  for (const name of ['initialization_error', 'authentication_error', 'account_error', 'playback_error']) {
    player.addListener(name, ({ message }) => console.error(name + ':', message));
  }
  player.connect();
};
";

/// Loads the SDK, which calls `onSpotifyWebPlaybackSDKReady` when done.
const LOADER_SCRIPT: &str = r"
(() => {
  const script = document.createElement('script');
  script.src = __SDK_URL__;
  script.onerror = () => console.error('cannot load ' + script.src);
  document.head.appendChild(script);
})();
";

/// Sets up a playback device in the browser.
pub struct Handshake {
    browser: Arc<dyn Browser>,
    service: Arc<dyn PlaybackService>,

    access_token: AccessToken,
    device_name: String,
    volume: f32,
    sdk_url: Url,
    autoplay: bool,

    timeout: Duration,
    attempts: u32,

    stage: watch::Sender<Stage>,
}

impl Handshake {
    const MIN_BACKOFF: Duration = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    #[must_use]
    pub fn new(
        config: &Config,
        browser: Arc<dyn Browser>,
        service: Arc<dyn PlaybackService>,
    ) -> Self {
        Self {
            browser,
            service,
            access_token: config.access_token.clone(),
            device_name: config.device_name.clone(),
            volume: config.volume.clamp(0.0, 1.0),
            sdk_url: config.sdk_url.clone(),
            autoplay: config.transfer_autoplay,
            timeout: config.handshake_timeout,
            attempts: config.handshake_attempts.max(1),
            stage: watch::Sender::new(Stage::Idle),
        }
    }

    /// The stage of the current or last attempt.
    #[must_use]
    pub fn stage(&self) -> Stage {
        *self.stage.borrow()
    }

    fn enter(&self, stage: Stage) {
        debug!("handshake: {stage}");
        self.stage.send_replace(stage);
    }

    /// The bootstrap script, with every value JSON-encoded so that it reads
    /// as a literal.
    fn player_script(&self) -> Result<String> {
        Ok(PLAYER_SCRIPT
            .replace("__NAME__", &serde_json::to_string(&self.device_name)?)
            .replace(
                "__TOKEN__",
                &serde_json::to_string(self.access_token.as_str())?,
            )
            .replace("__VOLUME__", &serde_json::to_string(&self.volume)?)
            .replace("__BINDING__", BINDING_NAME))
    }

    fn loader_script(&self) -> Result<String> {
        Ok(LOADER_SCRIPT.replace("__SDK_URL__", &serde_json::to_string(self.sdk_url.as_str())?))
    }

    /// Runs a single attempt.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt failed. The page allocated for it, if
    /// any, has been released.
    pub async fn run(&self, cancel: &CancellationToken) -> std::result::Result<Device, HandshakeError> {
        let result = self.attempt(cancel).await;
        match &result {
            Ok(device) => info!("playback device {} ready", device.id()),
            Err(e) => self.enter(e.stage()),
        }
        result
    }

    async fn attempt(&self, cancel: &CancellationToken) -> std::result::Result<Device, HandshakeError> {
        self.enter(Stage::AllocatingContext);
        let allocation = tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(HandshakeError::Cancelled),

            allocation = self.browser.allocate() => {
                allocation.map_err(HandshakeError::AllocationFailed)?
            }
        };

        let slot = DeviceSlot::default();
        let listeners = Listeners::for_handshake(Arc::clone(&allocation.context), slot.sender());
        let guard = PageGuard::spawn(allocation.context, allocation.events, listeners);

        tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(HandshakeError::Cancelled),

            injected = self.inject(guard.context.as_ref()) => injected?,
        }

        self.enter(Stage::AwaitingDeviceId);
        let device_id = match slot.wait(self.timeout, cancel).await {
            Ok(device_id) => device_id,
            Err(e) => {
                if matches!(e, HandshakeError::Timeout(_)) {
                    self.enter(Stage::TimedOut);
                }
                return Err(e);
            }
        };
        self.enter(Stage::DeviceIdReceived);
        info!("browser reported device id {device_id}");

        self.enter(Stage::TransferringPlayback);
        if let Err(error) = self
            .service
            .transfer_playback(&device_id, self.autoplay)
            .await
        {
            return Err(HandshakeError::TransferFailed { device_id, error });
        }

        self.enter(Stage::Ready);
        Ok(Device {
            id: device_id,
            _guard: guard,
        })
    }

    async fn inject(&self, context: &dyn Context) -> std::result::Result<(), HandshakeError> {
        let failed = |stage: Stage| move |error: Error| HandshakeError::InjectionFailed { stage, error };

        self.enter(Stage::NavigatingBlank);
        context
            .navigate("about:blank")
            .await
            .map_err(failed(Stage::NavigatingBlank))?;
        context
            .add_binding(BINDING_NAME)
            .await
            .map_err(failed(Stage::NavigatingBlank))?;

        self.enter(Stage::BindingRegistered);
        let player = self.player_script().map_err(failed(Stage::BindingRegistered))?;
        context
            .evaluate(&player)
            .await
            .map_err(failed(Stage::BindingRegistered))?;
        let loader = self.loader_script().map_err(failed(Stage::BindingRegistered))?;
        context
            .evaluate(&loader)
            .await
            .map_err(failed(Stage::BindingRegistered))?;

        self.enter(Stage::ScriptInjected);
        Ok(())
    }

    /// Runs attempts with exponential backoff until one succeeds, a
    /// non-retryable error occurs, or the attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn run_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<Device, HandshakeError> {
        let backoff = Backoff::new(self.attempts, Self::MIN_BACKOFF, Self::MAX_BACKOFF);
        let mut last_error = None;

        for (attempt, delay) in (&backoff).into_iter().enumerate() {
            let e = match self.run(cancel).await {
                Ok(device) => return Ok(device),
                Err(e) => e,
            };

            if !e.is_retryable() {
                return Err(e);
            }

            let Some(delay) = delay else {
                return Err(e);
            };

            warn!(
                "handshake attempt {} failed: {e}; retrying in {:.1}s",
                attempt + 1,
                delay.as_secs_f32()
            );
            last_error = Some(e);

            tokio::select! {
                biased;

                () = cancel.cancelled() => return Err(HandshakeError::Cancelled),

                () = tokio::time::sleep(delay) => {}
            }
        }

        Err(last_error.unwrap_or(HandshakeError::Cancelled))
    }
}
