//! Minimal Chrome DevTools Protocol client.
//!
//! Speaks just enough of the protocol to drive a single page: commands are
//! sent as JSON text frames and correlated with their responses by id,
//! everything without an id is an event and is forwarded on a bounded
//! channel. Sessions use the flat mode, where commands and events carry a
//! `sessionId` instead of being wrapped in `Target.sendMessageToTarget`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WebsocketMessage;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};

/// An unsolicited message from the browser.
#[derive(Clone, Debug, PartialEq)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// A decoded text frame.
#[derive(Debug)]
enum Frame {
    Response { id: u64, result: Result<Value> },
    Event(CdpEvent),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Incoming {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<ProtocolError>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProtocolError {
    code: i64,
    message: String,
}

impl Frame {
    fn parse(text: &str) -> Result<Self> {
        let incoming: Incoming = serde_json::from_str(text)?;

        if let Some(id) = incoming.id {
            let result = match incoming.error {
                Some(error) => Err(Error::failed_precondition(format!(
                    "devtools error {}: {}",
                    error.code, error.message
                ))),
                None => Ok(incoming.result.unwrap_or(Value::Null)),
            };
            return Ok(Self::Response { id, result });
        }

        match incoming.method {
            Some(method) => Ok(Self::Event(CdpEvent {
                method,
                params: incoming.params,
                session_id: incoming.session_id,
            })),
            None => Err(Error::invalid_argument(
                "devtools message without id or method",
            )),
        }
    }
}

type Pending = HashMap<u64, oneshot::Sender<Result<Value>>>;

#[derive(Default)]
struct Shared {
    pending: Mutex<Pending>,
    closed: CancellationToken,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail_pending(&self) {
        for (_, tx) in self.pending().drain() {
            let _ = tx.send(Err(Error::cancelled("devtools connection closed")));
        }
    }
}

/// A websocket connection to a DevTools endpoint.
///
/// Cloning yields another handle to the same connection. The connection
/// stays open until [`close`](Self::close) is called or the browser hangs
/// up.
#[derive(Clone)]
pub struct Connection {
    outgoing: mpsc::UnboundedSender<WebsocketMessage>,
    next_id: Arc<AtomicU64>,
    shared: Arc<Shared>,
}

/// Response to `GET /json/version`.
#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "Browser", default)]
    browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

impl Connection {
    /// How long a command may take before it is abandoned.
    const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

    /// Events buffered before the reader waits for the consumer.
    const EVENT_BUFFER: usize = 64;

    /// Resolves the browser websocket URL of a DevTools endpoint.
    ///
    /// `ws://` and `wss://` URLs are returned as is. Anything else is
    /// treated as the HTTP endpoint and asked for `/json/version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be reached or answers with
    /// something unexpected.
    pub async fn discover(http_client: &reqwest::Client, endpoint: &Url) -> Result<Url> {
        if matches!(endpoint.scheme(), "ws" | "wss") {
            return Ok(endpoint.clone());
        }

        let url = endpoint.join("json/version")?;
        let response = http_client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        let version: VersionResponse = serde_json::from_slice(&body)?;
        debug!("devtools endpoint runs {}", version.browser);

        Url::parse(&version.web_socket_debugger_url).map_err(Into::into)
    }

    /// Connects to `url` and returns the connection and its event stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the websocket handshake fails.
    pub async fn connect(url: &Url) -> Result<(Self, mpsc::Receiver<CdpEvent>)> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        debug!("connected to {url}");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<WebsocketMessage>();
        let (event_tx, event_rx) = mpsc::channel(Self::EVENT_BUFFER);
        let shared = Arc::new(Shared::default());

        // Writer: forwards queued frames and says goodbye on close.
        let closed = shared.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = closed.cancelled() => {
                        let _ = ws_tx.send(WebsocketMessage::Close(None)).await;
                        break;
                    }

                    message = outgoing_rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = ws_tx.send(message).await {
                                error!("error sending devtools message: {e}");
                                closed.cancel();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        // Reader: resolves pending commands and forwards events.
        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;

                    () = reader_shared.closed.cancelled() => break,

                    message = ws_rx.next() => match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            error!("error receiving devtools message: {e}");
                            break;
                        }
                        None => break,
                    }
                };

                if message.is_close() {
                    debug!("devtools connection closed by browser");
                    break;
                }

                if !message.is_text() {
                    trace!("ignoring non-text devtools frame");
                    continue;
                }

                let text = match message.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("error decoding devtools frame: {e}");
                        continue;
                    }
                };

                match Frame::parse(text) {
                    Ok(Frame::Response { id, result }) => {
                        match reader_shared.pending().remove(&id) {
                            Some(tx) => {
                                let _ = tx.send(result);
                            }
                            None => trace!("response to abandoned command {id}"),
                        }
                    }
                    Ok(Frame::Event(event)) => {
                        trace!("devtools event {}", event.method);
                        if event_tx.send(event).await.is_err() {
                            trace!("devtools event dropped: nobody listening");
                        }
                    }
                    Err(e) => error!("error parsing devtools message: {e}"),
                }
            }

            reader_shared.closed.cancel();
            reader_shared.fail_pending();
        });

        Ok((
            Self {
                outgoing,
                next_id: Arc::new(AtomicU64::new(1)),
                shared,
            },
            event_rx,
        ))
    }

    /// Sends a command and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed, the browser rejects
    /// the command, or no response arrives within the command timeout.
    pub async fn call(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::unavailable(format!(
                "cannot send {method}: devtools connection closed"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(session_id) = session_id {
            request["sessionId"] = Value::from(session_id);
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        trace!("devtools command {id}: {method}");
        if self
            .outgoing
            .send(WebsocketMessage::text(request.to_string()))
            .is_err()
        {
            self.shared.pending().remove(&id);
            return Err(Error::unavailable(format!(
                "cannot send {method}: devtools writer stopped"
            )));
        }

        match tokio::time::timeout(Self::COMMAND_TIMEOUT, rx).await {
            Ok(Ok(result)) => result.map_err(|e| Error::new(e.kind, format!("{method}: {}", e.error))),
            Ok(Err(_)) => Err(Error::cancelled(format!(
                "{method}: devtools connection closed"
            ))),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(Error::deadline_exceeded(format!(
                    "{method}: no response within {:.1}s",
                    Self::COMMAND_TIMEOUT.as_secs_f32()
                )))
            }
        }
    }

    /// Closes the connection. Pending commands fail.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.fail_pending();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}
