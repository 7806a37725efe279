//! Headless browser hosting the Web Playback SDK.
//!
//! [`Browser`] allocates isolated page contexts. Each allocation comes with
//! the stream of [`BrowserEvent`]s raised by its page. [`Chrome`] implements
//! it for any Chromium-based browser started with
//! `--remote-debugging-port`.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use crate::{
    cdp::{CdpEvent, Connection},
    config::Config,
    error::{Error, Result},
};

/// Something the page did that the host may want to react to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrowserEvent {
    /// A page script called a binding registered with
    /// [`Context::add_binding`].
    BindingCalled { name: String, payload: String },

    /// A JavaScript dialog (`alert`, `confirm`, `prompt` or
    /// `beforeunload`) opened and blocks the page until it is handled.
    DialogOpening { kind: String, message: String },

    /// A page script logged to the console.
    ConsoleApiCalled { level: String, text: String },

    /// An exception went uncaught.
    ExceptionThrown { text: String },
}

/// Capability a [`BrowserEvent`] belongs to. Listeners are keyed by it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Binding,
    Dialog,
    Console,
    Exception,
}

impl BrowserEvent {
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Self::BindingCalled { .. } => Category::Binding,
            Self::DialogOpening { .. } => Category::Dialog,
            Self::ConsoleApiCalled { .. } => Category::Console,
            Self::ExceptionThrown { .. } => Category::Exception,
        }
    }

    /// Translates a DevTools event. Returns `None` for events of no
    /// interest.
    #[must_use]
    pub fn from_cdp(event: &CdpEvent) -> Option<Self> {
        let params = &event.params;
        let string = |key: &str| {
            params
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };

        match event.method.as_str() {
            "Runtime.bindingCalled" => Some(Self::BindingCalled {
                name: string("name"),
                payload: string("payload"),
            }),
            "Page.javascriptDialogOpening" => Some(Self::DialogOpening {
                kind: string("type"),
                message: string("message"),
            }),
            "Runtime.consoleAPICalled" => {
                let text = params
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|args| {
                        args.iter()
                            .map(remote_object_text)
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                Some(Self::ConsoleApiCalled {
                    level: string("type"),
                    text,
                })
            }
            "Runtime.exceptionThrown" => {
                let details = params.get("exceptionDetails")?;
                let text = details
                    .get("exception")
                    .and_then(|exception| exception.get("description"))
                    .or_else(|| details.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown exception")
                    .to_owned();
                Some(Self::ExceptionThrown { text })
            }
            _ => None,
        }
    }
}

impl fmt::Display for BrowserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindingCalled { name, payload } => write!(f, "binding {name}({payload})"),
            Self::DialogOpening { kind, message } => write!(f, "{kind} dialog: {message}"),
            Self::ConsoleApiCalled { level, text } => write!(f, "console.{level}: {text}"),
            Self::ExceptionThrown { text } => write!(f, "uncaught {text}"),
        }
    }
}

/// Renders a `Runtime.RemoteObject` the way a console would.
fn remote_object_text(object: &Value) -> String {
    match object.get("value") {
        Some(Value::String(value)) => value.clone(),
        Some(value) => value.to_string(),
        None => object
            .get("description")
            .or_else(|| object.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
    }
}

/// An isolated page context together with its events.
pub struct Allocation {
    pub context: Arc<dyn Context>,

    /// Events of this context only. Ends when the context is released.
    pub events: mpsc::Receiver<BrowserEvent>,
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Allocates a fresh page context.
    async fn allocate(&self) -> Result<Allocation>;
}

/// A page in the browser.
#[async_trait]
pub trait Context: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Exposes `window.<name>(payload)` to page scripts. Calls surface as
    /// [`BrowserEvent::BindingCalled`].
    async fn add_binding(&self, name: &str) -> Result<()>;

    /// Evaluates `expression` in the page.
    async fn evaluate(&self, expression: &str) -> Result<()>;

    /// Accepts the open JavaScript dialog.
    async fn accept_dialog(&self) -> Result<()>;

    /// Closes the page. Idempotent, and safe to call from `Drop`.
    fn release(&self);
}

/// A Chromium-based browser reachable over the DevTools protocol.
pub struct Chrome {
    http_client: reqwest::Client,
    devtools_url: Url,
}

impl Chrome {
    /// Events buffered per page before the translator waits.
    const EVENT_BUFFER: usize = 16;

    const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Self::DISCOVERY_TIMEOUT)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            http_client,
            devtools_url: config.devtools_url.clone(),
        })
    }

    /// Opens a page on `connection` and attaches to it.
    async fn open(connection: &Connection) -> Result<(String, String)> {
        let target = connection
            .call("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::data_loss("Target.createTarget returned no targetId"))?
            .to_owned();

        let session = connection
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = session
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::data_loss("Target.attachToTarget returned no sessionId"))?
            .to_owned();

        for domain in ["Page.enable", "Runtime.enable"] {
            connection.call(domain, json!({}), Some(session_id.as_str())).await?;
        }

        Ok((target_id, session_id))
    }
}

#[async_trait]
impl Browser for Chrome {
    async fn allocate(&self) -> Result<Allocation> {
        let ws_url = Connection::discover(&self.http_client, &self.devtools_url).await?;
        let (connection, mut raw_events) = Connection::connect(&ws_url).await?;

        let (target_id, session_id) = match Self::open(&connection).await {
            Ok(ids) => ids,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };
        debug!("allocated page {target_id} in session {session_id}");

        let (event_tx, events) = mpsc::channel(Self::EVENT_BUFFER);
        let filter = session_id.clone();
        tokio::spawn(async move {
            while let Some(event) = raw_events.recv().await {
                if event.session_id.as_deref() != Some(filter.as_str()) {
                    continue;
                }
                if let Some(event) = BrowserEvent::from_cdp(&event) {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Allocation {
            context: Arc::new(Tab {
                connection,
                target_id,
                session_id,
                released: AtomicBool::new(false),
            }),
            events,
        })
    }
}

/// A page attached over its own DevTools connection.
struct Tab {
    connection: Connection,
    target_id: String,
    session_id: String,
    released: AtomicBool,
}

impl Tab {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.connection
            .call(method, params, Some(self.session_id.as_str()))
            .await
    }
}

#[async_trait]
impl Context for Tab {
    async fn navigate(&self, url: &str) -> Result<()> {
        let result = self.call("Page.navigate", json!({ "url": url })).await?;
        match result.get("errorText").and_then(Value::as_str) {
            Some(error) => Err(Error::unavailable(format!("navigating to {url}: {error}"))),
            None => Ok(()),
        }
    }

    async fn add_binding(&self, name: &str) -> Result<()> {
        self.call("Runtime.addBinding", json!({ "name": name }))
            .await
            .map(|_| ())
    }

    async fn evaluate(&self, expression: &str) -> Result<()> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;

        match result.get("exceptionDetails") {
            Some(details) => {
                let text = details
                    .get("exception")
                    .and_then(|exception| exception.get("description"))
                    .or_else(|| details.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("script threw");
                Err(Error::invalid_argument(text.to_owned()))
            }
            None => Ok(()),
        }
    }

    async fn accept_dialog(&self) -> Result<()> {
        self.call("Page.handleJavaScriptDialog", json!({ "accept": true }))
            .await
            .map(|_| ())
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("releasing page {}", self.target_id);
        let connection = self.connection.clone();
        let target_id = self.target_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = connection
                        .call("Target.closeTarget", json!({ "targetId": target_id }), None)
                        .await
                    {
                        debug!("closing page {target_id}: {e}");
                    }
                    connection.close();
                });
            }
            // Outside a runtime the browser closes the page along with the
            // connection.
            Err(_) => connection.close(),
        }
    }
}

impl Drop for Tab {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cdp(method: &str, params: Value) -> CdpEvent {
        CdpEvent {
            method: method.to_owned(),
            params,
            session_id: Some("S1".to_owned()),
        }
    }

    #[test]
    fn translates_binding_calls() {
        let event = BrowserEvent::from_cdp(&cdp(
            "Runtime.bindingCalled",
            json!({ "name": "sendDeviceID", "payload": "[\"A\"]", "executionContextId": 1 }),
        ))
        .unwrap();

        assert_eq!(
            event,
            BrowserEvent::BindingCalled {
                name: "sendDeviceID".to_owned(),
                payload: "[\"A\"]".to_owned(),
            }
        );
        assert_eq!(event.category(), Category::Binding);
    }

    #[test]
    fn translates_dialogs() {
        let event = BrowserEvent::from_cdp(&cdp(
            "Page.javascriptDialogOpening",
            json!({ "url": "about:blank", "message": "Leave?", "type": "beforeunload" }),
        ))
        .unwrap();

        assert_eq!(event.category(), Category::Dialog);
        assert_eq!(event.to_string(), "beforeunload dialog: Leave?");
    }

    #[test]
    fn joins_console_arguments() {
        let event = BrowserEvent::from_cdp(&cdp(
            "Runtime.consoleAPICalled",
            json!({
                "type": "error",
                "args": [
                    { "type": "string", "value": "authentication_error" },
                    { "type": "number", "value": 401 },
                    { "type": "object", "description": "Object" },
                ],
            }),
        ))
        .unwrap();

        assert_eq!(
            event,
            BrowserEvent::ConsoleApiCalled {
                level: "error".to_owned(),
                text: "authentication_error 401 Object".to_owned(),
            }
        );
    }

    #[test]
    fn prefers_exception_descriptions() {
        let event = BrowserEvent::from_cdp(&cdp(
            "Runtime.exceptionThrown",
            json!({
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": { "description": "ReferenceError: Spotify is not defined" },
                },
            }),
        ))
        .unwrap();

        assert_eq!(
            event,
            BrowserEvent::ExceptionThrown {
                text: "ReferenceError: Spotify is not defined".to_owned(),
            }
        );
    }

    #[test]
    fn ignores_other_events() {
        assert!(BrowserEvent::from_cdp(&cdp("Page.loadEventFired", json!({}))).is_none());
    }
}
