//! Test doubles shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    browser::{Allocation, Browser, BrowserEvent, Context},
    error::{Error, Result},
    handshake::BINDING_NAME,
    remote::{DeviceId, PlaybackService, PlayerState},
};

/// A call received by [`FakeService`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    PlayerState,
    Play,
    Pause,
    Next,
    Previous,
    Shuffle(bool),
    Transfer(DeviceId, bool),
}

/// Playback service that records calls and serves a scripted state.
#[derive(Debug, Default)]
pub struct FakeService {
    state: Mutex<PlayerState>,
    calls: Mutex<Vec<Call>>,
    fail_state: AtomicBool,
    fail_actions: AtomicBool,
}

impl FakeService {
    pub fn with_state(state: PlayerState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    pub fn set_state(&self, state: PlayerState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn fail_state(&self, fail: bool) {
        self.fail_state.store(fail, Ordering::SeqCst);
    }

    pub fn fail_actions(&self, fail: bool) {
        self.fail_actions.store(fail, Ordering::SeqCst);
    }

    /// Every call, including state reads.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Every call that changes remote state.
    pub fn actions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| *call != Call::PlayerState)
            .collect()
    }

    fn record(&self, call: Call) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(Error::unavailable("service down"));
        }
        Ok(())
    }
}

#[async_trait]
impl PlaybackService for FakeService {
    async fn player_state(&self) -> Result<PlayerState> {
        self.calls.lock().unwrap().push(Call::PlayerState);
        if self.fail_state.load(Ordering::SeqCst) {
            return Err(Error::unavailable("service down"));
        }
        Ok(self.state.lock().unwrap().clone())
    }

    async fn play(&self) -> Result<()> {
        self.record(Call::Play)
    }

    async fn pause(&self) -> Result<()> {
        self.record(Call::Pause)
    }

    async fn next(&self) -> Result<()> {
        self.record(Call::Next)
    }

    async fn previous(&self) -> Result<()> {
        self.record(Call::Previous)
    }

    async fn shuffle(&self, state: bool) -> Result<()> {
        self.record(Call::Shuffle(state))
    }

    async fn transfer_playback(&self, device_id: &DeviceId, play: bool) -> Result<()> {
        self.record(Call::Transfer(device_id.clone(), play))
    }
}

/// What a [`FakeBrowser`] page does during one allocation.
#[derive(Clone, Debug, Default)]
pub struct Script {
    pub fail_allocation: bool,
    pub fail_evaluate: bool,

    /// Raised once the SDK loader has been evaluated.
    pub on_load: Vec<BrowserEvent>,
}

impl Script {
    /// A page whose player reports each of `ids` in turn.
    pub fn reporting(ids: &[&str]) -> Self {
        Self {
            on_load: ids.iter().map(|id| binding(&format!("[\"{id}\"]"))).collect(),
            ..Self::default()
        }
    }
}

/// A `sendDeviceID` call with a raw payload.
pub fn binding(payload: &str) -> BrowserEvent {
    BrowserEvent::BindingCalled {
        name: BINDING_NAME.to_owned(),
        payload: payload.to_owned(),
    }
}

/// What the pages of a [`FakeBrowser`] were asked to do.
#[derive(Debug, Default)]
pub struct PageLog {
    pub allocations: AtomicUsize,
    pub releases: AtomicUsize,
    pub dialogs_accepted: AtomicUsize,
    pub bindings: Mutex<Vec<String>>,
    pub scripts: Mutex<Vec<String>>,
}

/// Browser whose pages follow one [`Script`] per allocation.
///
/// Allocations beyond the scripted ones get a page that never reports a
/// device.
#[derive(Debug, Default)]
pub struct FakeBrowser {
    scripts: Mutex<VecDeque<Script>>,
    pub log: Arc<PageLog>,
}

impl FakeBrowser {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            log: Arc::default(),
        }
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn allocate(&self) -> Result<Allocation> {
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        self.log.allocations.fetch_add(1, Ordering::SeqCst);
        if script.fail_allocation {
            return Err(Error::unavailable("browser unreachable"));
        }

        let (tx, events) = mpsc::channel(16);
        Ok(Allocation {
            context: Arc::new(FakePage {
                script,
                log: Arc::clone(&self.log),
                events: tx,
            }),
            events,
        })
    }
}

struct FakePage {
    script: Script,
    log: Arc<PageLog>,
    events: mpsc::Sender<BrowserEvent>,
}

#[async_trait]
impl Context for FakePage {
    async fn navigate(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn add_binding(&self, name: &str) -> Result<()> {
        self.log.bindings.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<()> {
        self.log.scripts.lock().unwrap().push(expression.to_owned());
        if self.script.fail_evaluate {
            return Err(Error::invalid_argument("SyntaxError"));
        }

        if expression.contains("createElement") {
            for event in &self.script.on_load {
                self.events.try_send(event.clone()).unwrap();
            }
        }
        Ok(())
    }

    async fn accept_dialog(&self) -> Result<()> {
        self.log.dialogs_accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.log.releases.fetch_add(1, Ordering::SeqCst);
    }
}
