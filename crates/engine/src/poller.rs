//! Interaction-gated polling of a single turtle.
//!
//! A [`Poller`] keeps a local copy of one turtle's state fresh. It refreshes on
//! a fixed delay while the user is idle, and only rechecks the
//! [`InteractionGate`] while the user is busy, so a long interaction postpones
//! refresh instead of queueing missed polls. Releasing the pointer triggers an
//! immediate refresh.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use turtledash_protocol::{CommandInput, Notice, RequestInfo, ResponseEnvelope, Turtle};

use crate::client::{ApiError, TurtleApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Delay between refreshes while the user is idle.
    pub poll_interval: Duration,
    /// How often the gate is rechecked while the user is interacting.
    pub recheck_interval: Duration,
    /// Delay before the refresh that follows a successful command.
    pub command_refresh_delay: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            recheck_interval: Duration::from_millis(500),
            command_refresh_delay: Duration::from_millis(500),
        }
    }
}

/// Whether the user is currently interacting with the page.
///
/// Shared between every poller of a process; handed in explicitly.
#[derive(Debug, Default)]
pub struct InteractionGate {
    active: AtomicBool,
}

impl InteractionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn end(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Holds the gate for the lifetime of a command send.
struct InteractionGuard<'a>(&'a InteractionGate);

impl<'a> InteractionGuard<'a> {
    fn hold(gate: &'a InteractionGate) -> Self {
        gate.begin();
        Self(gate)
    }
}

impl Drop for InteractionGuard<'_> {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// What a turtle view shows.
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub turtle: Option<Arc<Turtle>>,
    /// Full-page loading: only set by the initial fetch.
    pub loading: bool,
    pub background_loading: bool,
    pub last_api_response: Option<ResponseEnvelope>,
    pub last_command_response: Option<ResponseEnvelope>,
    pub notices: Vec<Notice>,
}

/// Result of one command send together with the envelope recorded for it.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub envelope: ResponseEnvelope,
    pub result: Result<Value, ApiError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub fetches_issued: u64,
    pub rechecks: u64,
}

struct Inner<A> {
    api: Arc<A>,
    turtle_id: u32,
    gate: Arc<InteractionGate>,
    config: PollerConfig,
    seq: AtomicU64,
    rechecks: AtomicU64,
    stopped: AtomicBool,
    /// Set by the initial fetch; taken by whichever response is applied first.
    initial_pending: AtomicBool,
    state: Mutex<ViewState>,
    snapshot_tx: watch::Sender<Option<Arc<Turtle>>>,
}

pub struct Poller<A: TurtleApi> {
    inner: Arc<Inner<A>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<A: TurtleApi> Poller<A> {
    pub fn new(
        api: Arc<A>,
        turtle_id: u32,
        gate: Arc<InteractionGate>,
        config: PollerConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                api,
                turtle_id,
                gate,
                config,
                seq: AtomicU64::new(0),
                rechecks: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                initial_pending: AtomicBool::new(false),
                state: Mutex::new(ViewState::default()),
                snapshot_tx,
            }),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn turtle_id(&self) -> u32 {
        self.inner.turtle_id
    }

    pub fn gate(&self) -> &Arc<InteractionGate> {
        &self.inner.gate
    }

    /// Issues the initial fetch and starts the polling loop. Idempotent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst)
        {
            return;
        }
        info!(turtle_id = self.inner.turtle_id, "poller started");
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run().await });
        self.tasks().push(handle);
    }

    /// Cancels the pending timer and update listeners. Terminal: responses
    /// still in flight are dropped when they resolve.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.tasks().drain(..) {
            handle.abort();
        }
        info!(turtle_id = self.inner.turtle_id, "poller stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Receiver that is marked changed only when the snapshot content changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Turtle>>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Calls `callback` with every new snapshot until the poller stops.
    pub fn on_update<F>(&self, mut callback: F)
    where
        F: FnMut(Option<Arc<Turtle>>) + Send + 'static,
    {
        if self.is_stopped() {
            return;
        }
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                callback(snapshot);
            }
        });
        self.tasks().push(handle);
    }

    pub fn view(&self) -> ViewState {
        self.inner.state().clone()
    }

    /// Drains the one-shot notices queued for the UI.
    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut self.inner.state().notices)
    }

    pub fn stats(&self) -> PollStats {
        PollStats {
            fetches_issued: self.inner.seq.load(Ordering::SeqCst),
            rechecks: self.inner.rechecks.load(Ordering::SeqCst),
        }
    }

    pub async fn fetch_snapshot(&self, initial: bool) {
        self.inner.fetch_snapshot(initial).await;
    }

    /// Fires a background fetch without waiting for it.
    pub fn refresh(&self) {
        self.inner.spawn_fetch(false);
    }

    pub fn pointer_down(&self) {
        self.inner.gate.begin();
    }

    pub fn pointer_up(&self) {
        self.inner.gate.end();
        self.refresh();
    }

    /// Posts `input` to the turtle while holding the interaction gate.
    ///
    /// The gate is released however the call ends. A successful send schedules
    /// a refresh shortly after. The returned envelope belongs to this call even
    /// when other sends overlap it.
    pub async fn send_command(&self, input: CommandInput) -> CommandOutcome {
        let inner = &self.inner;
        let _guard = InteractionGuard::hold(&inner.gate);

        let url = inner.api.turtle_url(inner.turtle_id);
        let result = inner.api.send_command(inner.turtle_id, &input).await;

        let mut envelope = match &result {
            Ok(data) => envelope_ok(data.clone(), url, input.request_info()),
            Err(err) => envelope_err(err, url, input.request_info()),
        };
        envelope.command = Some(input.to_value());
        envelope.is_lua_script = input.is_lua_script();
        inner.state().last_command_response = Some(envelope.clone());

        match &result {
            Ok(_) => {
                debug!(turtle_id = inner.turtle_id, "command sent");
                let follow_up = Arc::clone(inner);
                let delay = inner.config.command_refresh_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    follow_up.fetch_snapshot(false).await;
                });
            }
            Err(err) => {
                warn!(turtle_id = inner.turtle_id, kind = err.kind().as_str(), error = %err, "command failed");
            }
        }
        CommandOutcome { envelope, result }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<A: TurtleApi> Drop for Poller<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<A: TurtleApi> Inner<A> {
    fn state(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        self.spawn_fetch(true);
        loop {
            if self.gate.is_active() {
                self.rechecks.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.config.recheck_interval).await;
                continue;
            }
            tokio::time::sleep(self.config.poll_interval).await;
            // The user may have started interacting while we slept.
            if self.gate.is_active() {
                continue;
            }
            self.spawn_fetch(false);
        }
    }

    fn spawn_fetch(self: &Arc<Self>, initial: bool) {
        if self.is_stopped() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.fetch_snapshot(initial).await });
    }

    async fn fetch_snapshot(&self, initial: bool) {
        if self.is_stopped() {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut st = self.state();
            if initial {
                self.initial_pending.store(true, Ordering::SeqCst);
                st.loading = true;
            } else {
                st.background_loading = true;
            }
        }

        let url = self.api.turtle_url(self.turtle_id);
        let outcome = self
            .api
            .fetch_turtle(self.turtle_id)
            .await
            .and_then(|data| {
                let turtle = serde_json::from_value::<Option<Turtle>>(data.clone())?;
                Ok((data, turtle))
            });

        let mut st = self.state();
        if self.is_stopped() {
            return;
        }
        if self.seq.load(Ordering::SeqCst) != seq {
            debug!(turtle_id = self.turtle_id, seq, "dropping stale response");
            return;
        }
        st.loading = false;
        st.background_loading = false;
        // A newer fetch may have overtaken the initial one; the first applied
        // response still reports what the initial load would have.
        let initial = self.initial_pending.swap(false, Ordering::SeqCst);

        match outcome {
            Ok((data, turtle)) => {
                st.last_api_response = Some(envelope_ok(data, url, RequestInfo::get_json()));
                if turtle.is_none() && initial {
                    st.notices.push(Notice::destructive(
                        "Turtle not found",
                        format!("Could not find turtle with ID {}", self.turtle_id),
                    ));
                }
                self.apply_snapshot(&mut st, turtle);
            }
            Err(err) => {
                if initial {
                    warn!(turtle_id = self.turtle_id, kind = err.kind().as_str(), error = %err, "initial fetch failed");
                    st.notices.push(Notice::destructive(
                        "Error",
                        "Failed to fetch turtle data",
                    ));
                } else {
                    debug!(turtle_id = self.turtle_id, kind = err.kind().as_str(), error = %err, "background fetch failed");
                }
                st.last_api_response = Some(envelope_err(&err, url, RequestInfo::get_json()));
            }
        }
    }

    // Keeps the previous `Arc` when the content is unchanged so watchers see nothing.
    fn apply_snapshot(&self, st: &mut ViewState, next: Option<Turtle>) {
        let changed = match (&st.turtle, &next) {
            (Some(prev), Some(next)) => **prev != *next,
            (None, None) => false,
            _ => true,
        };
        if !changed {
            return;
        }
        let next = next.map(Arc::new);
        st.turtle = next.clone();
        self.snapshot_tx.send_replace(next);
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn envelope_ok(data: Value, url: String, request_info: RequestInfo) -> ResponseEnvelope {
    ResponseEnvelope {
        data,
        error: None,
        error_info: None,
        timestamp: now_rfc3339(),
        url,
        command: None,
        is_lua_script: false,
        request_info,
    }
}

fn envelope_err(err: &ApiError, url: String, request_info: RequestInfo) -> ResponseEnvelope {
    ResponseEnvelope {
        data: err.data(),
        error: Some(err.to_string()),
        error_info: Some(err.error_info()),
        timestamp: now_rfc3339(),
        url,
        command: None,
        is_lua_script: false,
        request_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    type Reply = (Duration, Result<Value, ApiError>);

    struct FakeApi {
        fetches: AtomicUsize,
        scripted: Mutex<VecDeque<Reply>>,
        fallback: Mutex<Result<Value, ApiError>>,
        command_reply: Mutex<Result<Value, ApiError>>,
        gate_during_send: Mutex<Option<bool>>,
        gate: Arc<InteractionGate>,
    }

    impl FakeApi {
        fn new(gate: Arc<InteractionGate>) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                scripted: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Ok(turtle_json("alpha"))),
                command_reply: Mutex::new(Ok(json!({ "ok": true }))),
                gate_during_send: Mutex::new(None),
                gate,
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn script(&self, delay: Duration, reply: Result<Value, ApiError>) {
            self.scripted.lock().unwrap().push_back((delay, reply));
        }
    }

    impl TurtleApi for FakeApi {
        fn turtle_url(&self, id: u32) -> String {
            format!("http://fake/api/turtle/{id}")
        }

        async fn list_turtles(&self) -> Result<Vec<Turtle>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_turtle(&self, _id: u32) -> Result<Value, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = self.scripted.lock().unwrap().pop_front();
            match next {
                Some((delay, reply)) => {
                    tokio::time::sleep(delay).await;
                    reply
                }
                None => self.fallback.lock().unwrap().clone(),
            }
        }

        async fn send_command(&self, _id: u32, input: &CommandInput) -> Result<Value, ApiError> {
            *self.gate_during_send.lock().unwrap() = Some(self.gate.is_active());
            if *input == CommandInput::Single("slow".into()) {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            let reply = self.command_reply.lock().unwrap().clone();
            reply.map(|mut data| {
                data["echo"] = input.to_value();
                data
            })
        }
    }

    fn turtle_json(name: &str) -> Value {
        json!({
            "id": 1,
            "name": name,
            "pos": { "x": 0, "y": 70, "z": 0, "r": 0, "rname": "north" },
            "fuel": { "current": 10, "max": 100 },
            "inventory": [],
            "cmdQueue": [],
            "heartbeat": 0
        })
    }

    fn setup() -> (Arc<FakeApi>, Arc<InteractionGate>, Poller<FakeApi>) {
        let gate = Arc::new(InteractionGate::new());
        let api = Arc::new(FakeApi::new(Arc::clone(&gate)));
        let poller = Poller::new(Arc::clone(&api), 1, Arc::clone(&gate), PollerConfig::default());
        (api, gate, poller)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_every_two_seconds_while_idle() {
        let (api, _gate, poller) = setup();
        poller.start();
        settle().await;
        assert_eq!(api.fetches(), 1);
        assert!(poller.view().turtle.is_some());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        settle().await;
        assert_eq!(api.fetches(), 2);

        tokio::time::sleep(Duration::from_millis(4000)).await;
        settle().await;
        assert_eq!(api.fetches(), 4);
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn interaction_suspends_polling_but_keeps_rechecking() {
        let (api, _gate, poller) = setup();
        poller.pointer_down();
        poller.start();
        settle().await;
        assert_eq!(api.fetches(), 1, "mount always loads once");

        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(api.fetches(), 1);
        assert!(poller.stats().rechecks >= 9);

        poller.pointer_up();
        settle().await;
        assert_eq!(api.fetches(), 2, "release refreshes immediately");

        tokio::time::sleep(Duration::from_millis(2600)).await;
        settle().await;
        assert!(api.fetches() >= 3);
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn identical_snapshot_keeps_reference() {
        let (_api, _gate, poller) = setup();
        let mut rx = poller.subscribe();

        poller.fetch_snapshot(true).await;
        assert!(rx.has_changed().unwrap());
        let first = rx.borrow_and_update().clone().unwrap();

        poller.fetch_snapshot(false).await;
        assert!(!rx.has_changed().unwrap());
        let view = poller.view();
        assert!(Arc::ptr_eq(&first, view.turtle.as_ref().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn changed_snapshot_notifies_listeners() {
        let (api, _gate, poller) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        poller.on_update(move |t| {
            sink.lock()
                .unwrap()
                .push(t.map(|t| t.name.clone()).unwrap_or_default());
        });

        poller.fetch_snapshot(true).await;
        settle().await;
        *api.fallback.lock().unwrap() = Ok(turtle_json("beta"));
        poller.fetch_snapshot(false).await;
        settle().await;
        poller.fetch_snapshot(false).await;
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["alpha", "beta"]);
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_response_is_not_applied() {
        let (api, _gate, poller) = setup();
        api.script(Duration::from_millis(300), Ok(turtle_json("old")));
        api.script(Duration::from_millis(10), Ok(turtle_json("new")));

        tokio::join!(poller.fetch_snapshot(false), poller.fetch_snapshot(false));

        let view = poller.view();
        assert_eq!(view.turtle.unwrap().name, "new");
        assert!(!view.background_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_failure_raises_notice_background_failure_is_silent() {
        let (api, _gate, poller) = setup();
        *api.fallback.lock().unwrap() = Err(ApiError::Http {
            status: 500,
            status_text: "Internal Server Error".into(),
            body: json!({ "error": "boom" }),
        });

        poller.fetch_snapshot(true).await;
        let view = poller.view();
        assert!(!view.loading);
        let env = view.last_api_response.unwrap();
        let info = env.error_info.unwrap();
        assert_eq!(info.kind, "HttpError");
        assert_eq!(info.status, Some(500));
        assert_eq!(poller.take_notices().len(), 1);

        *api.fallback.lock().unwrap() = Err(ApiError::Network {
            message: "Failed to fetch".into(),
            code: None,
        });
        poller.fetch_snapshot(false).await;
        assert!(poller.take_notices().is_empty());
        let env = poller.view().last_api_response.unwrap();
        assert_eq!(env.error_info.unwrap().kind, "NetworkError");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_turtle_on_initial_load_raises_notice() {
        let (api, _gate, poller) = setup();
        *api.fallback.lock().unwrap() = Ok(Value::Null);

        poller.fetch_snapshot(true).await;
        assert!(poller.view().turtle.is_none());
        let notices = poller.take_notices();
        assert_eq!(notices[0].title, "Turtle not found");
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_overtaking_initial_load_still_raises_notice() {
        let (api, _gate, poller) = setup();
        api.script(Duration::from_millis(300), Ok(Value::Null));
        api.script(Duration::from_millis(10), Ok(Value::Null));

        tokio::join!(poller.fetch_snapshot(true), poller.fetch_snapshot(false));

        let view = poller.view();
        assert!(!view.loading);
        assert!(!view.background_loading);
        let notices = poller.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].title, "Turtle not found");

        poller.fetch_snapshot(false).await;
        assert!(poller.take_notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_commands_each_get_their_own_envelope() {
        let (_api, _gate, poller) = setup();

        let (slow, fast) = tokio::join!(
            poller.send_command(CommandInput::Single("slow".into())),
            poller.send_command(CommandInput::Single("fast".into())),
        );

        assert_eq!(slow.envelope.command, Some(json!("slow")));
        assert_eq!(slow.envelope.data["echo"], "slow");
        assert_eq!(fast.envelope.command, Some(json!("fast")));
        assert_eq!(fast.envelope.data["echo"], "fast");

        let last = poller.view().last_command_response.unwrap();
        assert_eq!(last.command, Some(json!("slow")));
    }

    #[tokio::test(start_paused = true)]
    async fn command_holds_gate_and_refreshes_after_success() {
        let (api, gate, poller) = setup();

        let reply = poller
            .send_command(CommandInput::Single("forward".into()))
            .await
            .result
            .unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(*api.gate_during_send.lock().unwrap(), Some(true));
        assert!(!gate.is_active());

        let env = poller.view().last_command_response.unwrap();
        assert_eq!(env.command, Some(json!("forward")));
        assert_eq!(env.request_info.body.as_deref(), Some(r#"["forward"]"#));

        assert_eq!(api.fetches(), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(api.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_command_releases_gate_without_refresh() {
        let (api, gate, poller) = setup();
        *api.command_reply.lock().unwrap() = Err(ApiError::Network {
            message: "connection refused".into(),
            code: Some("ConnectionRefused".into()),
        });

        let outcome = poller
            .send_command(CommandInput::LuaScript("return 1".into()))
            .await;
        assert!(outcome.envelope.is_lua_script);
        let err = outcome.result.unwrap_err();
        assert_eq!(err.error_info().kind, "NetworkError");
        assert!(!gate.is_active());

        let env = poller.view().last_command_response.unwrap();
        assert!(env.is_lua_script);
        assert!(env.is_error());

        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(api.fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_terminal() {
        let (api, _gate, poller) = setup();
        poller.start();
        settle().await;
        poller.stop();

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        settle().await;
        assert_eq!(api.fetches(), 1);

        poller.start();
        poller.refresh();
        settle().await;
        assert_eq!(api.fetches(), 1);
    }
}
