use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use turtledash_engine::{
    HttpTurtleApi, InteractionGate, Poller, PollerConfig, SettingsStore, TurtleApi,
};
use turtledash_protocol::{CommandInput, FuelLevel, Notice, ResponseEnvelope, Turtle};


type TurtlePoller = Poller<HttpTurtleApi>;
type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;

pub struct AppState {
    pub settings: SettingsStore,
    pub gate: Arc<InteractionGate>,
    pub poller_config: PollerConfig,
    sessions: Mutex<Sessions>,
}

/// One poller per turtle currently open in a detail view.
struct Sessions {
    api: Arc<HttpTurtleApi>,
    pollers: HashMap<u32, Arc<TurtlePoller>>,
}

impl AppState {
    pub fn new(settings: SettingsStore, poller_config: PollerConfig) -> anyhow::Result<Self> {
        let base_url = settings.api_base_url()?;
        info!(%base_url, "using turtle api");
        Ok(Self {
            settings,
            gate: Arc::new(InteractionGate::new()),
            poller_config,
            sessions: Mutex::new(Sessions {
                api: Arc::new(HttpTurtleApi::new(base_url)),
                pollers: HashMap::new(),
            }),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn api(&self) -> Arc<HttpTurtleApi> {
        Arc::clone(&self.sessions().api)
    }

    /// Opens the view for `id`, starting its poller unless it is already open.
    pub fn open_session(&self, id: u32) -> Arc<TurtlePoller> {
        let mut sessions = self.sessions();
        if let Some(poller) = sessions.pollers.get(&id) {
            return Arc::clone(poller);
        }
        let poller = self.start_poller(Arc::clone(&sessions.api), id);
        sessions.pollers.insert(id, Arc::clone(&poller));
        info!(turtle_id = id, "view opened");
        poller
    }

    /// The poller of an open view. Never starts one.
    pub fn session(&self, id: u32) -> Option<Arc<TurtlePoller>> {
        self.sessions().pollers.get(&id).cloned()
    }

    fn start_poller(&self, api: Arc<HttpTurtleApi>, id: u32) -> Arc<TurtlePoller> {
        let poller = Arc::new(Poller::new(
            api,
            id,
            Arc::clone(&self.gate),
            self.poller_config,
        ));
        poller.start();
        poller
    }

    pub fn close_session(&self, id: u32) -> bool {
        let removed = self.sessions().pollers.remove(&id);
        match removed {
            Some(poller) => {
                poller.stop();
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions().pollers.len()
    }

    /// Points every future request at `base_url` and restarts open views against it.
    fn switch_api(&self, base_url: &str) {
        let mut sessions = self.sessions();
        let api = Arc::new(HttpTurtleApi::new(base_url));
        let open: Vec<u32> = sessions.pollers.keys().copied().collect();
        for id in open {
            let next = self.start_poller(Arc::clone(&api), id);
            if let Some(prev) = sessions.pollers.insert(id, next) {
                prev.stop();
            }
        }
        sessions.api = api;
        info!(%base_url, "turtle api changed");
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/health", get(health))
        .route("/api/turtles", get(api_list_turtles))
        .route("/api/turtles/{id}", get(api_turtle_view))
        .route("/api/turtles/{id}/open", post(api_open_view))
        .route("/api/turtles/{id}/interaction", post(api_interaction))
        .route("/api/turtles/{id}/command", post(api_send_command))
        .route("/api/turtles/{id}/close", post(api_close_view))
        .route(
            "/api/settings",
            get(api_get_settings)
                .put(api_put_settings)
                .delete(api_reset_settings),
        )
        .with_state(state)
        // Local security: allow only loopback + Tailscale by default.
        .layer(middleware::from_fn(ip_allowlist))
        // This service can drive real turtles; never use `Access-Control-Allow-Origin: *`.
        .layer(local_only_cors())
}

async fn health() -> &'static str {
    "ok"
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn open_session_or_404(
    state: &AppState,
    id: u32,
) -> Result<Arc<TurtlePoller>, (StatusCode, Json<Value>)> {
    state.session(id).ok_or_else(|| {
        error_body(
            StatusCode::NOT_FOUND,
            format!("turtle {id} is not open; POST /api/turtles/{id}/open first"),
        )
    })
}

/// Values derived from a snapshot at read time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurtleStatus {
    pub offline: bool,
    pub fuel_percentage: f64,
    pub fuel_level: FuelLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_command_ok: Option<bool>,
}

impl TurtleStatus {
    fn of(turtle: &Turtle, now_ms: i64) -> Self {
        Self {
            offline: turtle.is_offline(now_ms),
            fuel_percentage: turtle.fuel.percentage(),
            fuel_level: turtle.fuel.level(),
            last_command_ok: turtle.command_result().map(|(ok, _)| ok),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurtleCard {
    pub turtle: Turtle,
    pub status: TurtleStatus,
}

async fn api_list_turtles(State(state): State<Arc<AppState>>) -> ApiResult<Vec<TurtleCard>> {
    let api = state.api();
    let turtles = api.list_turtles().await.map_err(|err| {
        warn!(kind = err.kind().as_str(), error = %err, "list turtles failed");
        (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({
                "error": err.to_string(),
                "errorInfo": err.error_info(),
                "data": err.data(),
            })),
        )
    })?;
    let now = now_ms();
    Ok(Json(
        turtles
            .into_iter()
            .map(|turtle| TurtleCard {
                status: TurtleStatus::of(&turtle, now),
                turtle,
            })
            .collect(),
    ))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurtleView {
    pub turtle_id: u32,
    pub turtle: Option<Turtle>,
    pub status: Option<TurtleStatus>,
    pub loading: bool,
    pub background_loading: bool,
    pub interacting: bool,
    /// The backend answered but knows no such turtle.
    pub not_found: bool,
    pub last_api_response: Option<ResponseEnvelope>,
    pub last_command_response: Option<ResponseEnvelope>,
    pub notices: Vec<Notice>,
}

async fn api_open_view(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Json<TurtleView> {
    let poller = state.open_session(id);
    Json(view_of(&state, id, &poller))
}

async fn api_turtle_view(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> ApiResult<TurtleView> {
    let poller = open_session_or_404(&state, id)?;
    Ok(Json(view_of(&state, id, &poller)))
}

fn view_of(state: &AppState, id: u32, poller: &TurtlePoller) -> TurtleView {
    let notices = poller.take_notices();
    let view = poller.view();
    let turtle = view.turtle.as_deref().cloned();
    let not_found = turtle.is_none()
        && !view.loading
        && view
            .last_api_response
            .as_ref()
            .is_some_and(|env| !env.is_error());
    let now = now_ms();
    TurtleView {
        turtle_id: id,
        status: turtle.as_ref().map(|t| TurtleStatus::of(t, now)),
        turtle,
        loading: view.loading,
        background_loading: view.background_loading,
        interacting: state.gate.is_active(),
        not_found,
        last_api_response: view.last_api_response,
        last_command_response: view.last_command_response,
        notices,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionInput {
    pub active: bool,
}

/// Updates the page-wide gate. Only an open view refreshes on release; a
/// closed or unknown id never gets a poller from here.
async fn api_interaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(input): Json<InteractionInput>,
) -> Json<InteractionInput> {
    match (state.session(id), input.active) {
        (Some(poller), true) => poller.pointer_down(),
        (Some(poller), false) => poller.pointer_up(),
        (None, true) => state.gate.begin(),
        (None, false) => state.gate.end(),
    }
    Json(InteractionInput {
        active: state.gate.is_active(),
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub script: Option<String>,
}

impl CommandRequest {
    fn into_input(self) -> Result<CommandInput, String> {
        let input = match (self.command, self.commands, self.script) {
            (Some(cmd), None, None) => CommandInput::Single(cmd.trim().to_string()),
            (None, Some(cmds), None) => CommandInput::Batch(
                cmds.into_iter()
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect(),
            ),
            (None, None, Some(script)) => CommandInput::LuaScript(script),
            _ => return Err("provide exactly one of command, commands or script".to_string()),
        };
        let empty = match &input {
            CommandInput::Single(s) | CommandInput::LuaScript(s) => s.trim().is_empty(),
            CommandInput::Batch(cmds) => cmds.is_empty(),
        };
        if empty {
            return Err("command must not be empty".to_string());
        }
        Ok(input)
    }
}

async fn api_send_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<ResponseEnvelope> {
    let input = request
        .into_input()
        .map_err(|msg| error_body(StatusCode::BAD_REQUEST, msg))?;
    let poller = open_session_or_404(&state, id)?;
    let outcome = poller.send_command(input).await;
    match outcome.result {
        Ok(_) => Ok(Json(outcome.envelope)),
        Err(_) => Err((
            StatusCode::BAD_GATEWAY,
            Json(serde_json::to_value(&outcome.envelope).unwrap_or(Value::Null)),
        )),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Closed {
    pub closed: bool,
}

async fn api_close_view(State(state): State<Arc<AppState>>, Path(id): Path<u32>) -> Json<Closed> {
    Json(Closed {
        closed: state.close_session(id),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSettings {
    pub api_base_url: String,
}

async fn api_get_settings(State(state): State<Arc<AppState>>) -> ApiResult<ApiSettings> {
    let api_base_url = state
        .settings
        .api_base_url()
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    Ok(Json(ApiSettings { api_base_url }))
}

async fn api_put_settings(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ApiSettings>,
) -> ApiResult<ApiSettings> {
    if input.api_base_url.trim().is_empty() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "apiBaseUrl must not be empty",
        ));
    }
    let api_base_url = state
        .settings
        .set_api_base_url(&input.api_base_url)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    state.switch_api(&api_base_url);
    Ok(Json(ApiSettings { api_base_url }))
}

async fn api_reset_settings(State(state): State<Arc<AppState>>) -> ApiResult<ApiSettings> {
    let api_base_url = state
        .settings
        .reset_api_base_url()
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    state.switch_api(&api_base_url);
    Ok(Json(ApiSettings { api_base_url }))
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let app = build_router(Arc::new(state));
    let addr = listener.local_addr()?;
    info!(%addr, "dashboard listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(addr)
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    warn!(%ip, "rejected non-local peer");
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(_v6) => false,
    }
}

fn local_only_cors() -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

fn is_allowed_local_origin(origin: &axum::http::HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // Origin is just scheme://host[:port]
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}

const DASHBOARD_HTML: &str = include_str!("dashboard.html");
