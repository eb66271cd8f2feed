use crate::config::{Config, WebConfig};
use crate::gateway::{CommandError, CommandGateway};
use crate::model::{catalog_from_reply, CatalogEntry, SupervisorStatus};
use crate::mpd::{Command, Reply, SessionError};
use crate::playlist::{PlaylistInitializer, PopulateOutcome};
use crate::supervisor::ConnectionSupervisor;
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::process::Command as Process;
use tokio::sync::watch;

pub struct ServerState {
    gateway: CommandGateway,
    supervisor: Arc<ConnectionSupervisor>,
    playlists: PlaylistInitializer,
    web: WebConfig,
    kill_command: String,
    debug: bool,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerState {
    pub fn new(
        config: &Config,
        supervisor: Arc<ConnectionSupervisor>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            gateway: CommandGateway::new(supervisor.clone()),
            playlists: PlaylistInitializer::new(config.supervisor.command_timeout()),
            supervisor,
            web: config.web.clone(),
            kill_command: config.mpd.kill_command.clone(),
            debug: config.debug,
            shutdown_tx,
        }
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/health", get(health_check))
        .route("/api/v1/status", any(status))
        .route("/api/v1/stats", any(stats))
        .route("/api/v1/currentsong", any(current_song))
        .route("/api/v1/play", any(play))
        .route("/api/v1/pause", any(pause))
        .route("/api/v1/stop", any(stop))
        .route("/api/v1/next", any(next))
        .route("/api/v1/previous", any(previous))
        .route("/api/v1/clearqueue", any(clear_queue))
        .route("/api/v1/allsongs", any(all_songs))
        .route("/api/v1/listplaylists", any(list_playlists))
        .route("/api/v1/playlists", any(playlist_names))
        .route("/api/v1/playlists/:name", any(playlist_contents))
        .route("/api/v1/playlistload", post(playlist_load))
        .route("/api/v1/randomtoggle", any(random_toggle))
        .route("/api/v1/reconnect", any(reconnect))
        .route("/api/v1/updatempdatabase", any(update_database))
        .route("/api/v1/killmpd", any(kill_mpd))
        .route("/api/v1/killspinmpc", any(kill_self))
        .with_state(state)
}

pub async fn start(
    host: &str,
    port: u16,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind((host, port)).await?;
    tracing::info!(address = %listener.local_addr()?, "web interface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;
type Shared = State<Arc<ServerState>>;

async fn index_page(State(state): Shared) -> ApiResult<Html<String>> {
    let path = Path::new(&state.web.root).join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Ok(Html(page)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(ApiError::new(StatusCode::NOT_FOUND, "index.html not found"))
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "can't read index page");
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("can't read index page: {err}"),
            ))
        }
    }
}

async fn health_check(State(state): Shared) -> Json<SupervisorStatus> {
    Json(state.supervisor.status())
}

async fn query(
    state: &ServerState,
    command: Command,
) -> ApiResult<Json<BTreeMap<String, String>>> {
    let reply = state.gateway.execute(&command).await?;
    Ok(Json(reply.to_map()))
}

async fn act(state: &ServerState, command: Command) -> ApiResult<StatusCode> {
    state.gateway.execute(&command).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(State(state): Shared) -> ApiResult<Json<BTreeMap<String, String>>> {
    query(&state, Command::Status).await
}

async fn stats(State(state): Shared) -> ApiResult<Json<BTreeMap<String, String>>> {
    query(&state, Command::Stats).await
}

async fn current_song(State(state): Shared) -> ApiResult<Json<BTreeMap<String, String>>> {
    let mut song = state.gateway.execute(&Command::CurrentSong).await?.to_map();
    let url = search_url(&state.web.search_base, &song);
    song.insert("SearchURL".to_string(), url);
    Ok(Json(song))
}

async fn play(State(state): Shared) -> ApiResult<StatusCode> {
    act(&state, Command::Play(None)).await
}

async fn pause(State(state): Shared) -> ApiResult<StatusCode> {
    act(&state, Command::Pause(true)).await
}

async fn stop(State(state): Shared) -> ApiResult<StatusCode> {
    act(&state, Command::Stop).await
}

async fn next(State(state): Shared) -> ApiResult<StatusCode> {
    act(&state, Command::Next).await
}

async fn previous(State(state): Shared) -> ApiResult<StatusCode> {
    act(&state, Command::Previous).await
}

async fn clear_queue(State(state): Shared) -> ApiResult<StatusCode> {
    act(&state, Command::Clear).await
}

async fn all_songs(State(state): Shared) -> Json<PopulateOutcome> {
    let session = state.gateway.session();
    Json(state.playlists.reload_all(session.as_ref()).await)
}

async fn list_playlists(State(state): Shared) -> ApiResult<Json<Vec<BTreeMap<String, String>>>> {
    let reply = state.gateway.execute(&Command::ListPlaylists).await?;
    let listing = reply
        .records(&["playlist"])
        .iter()
        .map(Reply::to_map)
        .collect();
    Ok(Json(listing))
}

async fn playlist_names(State(state): Shared) -> ApiResult<Json<Vec<String>>> {
    let reply = state.gateway.execute(&Command::ListPlaylists).await?;
    let names = reply
        .pairs()
        .iter()
        .filter(|(k, _)| k == "playlist")
        .map(|(_, v)| v.clone())
        .collect();
    Ok(Json(names))
}

async fn playlist_contents(
    State(state): Shared,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Json<Vec<CatalogEntry>>> {
    let reply = state
        .gateway
        .execute(&Command::ListPlaylistInfo(name))
        .await?;
    Ok(Json(catalog_from_reply(&reply)))
}

#[derive(Deserialize)]
struct PlaylistLoadPayload {
    playlist: String,
}

async fn playlist_load(
    State(state): Shared,
    Json(payload): Json<PlaylistLoadPayload>,
) -> ApiResult<StatusCode> {
    let name = payload.playlist.trim();
    if name.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "playlist is required"));
    }

    let session = state.gateway.session();
    state.playlists.load_named(session.as_ref(), name).await?;
    tracing::debug!(playlist = name, "loaded playlist");
    Ok(StatusCode::NO_CONTENT)
}

async fn random_toggle(State(state): Shared) -> ApiResult<Json<BTreeMap<String, String>>> {
    let mut status = state.gateway.execute(&Command::Status).await?.to_map();
    let enable = match status.get("random").map(String::as_str) {
        Some("1") => false,
        Some("0") => true,
        other => {
            return Err(ApiError::new(
                StatusCode::BAD_GATEWAY,
                format!("MPD reported an unexpected random mode: {other:?}"),
            ))
        }
    };

    state.gateway.execute(&Command::Random(enable)).await?;
    let mode = if enable { "1" } else { "0" };
    status.insert("random".to_string(), mode.to_string());
    tracing::debug!(random = mode, "random play mode changed");
    Ok(Json(status))
}

async fn reconnect(State(state): Shared) -> ApiResult<StatusCode> {
    state.supervisor.reconnect().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_database(State(state): Shared) -> ApiResult<Json<BTreeMap<String, String>>> {
    query(&state, Command::Update(None)).await
}

async fn kill_mpd(State(state): Shared) -> ApiResult<StatusCode> {
    let mut words = state.kill_command.split_whitespace();
    let program = words.next().ok_or_else(|| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "no kill command configured")
    })?;

    tracing::info!(command = %state.kill_command, "killing MPD");
    let exit = Process::new(program).args(words).status().await.map_err(|err| {
        tracing::warn!(error = %err, "can't run MPD kill command");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("can't run {program}: {err}"),
        )
    })?;

    if !exit.success() {
        tracing::warn!(%exit, "MPD kill command failed");
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{program} exited with {exit}"),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn kill_self(State(state): Shared) -> StatusCode {
    if !state.debug {
        return StatusCode::FORBIDDEN;
    }
    tracing::info!("shutdown requested over the API");
    let _ = state.shutdown_tx.send(true);
    StatusCode::ACCEPTED
}

fn tag<'a>(song: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    song.get(key).map(String::as_str).unwrap_or("")
}

/// Web search link for a song: `base` followed by the form-encoded
/// `"artist" "title" "album"`.
pub fn search_url(base: &str, song: &BTreeMap<String, String>) -> String {
    let terms = format!(
        "\"{}\" \"{}\" \"{}\"",
        tag(song, "Artist"),
        tag(song, "Title"),
        tag(song, "Album")
    );
    let encoded: String = url::form_urlencoded::byte_serialize(terms.as_bytes()).collect();
    format!("{base}{encoded}")
}
