//! HTTP and WebSocket surface of the relay.
//!
//! `/api/health` is the only unauthenticated route. Everything else needs
//! the session token, presented once as `?token=` (exchanged for the
//! session cookie and redirected to a clean URL) or as the cookie.

use super::connection::serve_connection;
use super::state::RelayState;
use crate::auth::{is_authorized, origin_matches, session_cookie};
use crate::auth::gate::{is_https, token_from_cookies};
use crate::transport::websocket::MAX_WS_FRAME_SIZE;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use regex::Regex;
use rtty_core::{RttyError, RttyResult};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const TOKEN_PARAM: &str = "token";

/// How long `stop` waits for in-flight requests before aborting the server.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Build the relay's router.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/terminal-context", get(terminal_context))
        .route("/api/*rest", get(api_not_found))
        .route("/ws", get(ws_upgrade))
        .fallback(serve_app)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: u64,
}

async fn health() -> Json<HealthResponse> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Json(HealthResponse {
        status: "ok",
        timestamp,
    })
}

async fn api_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Forbidden").into_response()
}

/// The token this request presents, from the query or the cookie.
fn presented_token(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    query_token(uri).or_else(|| token_from_cookies(headers))
}

fn query_token(uri: &Uri) -> Option<String> {
    query_param(uri, TOKEN_PARAM)
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

#[derive(Debug, Serialize)]
struct ContextEntry {
    seq: u64,
    data: String,
}

#[derive(Debug, Serialize)]
struct ContextResponse {
    entries: Vec<ContextEntry>,
    text: String,
    #[serde(rename = "lastSeq")]
    last_seq: Option<u64>,
}

async fn terminal_context(
    State(state): State<Arc<RelayState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let presented = presented_token(&uri, &headers);
    if !is_authorized(state.token().as_deref(), presented.as_deref()) {
        return forbidden();
    }

    // Parsed only after the token check so every rejection looks the same.
    let config = state.config();
    let limit = match query_param(&uri, "limit").map(|v| v.parse::<usize>()) {
        None => config.context_entries,
        Some(Ok(limit)) => limit,
        Some(Err(_)) => return (StatusCode::BAD_REQUEST, "invalid limit").into_response(),
    }
    .min(config.log_high_water);
    let (records, last_seq) = state.terminal_context(limit);

    let raw: String = records.iter().map(|r| &*r.data).collect();
    let entries = records
        .into_iter()
        .map(|r| ContextEntry {
            seq: r.seq,
            data: r.data.to_string(),
        })
        .collect();

    Json(ContextResponse {
        entries,
        text: strip_ansi(&raw),
        last_seq,
    })
    .into_response()
}

/// Remove CSI, OSC and two-byte escape sequences, leaving plain text.
pub fn strip_ansi(text: &str) -> String {
    static ANSI_REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    let regex = ANSI_REGEX.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_c78=>]").ok()
    });
    match regex {
        Some(regex) => regex.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

async fn ws_upgrade(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let cookie = token_from_cookies(&headers);
    if !origin_matches(&headers) || !is_authorized(state.token().as_deref(), cookie.as_deref()) {
        debug!("rejecting WebSocket upgrade");
        return forbidden();
    }

    ws.max_message_size(MAX_WS_FRAME_SIZE)
        .max_frame_size(MAX_WS_FRAME_SIZE)
        .on_upgrade(move |socket| serve_connection(socket, state))
}

/// Entry page and static assets, behind the token gate.
async fn serve_app(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let expected = state.token();

    if let Some(token) = query_token(&uri) {
        if !is_authorized(expected.as_deref(), Some(&token)) {
            return forbidden();
        }
        let config = state.config();
        let cookie = session_cookie(&token, is_https(&headers), config.cookie_max_age_secs);
        return redirect_with_cookie(&clean_location(&uri), &cookie);
    }

    let cookie = token_from_cookies(&headers);
    if !is_authorized(expected.as_deref(), cookie.as_deref()) {
        return forbidden();
    }

    let web_root = &state.config().web_root;
    let index = web_root.join("index.html");
    if !index.is_file() {
        error!(path = %index.display(), "entry page missing");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Entry page not found at {}. Point --web-root (or [server].web_root in the config file) at the client build.",
                index.display()
            ),
        )
            .into_response();
    }

    // `fallback` keeps the entry page's 200 for client-side routes.
    let service = ServeDir::new(web_root).fallback(ServeFile::new(index));
    match service.oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

/// The request's path and query with only the token parameter removed.
fn clean_location(uri: &Uri) -> String {
    let path = uri.path();
    let remaining: Vec<(String, String)> = uri
        .query()
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .unwrap_or_default()
        .into_iter()
        .filter(|(k, _)| k != TOKEN_PARAM)
        .collect();

    if remaining.is_empty() {
        return path.to_string();
    }
    match serde_urlencoded::to_string(&remaining) {
        Ok(query) => format!("{path}?{query}"),
        Err(_) => path.to_string(),
    }
}

fn redirect_with_cookie(location: &str, cookie: &str) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    match (HeaderValue::from_str(location), HeaderValue::from_str(cookie)) {
        (Ok(location), Ok(cookie)) => {
            headers.insert(header::LOCATION, location);
            headers.insert(header::SET_COOKIE, cookie);
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            response
        }
        _ => forbidden(),
    }
}

/// A running relay listener.
pub struct RelayServer {
    port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Serve the relay on an already-bound listener.
    pub fn start(listener: TcpListener, state: Arc<RelayState>) -> RttyResult<Self> {
        let port = listener
            .local_addr()
            .map_err(|e| RttyError::Transport(format!("listener has no address: {e}")))?
            .port();
        let app = router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "relay server error");
            }
        });

        info!(port, "relay listening");
        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and wait briefly for the server to wind
    /// down. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(_) => info!("relay stopped"),
            Err(_) => {
                warn!("relay did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::state::tests::test_state;
    use axum::body::Body;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn config_with_root(root: &std::path::Path) -> RelayConfig {
        RelayConfig {
            web_root: root.to_path_buf(),
            ..RelayConfig::default()
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_request(uri: &str, cookie: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = cookie {
            builder = builder.header(header::COOKIE, format!("rtty_session={token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let (state, _) = test_state(RelayConfig::default());
        let response = router(state)
            .oneshot(get_request("/api/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn token_is_exchanged_for_cookie_and_stripped_from_url() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(config_with_root(dir.path()));
        let token = state.init();

        let uri = format!("/view?theme=dark&token={token}&x=1");
        let response = router(state).oneshot(get_request(&uri, None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/view?theme=dark&x=1");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("rtty_session={token};")));
        assert!(cookie.contains("HttpOnly"));
        assert!(!cookie.contains("Secure"));
    }

    #[tokio::test]
    async fn cookie_is_secure_behind_https_tunnel() {
        let (state, _) = test_state(RelayConfig::default());
        let token = state.init();
        let request = Request::builder()
            .uri(format!("/?token={token}"))
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.ends_with("; Secure"));
    }

    #[tokio::test]
    async fn wrong_or_missing_token_is_forbidden() {
        let (state, _) = test_state(RelayConfig::default());
        state.init();
        let app = router(state);

        for request in [
            get_request("/", None),
            get_request("/?token=nope", None),
            get_request("/", Some("nope")),
            get_request("/api/terminal-context", None),
        ] {
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
    }

    #[tokio::test]
    async fn entry_page_served_for_unknown_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>rtty</html>").unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        let (state, _) = test_state(config_with_root(dir.path()));
        let token = state.init();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(get_request("/some/deep/link", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "<html>rtty</html>");

        let response = app
            .oneshot(get_request("/app.js", Some(&token)))
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "console.log(1)");
    }

    #[tokio::test]
    async fn deep_links_get_the_entry_page_with_ok_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>rtty</html>").unwrap();
        let (state, _) = test_state(config_with_root(dir.path()));
        let token = state.init();
        let app = router(state);

        for path in ["/", "/session/42", "/missing.css"] {
            let response = app
                .clone()
                .oneshot(get_request(path, Some(&token)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            assert_eq!(body_string(response).await, "<html>rtty</html>");
        }
    }

    #[tokio::test]
    async fn missing_entry_page_gives_hint() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(config_with_root(dir.path()));
        let token = state.init();
        let response = router(state)
            .oneshot(get_request("/", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response).await.contains("--web-root"));
    }

    #[tokio::test]
    async fn unknown_api_paths_are_not_found() {
        let (state, _) = test_state(RelayConfig::default());
        let token = state.init();
        let response = router(state)
            .oneshot(get_request("/api/nope", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn terminal_context_returns_recent_plain_text() {
        let (state, _) = test_state(RelayConfig::default());
        let token = state.init();
        state.handle_pty_output("\x1b[32mgreen\x1b[0m ");
        state.handle_pty_output("plain");
        state.handle_pty_output("\x1b]0;title\x07done");

        let response = router(state)
            .oneshot(get_request("/api/terminal-context?limit=2", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["entries"].as_array().unwrap().len(), 2);
        assert_eq!(json["entries"][0]["seq"], 2);
        assert_eq!(json["text"], "plaindone");
        assert_eq!(json["lastSeq"], 3);
    }

    #[tokio::test]
    async fn terminal_context_rejects_before_parsing_limit() {
        let (state, _) = test_state(RelayConfig::default());
        let token = state.init();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(get_request("/api/terminal-context?limit=abc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(get_request(
                &format!("/api/terminal-context?limit=abc&token={token}"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn strip_ansi_removes_escapes() {
        assert_eq!(strip_ansi("\x1b[1;31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("a\x1b]0;t\x1b\\b"), "ab");
        assert_eq!(strip_ansi("x\x1bcy"), "xy");
    }

    async fn spawn_server(state: Arc<RelayState>) -> RelayServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        RelayServer::start(listener, state).unwrap()
    }

    fn ws_request(port: u16, token: &str, origin: Option<&str>) -> axum::http::Request<()> {
        let mut request = format!("ws://127.0.0.1:{port}/ws")
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("rtty_session={token}")).unwrap(),
        );
        if let Some(origin) = origin {
            request
                .headers_mut()
                .insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        }
        request
    }

    #[tokio::test]
    async fn websocket_session_replays_and_streams() {
        let (state, sink) = test_state(RelayConfig::default());
        let token = state.init();
        state.handle_pty_output("before");
        let mut server = spawn_server(state.clone()).await;
        let port = server.port();

        let (mut ws, _) =
            tokio_tungstenite::connect_async(ws_request(port, &token, Some(&format!("http://127.0.0.1:{port}"))))
                .await
                .unwrap();

        ws.send(WsMessage::Text(r#"{"type":"sync"}"#.into())).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "history");
        assert_eq!(json["data"][0], "before");
        assert_eq!(json["lastSeq"], 1);

        state.handle_pty_output("after");
        let reply = ws.next().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["seq"], 2);

        ws.send(WsMessage::Text(r#"{"type":"input","data":"q"}"#.into())).await.unwrap();
        for _ in 0..50 {
            if !sink.input.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.input.lock().unwrap().as_slice(), b"q");

        server.stop().await;
    }

    #[tokio::test]
    async fn websocket_rejects_bad_cookie_and_foreign_origin() {
        let (state, _) = test_state(RelayConfig::default());
        let token = state.init();
        let mut server = spawn_server(state).await;
        let port = server.port();

        assert!(tokio_tungstenite::connect_async(ws_request(port, "wrong", None))
            .await
            .is_err());
        assert!(
            tokio_tungstenite::connect_async(ws_request(port, &token, Some("https://evil.example")))
                .await
                .is_err()
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn connections_over_the_ceiling_are_closed_with_4008() {
        let config = RelayConfig {
            max_connections: 1,
            ..RelayConfig::default()
        };
        let (state, _) = test_state(config);
        let token = state.init();
        let mut server = spawn_server(state.clone()).await;
        let port = server.port();

        let (_first, _) = tokio_tungstenite::connect_async(ws_request(port, &token, None))
            .await
            .unwrap();
        for _ in 0..50 {
            if state.client_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (mut second, _) = tokio_tungstenite::connect_async(ws_request(port, &token, None))
            .await
            .unwrap();
        match second.next().await {
            Some(Ok(WsMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 4008);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn reset_closes_live_connections() {
        let (state, _) = test_state(RelayConfig::default());
        let token = state.init();
        let mut server = spawn_server(state.clone()).await;
        let port = server.port();

        let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(port, &token, None))
            .await
            .unwrap();
        for _ in 0..50 {
            if state.client_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        state.handle_pty_exit(0);
        state.reset();

        let mut saw_exit = false;
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if text.contains("\"exit\"") {
                        saw_exit = true;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        assert!(saw_exit);
        server.stop().await;
    }
}
