//! HTTP host for the worker.
//!
//! Every request that is not a control route becomes a fetch event for the
//! same path on the site origin. Control routes live under `/__sw/`.
//!
//! Only same-origin fetch events reach the router through this host, so the
//! external-image policy (approved image hosts, offline placeholder) runs
//! only when a library caller hands the router foreign URLs directly.
//! External images are still pre-cached into the dynamic partition at install.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use bytes::Bytes;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::http::{Method, Request, Response};
use crate::lifecycle::{LifecycleEvents, Registration};
use crate::messages::Command;
use crate::network::Network;
use crate::notify::{handle_notification_click, handle_sync, notification_from_push};
use crate::router::{FetchOutcome, Source};
use crate::storage::CacheStorage;

/// Largest request body forwarded to the network.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Response header naming what produced a routed response.
pub const SOURCE_HEADER: &str = "x-folio-source";

/// Lifecycle observer that writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

impl LifecycleEvents for LogEvents {
    fn on_update_found(&self, worker: Uuid) {
        log::info!("New worker version found: {worker}");
    }

    fn on_waiting(&self, worker: Uuid) {
        log::info!("Worker {worker} is waiting; send SKIP_WAITING to activate it");
    }

    fn on_activated(&self, worker: Uuid) {
        log::info!("Worker {worker} activated");
    }

    fn on_controller_change(&self, worker: Uuid) {
        log::info!("Clients are now controlled by {worker}");
    }
}

struct AppState<S: CacheStorage, N: Network> {
    registration: Arc<Registration<S, N>>,
    network: Arc<N>,
    origin: Url,
}

impl<S: CacheStorage, N: Network> Clone for AppState<S, N> {
    fn clone(&self) -> Self {
        Self {
            registration: Arc::clone(&self.registration),
            network: Arc::clone(&self.network),
            origin: self.origin.clone(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    state: String,
    version: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct ClickRequest {
    action: Option<String>,
}

#[derive(Deserialize)]
struct SyncRequest {
    tag: String,
}

#[derive(Serialize)]
struct SyncResponse {
    ran: bool,
}

fn error_response(status: StatusCode, error: &Error) -> axum::response::Response {
    (
        status,
        axum::Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn no_active_worker() -> axum::response::Response {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        &Error::Message("no active worker".to_string()),
    )
}

async fn health<S: CacheStorage + 'static, N: Network + 'static>(
    State(state): State<AppState<S, N>>,
) -> impl IntoResponse {
    let active = state.registration.active();
    axum::Json(HealthResponse {
        status: "ok".to_string(),
        state: active
            .as_ref()
            .map_or_else(|| "none".to_string(), |w| w.state().to_string()),
        version: active.map(|w| w.version().to_string()),
    })
}

async fn message<S: CacheStorage + 'static, N: Network + 'static>(
    State(state): State<AppState<S, N>>,
    body: String,
) -> axum::response::Response {
    let command = match Command::parse(&body) {
        Ok(command) => command,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };

    if command == Command::SkipWaiting {
        return match state.registration.skip_waiting().await {
            Ok(_) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
        };
    }

    let Some(worker) = state.registration.active() else {
        return no_active_worker();
    };
    match worker.handle_message(command).await {
        Some(reply) => axum::Json(reply).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn push<S: CacheStorage + 'static, N: Network + 'static>(
    State(state): State<AppState<S, N>>,
    body: Bytes,
) -> axum::response::Response {
    let Some(worker) = state.registration.active() else {
        return no_active_worker();
    };
    match notification_from_push(&worker.router().config().notifications, &body) {
        Ok(Some(notification)) => axum::Json(notification).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e),
    }
}

async fn notification_click<S: CacheStorage + 'static, N: Network + 'static>(
    State(state): State<AppState<S, N>>,
    axum::Json(payload): axum::Json<ClickRequest>,
) -> axum::response::Response {
    let Some(worker) = state.registration.active() else {
        return no_active_worker();
    };
    match handle_notification_click(worker.router().config(), payload.action.as_deref()) {
        Ok(action) => axum::Json(action).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn sync<S: CacheStorage + 'static, N: Network + 'static>(
    State(state): State<AppState<S, N>>,
    axum::Json(payload): axum::Json<SyncRequest>,
) -> axum::response::Response {
    let Some(worker) = state.registration.active() else {
        return no_active_worker();
    };
    let ran = handle_sync(&worker.router().config().notifications, &payload.tag).await;
    axum::Json(SyncResponse { ran }).into_response()
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn into_http(response: Response, source: Option<Source>) -> axum::response::Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = axum::response::Response::new(Body::from(response.body));
    *out.status_mut() = status;

    let headers = out.headers_mut();
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    if let Some(source) = source {
        let tag = match source {
            Source::Cache => "cache",
            Source::Network => "network",
            Source::Placeholder => "placeholder",
        };
        headers.insert(SOURCE_HEADER, HeaderValue::from_static(tag));
    }
    out
}

/// Maps a request target onto the site origin. The path is taken literally,
/// so `//host/x` stays a path on the origin instead of naming another host.
fn site_url(origin: &Url, uri: &axum::http::Uri) -> Url {
    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url
}

/// Turns an incoming HTTP request into a fetch event.
async fn fetch_event<S: CacheStorage + 'static, N: Network + 'static>(
    State(state): State<AppState<S, N>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let (parts, body) = request.into_parts();
    let url = site_url(&state.origin, &parts.uri);
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, &Error::Message(e.to_string()));
        }
    };

    let mut request = Request::new(Method::parse(parts.method.as_str()), url);
    request.headers = header_pairs(&parts.headers);
    request.body = body;

    match state.registration.handle_fetch(&request).await {
        FetchOutcome::Respond { response, source, .. } => into_http(response, Some(source)),
        FetchOutcome::Failed { error, .. } => error_response(StatusCode::SERVICE_UNAVAILABLE, &error),
        FetchOutcome::Bypass => match state.network.fetch(&request).await {
            Ok(response) => into_http(response, None),
            Err(e) => error_response(StatusCode::BAD_GATEWAY, &e),
        },
    }
}

/// Builds the axum application for a registration.
///
/// `network` serves bypassed requests; `origin` is the site the fetch
/// events are addressed to.
pub fn app<S: CacheStorage + 'static, N: Network + 'static>(
    registration: Arc<Registration<S, N>>,
    network: Arc<N>,
    origin: Url,
) -> Router {
    let state = AppState {
        registration,
        network,
        origin,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__sw/health", get(health::<S, N>))
        .route("/__sw/message", post(message::<S, N>))
        .route("/__sw/push", post(push::<S, N>))
        .route("/__sw/notificationclick", post(notification_click::<S, N>))
        .route("/__sw/sync", post(sync::<S, N>))
        .layer(cors)
        .fallback(fetch_event::<S, N>)
        .with_state(state)
}

/// Binds `host:port`.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn bind(host: &str, port: u16) -> Result<tokio::net::TcpListener> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address {host}:{port}: {e}")))?;
    Ok(tokio::net::TcpListener::bind(addr).await?)
}

/// Serves `app` until `shutdown` is cancelled. In-flight fetch events are
/// abandoned at shutdown.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Serving on http://{addr}");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::lifecycle::{NoEvents, ServiceWorker};
    use crate::router::CacheRouter;
    use crate::storage::MemoryStorage;
    use crate::testing::ScriptedNetwork;

    const ORIGIN: &str = "https://folio.test";

    async fn json(resp: reqwest::Response) -> serde_json::Value {
        serde_json::from_str(&resp.text().await.unwrap()).unwrap()
    }

    async fn start(net: ScriptedNetwork) -> (String, CancellationToken) {
        let (base, token, _) = start_with(net).await;
        (base, token)
    }

    async fn start_with(
        net: ScriptedNetwork,
    ) -> (String, CancellationToken, Arc<ScriptedNetwork>) {
        let config = SiteConfig::new()
            .with_origin(ORIGIN)
            .with_static_assets(vec!["/index.html".to_string()])
            .with_external_urls(vec![]);
        let network = Arc::new(net);
        let router =
            CacheRouter::new(config, Arc::new(MemoryStorage::new()), Arc::clone(&network)).unwrap();
        let registration = Arc::new(Registration::new(
            Url::parse(ORIGIN).unwrap(),
            Arc::new(NoEvents),
        ));
        registration
            .register(Arc::new(ServiceWorker::new(router)))
            .await
            .unwrap();

        let listener = bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let application = app(registration, Arc::clone(&network), Url::parse(ORIGIN).unwrap());
        tokio::spawn(serve(listener, application, token.clone()));
        (format!("http://{addr}"), token, network)
    }

    #[tokio::test]
    async fn serves_precached_page_from_cache() {
        let net = ScriptedNetwork::new().ok("https://folio.test/index.html", "<html>hola");
        let (base, token) = start(net).await;

        let resp = reqwest::get(format!("{base}/index.html")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[SOURCE_HEADER], "cache");
        assert_eq!(resp.text().await.unwrap(), "<html>hola");
        token.cancel();
    }

    #[tokio::test]
    async fn post_requests_are_forwarded_unrouted() {
        let net = ScriptedNetwork::new()
            .ok("https://folio.test/index.html", "<html>")
            .ok("https://folio.test/contact", "gracias");
        let (base, token) = start(net).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/contact"))
            .body("name=ana")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers().get(SOURCE_HEADER).is_none());
        assert_eq!(resp.text().await.unwrap(), "gracias");
        token.cancel();
    }

    #[tokio::test]
    async fn control_channel_round_trip() {
        let net = ScriptedNetwork::new().ok("https://folio.test/index.html", "<html>");
        let (base, token) = start(net).await;
        let client = reqwest::Client::new();

        let version = client
            .post(format!("{base}/__sw/message"))
            .body(r#"{"type":"GET_VERSION"}"#)
            .send()
            .await
            .unwrap();
        let version = json(version).await;
        assert_eq!(version["version"], "daniel-baylon-portfolio-v1.0.0");

        let status = client
            .post(format!("{base}/__sw/message"))
            .body(r#"{"type":"CACHE_STATUS"}"#)
            .send()
            .await
            .unwrap();
        let status = json(status).await;
        assert_eq!(status["status"]["daniel-baylon-static-v1.0.0"], 1);

        let skip = client
            .post(format!("{base}/__sw/message"))
            .body(r#"{"type":"SKIP_WAITING"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(skip.status(), 204);

        let bad = client
            .post(format!("{base}/__sw/message"))
            .body(r#"{"type":"NOPE"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), 400);
        token.cancel();
    }

    #[test]
    fn site_url_keeps_request_target_on_origin() {
        let origin = Url::parse(ORIGIN).unwrap();
        let uri: axum::http::Uri = "//evil.test/steal?x=1".parse().unwrap();
        assert_eq!(site_url(&origin, &uri).as_str(), "https://folio.test//evil.test/steal?x=1");

        let uri: axum::http::Uri = "/css/styles.css".parse().unwrap();
        assert_eq!(site_url(&origin, &uri).as_str(), "https://folio.test/css/styles.css");
    }

    #[tokio::test]
    async fn double_slash_path_never_reaches_another_host() {
        let net = ScriptedNetwork::new()
            .ok("https://folio.test/index.html", "<html>")
            .ok("https://evil.test/steal", "foreign");
        let (base, token, network) = start_with(net).await;

        let resp = reqwest::get(format!("{base}//evil.test/steal")).await.unwrap();
        assert_ne!(resp.text().await.unwrap(), "foreign");
        assert_eq!(network.call_count("https://evil.test/steal"), 0);
        assert!(network.calls().iter().all(|c| c.starts_with("https://folio.test/")));
        token.cancel();
    }

    #[tokio::test]
    async fn offline_failure_is_service_unavailable() {
        let net = ScriptedNetwork::new().ok("https://folio.test/index.html", "<html>");
        let (base, token) = start(net).await;

        let resp = reqwest::get(format!("{base}/api/visits")).await.unwrap();
        assert_eq!(resp.status(), 503);
        token.cancel();
    }

    #[tokio::test]
    async fn health_reports_active_worker() {
        let net = ScriptedNetwork::new().ok("https://folio.test/index.html", "<html>");
        let (base, token) = start(net).await;

        let health = json(reqwest::get(format!("{base}/__sw/health")).await.unwrap()).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["state"], "activated");
        token.cancel();
    }
}
