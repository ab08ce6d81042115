//! Server mode: a long-lived HTTP listener adapting each request to the
//! canonical model.

use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use authgate_api::{
    CanonicalRequest, CanonicalResponse, GatewayError, ParamMap, RequestContext, RequestParams,
    StageVariables, status,
};
use authgate_core::{Method, Resolution, Route, ServerSettings};
use authgate_runtime::{Gateway, not_found};
use futures::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::form_urlencoded;

use crate::cors::{CorsPreflight, apply_cors_headers};
use crate::sink::{BufferedSink, ResponseSink};

const REQUEST_ID_HEADER: &str = "x-request-id";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const INTERNAL_ERROR_BODY: &[u8] = br#"{"err":"internal server error"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    /// Key material turned out to be unusable while serving.
    Fatal,
}

/// Per-server state shared by every connection.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Fixed at startup and copied into every canonical request.
    pub stage_variables: Arc<StageVariables>,
    pub shutdown: broadcast::Sender<ShutdownReason>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, stage_variables: StageVariables) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        Self {
            gateway,
            stage_variables: Arc::new(stage_variables),
            shutdown,
        }
    }
}

/// Load configuration and keys, then serve until a signal or a fatal error.
pub async fn run(settings: ServerSettings) -> anyhow::Result<()> {
    let stage = settings
        .load_stage_variables()
        .context("loading server configuration")?;

    let gateway = Arc::new(Gateway::with_mysql());
    gateway
        .preload_keys(&stage)
        .context("parsing JWT key material")?;

    for route in gateway.routes().routes() {
        info!(
            method = %route.method,
            route = %route.template.router_syntax(),
            "installed handler"
        );
    }

    let addr = settings.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    let state = AppState::new(gateway, stage);
    let shutdown_rx = state.shutdown.subscribe();
    spawn_signal_listeners(state.shutdown.clone());

    match serve(listener, state, shutdown_rx, settings.shutdown_timeout).await {
        ShutdownReason::Signal => Ok(()),
        ShutdownReason::Fatal => anyhow::bail!("stopped serving after a fatal key-material error"),
    }
}

fn spawn_signal_listeners(shutdown: broadcast::Sender<ShutdownReason>) {
    let tx = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT, shutting down");
                let _ = tx.send(ShutdownReason::Signal);
            }
            Err(e) => error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM, shutting down");
                let _ = shutdown.send(ShutdownReason::Signal);
            }
            Err(e) => error!(error = %e, "failed to listen for SIGTERM"),
        }
    });
}

/// Accept connections until shutdown is requested, then give in-flight
/// connections `drain_timeout` to finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown_rx: broadcast::Receiver<ShutdownReason>,
    drain_timeout: Duration,
) -> ShutdownReason {
    let mut connections = JoinSet::new();

    let reason = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    let conn_shutdown = state.shutdown.subscribe();
                    connections.spawn(handle_connection(stream, peer, state, conn_shutdown));
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            reason = shutdown_rx.recv() => {
                break reason.unwrap_or(ShutdownReason::Signal);
            }
        }
    };

    info!(active = connections.len(), "draining connections");
    let drained = tokio::time::timeout(drain_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(active = connections.len(), "drain timeout reached, aborting connections");
        connections.abort_all();
    }
    reason
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    state: AppState,
    mut shutdown_rx: broadcast::Receiver<ShutdownReason>,
) {
    let io = TokioIo::new(stream);
    let svc = hyper::service::service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(state, peer, req).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, svc);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(error = %e, peer = %peer, "connection error");
            }
        }
        _ = shutdown_rx.recv() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(error = %e, peer = %peer, "connection error during shutdown");
            }
        }
    }
}

/// Translate one HTTP request into a canonical call and back.
pub async fn handle_request<B>(
    state: AppState,
    peer: SocketAddr,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Display,
{
    let started = Instant::now();
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
    let span = info_span!(
        "request",
        id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        let mut sink = BufferedSink::new();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            sink.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let routes = state.gateway.routes();
        let path = req.uri().path().to_string();
        let method = req.method().as_str().parse::<Method>().ok();
        let resolution = match method {
            Some(method) => routes.resolve(method, &path),
            None => Resolution::NotFound {
                allowed: routes.allowed_methods(&path),
            },
        };

        let response = if method == Some(Method::Options) {
            let allowed = match &resolution {
                Resolution::NotFound { allowed } => allowed.clone(),
                Resolution::Matched { .. } => Vec::new(),
            };
            let mut preflight = CorsPreflight::new(sink, allowed);
            respond(&state, resolution, req, peer, &mut preflight).await;
            preflight.into_inner().into_response()
        } else {
            respond(&state, resolution, req, peer, &mut sink).await;
            sink.into_response()
        };

        info!(
            status = response.status().as_u16(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "request completed"
        );
        response
    }
    .instrument(span)
    .await
}

async fn respond<B, S>(
    state: &AppState,
    resolution: Resolution<'_>,
    req: Request<B>,
    peer: SocketAddr,
    sink: &mut S,
) where
    B: Body,
    B::Error: Display,
    S: ResponseSink,
{
    let (route, path_params) = match resolution {
        Resolution::Matched { route, params } => (route, params),
        Resolution::NotFound { .. } => {
            let resp = not_found(req.method().as_str(), req.uri().path());
            write_canonical(sink, &resp);
            return;
        }
    };

    let canonical = match canonical_request(req, route, path_params, peer, &state.stage_variables)
        .await
    {
        Ok(canonical) => canonical,
        Err(e) => {
            warn!(error = %e, "failed to read request");
            write_canonical(
                sink,
                &CanonicalResponse::error(status::INTERNAL_SERVER_ERROR, "failed to read request"),
            );
            return;
        }
    };

    let outcome = AssertUnwindSafe(state.gateway.invoke(route.endpoint, &canonical))
        .catch_unwind()
        .await;
    let resp = match outcome {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            error!(error = %e, fatal = e.is_fatal(), "gateway failure, stopping server");
            let _ = state.shutdown.send(ShutdownReason::Fatal);
            CanonicalResponse::error(status::INTERNAL_SERVER_ERROR, "internal server error")
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(panic_message = %message, "handler panicked");
            CanonicalResponse::error(status::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };
    write_canonical(sink, &resp);
}

/// Build the canonical request for a matched route, collapsing every
/// multi-valued input to a single value.
async fn canonical_request<B>(
    req: Request<B>,
    route: &Route,
    path_params: ParamMap,
    peer: SocketAddr,
    stage: &StageVariables,
) -> Result<CanonicalRequest, GatewayError>
where
    B: Body,
    B::Error: Display,
{
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| GatewayError::Io(format!("failed to read request body: {e}")))?
        .to_bytes();

    let query = collapse_form_values(parts.uri.query(), &parts.headers, &body);
    Ok(CanonicalRequest {
        body: body.to_vec(),
        params: RequestParams {
            path: path_params,
            query,
            header: collapse_headers(&parts.headers),
        },
        stage_variables: stage.clone(),
        context: RequestContext {
            method: route.method.as_str().to_ascii_lowercase(),
            path: route.template.as_str().to_string(),
            stage: String::new(),
            source_ip: peer.to_string(),
        },
    })
}

/// Write a canonical response: its headers, CORS headers, a JSON content
/// type, then status and body.
///
/// The body is encoded before the status is committed so an encoding
/// failure can still become a `500`.
pub fn write_canonical<S: ResponseSink>(sink: &mut S, resp: &CanonicalResponse) {
    let headers = sink.headers_mut();
    for (name, value) in &resp.header {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "dropping invalid response header"),
        }
    }
    apply_cors_headers(headers);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    match resp.body_json() {
        Ok(body) => {
            let status =
                StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            sink.write_header(status);
            sink.write(&body);
        }
        Err(e) => {
            error!(error = %e, "failed to serialise response body");
            sink.write_header(StatusCode::INTERNAL_SERVER_ERROR);
            sink.write(INTERNAL_ERROR_BODY);
        }
    }
}

/// One entry per header name; repeated values are joined with `", "`.
pub fn collapse_headers(headers: &HeaderMap) -> ParamMap {
    let mut out = ParamMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        out.insert(canonical_header_name(name.as_str()), joined);
    }
    out
}

/// `x-request-id` -> `X-Request-Id`.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// URL query values plus urlencoded form fields; the first value of each
/// key wins and form fields come first.
fn collapse_form_values(query: Option<&str>, headers: &HeaderMap, body: &[u8]) -> ParamMap {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(FORM_CONTENT_TYPE));
    let form = if is_form { body } else { &[][..] };

    let mut out = ParamMap::new();
    let pairs = form_urlencoded::parse(form)
        .chain(form_urlencoded::parse(query.unwrap_or_default().as_bytes()));
    for (key, value) in pairs {
        out.entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use authgate_api::{STAGE_JWT_PRIVATE_KEY, STAGE_JWT_PUBLIC_KEY};
    use authgate_connectors::StaticCredentialStore;
    use authgate_core::{Endpoint, RouteTable};
    use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW, AUTHORIZATION};
    use serde_json::{Value, json};

    const PUBLIC_PEM: &str = include_str!("../../../testdata/jwt.pub");
    const PRIVATE_PEM: &str = include_str!("../../../testdata/jwt.key");

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn state_with(routes: RouteTable) -> AppState {
        let store = StaticCredentialStore::new([("alice".to_string(), "wonderland".to_string())]);
        let gateway = Arc::new(Gateway::with_routes(routes, Arc::new(store)));
        let stage = StageVariables::from([
            (STAGE_JWT_PUBLIC_KEY.to_string(), PUBLIC_PEM.to_string()),
            (STAGE_JWT_PRIVATE_KEY.to_string(), PRIVATE_PEM.to_string()),
        ]);
        gateway.preload_keys(&stage).unwrap();
        AppState::new(gateway, stage)
    }

    fn state() -> AppState {
        state_with(RouteTable::standard())
    }

    fn request(method: &str, uri: &str) -> hyper::http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    async fn call(state: &AppState, req: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, Bytes) {
        let resp = handle_request(state.clone(), peer(), req).await;
        let (parts, body) = resp.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        (parts.status, parts.headers, body)
    }

    fn json_body(body: &Bytes) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn greeting_over_http() {
        let req = request("GET", "/").body(Full::default()).unwrap();
        let (status, headers, body) = call(&state(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers.contains_key(REQUEST_ID_HEADER));
        assert_eq!(json_body(&body), json!("Have a nice day"));
    }

    #[tokio::test]
    async fn login_and_token_check_over_http() {
        let state = state();
        let req = request("POST", "/login/alice?password=wonderland")
            .body(Full::default())
            .unwrap();
        let (status, headers, body) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        let bearer = headers[AUTHORIZATION].to_str().unwrap().to_string();
        assert_eq!(json_body(&body)["Authorization"], json!(bearer));

        let req = request("GET", "/login")
            .header(AUTHORIZATION, &bearer)
            .body(Full::default())
            .unwrap();
        let (status, _, body) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body), json!({"username": "alice"}));
    }

    #[tokio::test]
    async fn form_password_is_accepted() {
        let req = request("POST", "/login/alice")
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(Full::new(Bytes::from_static(b"password=wonderland")))
            .unwrap();
        let (status, _, _) = call(&state(), req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_credentials_over_http() {
        let req = request("POST", "/login/alice?password=wrong")
            .body(Full::default())
            .unwrap();
        let (status, headers, _) = call(&state(), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn unknown_path_is_json_404() {
        let req = request("GET", "/nowhere").body(Full::default()).unwrap();
        let (status, _, body) = call(&state(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(&body),
            json!({"err": "No function found for 'GET' '/nowhere'"})
        );
    }

    #[tokio::test]
    async fn wrong_method_is_404_without_allow() {
        let req = request("DELETE", "/login").body(Full::default()).unwrap();
        let (status, headers, _) = call(&state(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!headers.contains_key(ALLOW));
    }

    #[tokio::test]
    async fn preflight_lists_registered_methods() {
        let state = state_with(RouteTable::new(vec![
            Route::new(Method::Get, "/items/{id}", Endpoint::Greeting),
            Route::new(Method::Post, "/items/{id}", Endpoint::Greeting),
        ]));
        let req = request("OPTIONS", "/items/7").body(Full::default()).unwrap();
        let (status, headers, body) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        let mut allow: Vec<&str> = headers[ALLOW].to_str().unwrap().split(", ").collect();
        allow.sort_unstable();
        assert_eq!(allow, ["GET", "HEAD", "OPTIONS", "POST"]);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn preflight_on_unknown_path_stays_404() {
        let req = request("OPTIONS", "/nowhere").body(Full::default()).unwrap();
        let (status, headers, body) = call(&state(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!headers.contains_key(ALLOW));
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn handler_sees_collapsed_headers_and_template_context() {
        let mut headers = HeaderMap::new();
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));
        headers.append("accept", HeaderValue::from_static("*/*"));
        let collapsed = collapse_headers(&headers);
        assert_eq!(collapsed.get("X-Multi").map(String::as_str), Some("a, b"));
        assert_eq!(collapsed.get("Accept").map(String::as_str), Some("*/*"));

        let state = state();
        let route = state.gateway.routes().lookup("POST", "/login/{username}").unwrap();
        let mut req = request("POST", "/login/bob?password=1&password=2")
            .body(Full::new(Bytes::from_static(br#"{"k":"v"}"#)))
            .unwrap();
        *req.headers_mut() = headers;
        let params = ParamMap::from([("username".to_string(), "bob".to_string())]);
        let canonical = canonical_request(req, route, params, peer(), &state.stage_variables)
            .await
            .unwrap();
        assert_eq!(canonical.params.header.get("X-Multi").map(String::as_str), Some("a, b"));
        assert_eq!(canonical.query_param("password"), Some("1"));
        assert_eq!(canonical.path_param("username"), Some("bob"));
        assert_eq!(canonical.context.method, "post");
        assert_eq!(canonical.context.path, "/login/{username}");
        assert_eq!(canonical.context.source_ip, "127.0.0.1:40000");
        assert_eq!(canonical.body, br#"{"k":"v"}"#);
        assert!(canonical.stage_variables.contains_key(STAGE_JWT_PUBLIC_KEY));
    }

    #[test]
    fn form_fields_take_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
        let values = collapse_form_values(Some("a=query&b=2"), &headers, b"a=form&a=again");
        assert_eq!(values.get("a").map(String::as_str), Some("form"));
        assert_eq!(values.get("b").map(String::as_str), Some("2"));

        let values = collapse_form_values(Some("a=query"), &HeaderMap::new(), b"a=form");
        assert_eq!(values.get("a").map(String::as_str), Some("query"));
    }

    #[test]
    fn header_names_are_canonicalised() {
        assert_eq!(canonical_header_name("authorization"), "Authorization");
        assert_eq!(canonical_header_name("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_name("CONTENT-TYPE"), "Content-Type");
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let req = request("GET", "/")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Full::default())
            .unwrap();
        let (_, headers, _) = call(&state(), req).await;
        assert_eq!(headers[REQUEST_ID_HEADER], "abc-123");
    }

    #[tokio::test]
    async fn write_canonical_sets_headers_before_status() {
        let mut sink = BufferedSink::new();
        let resp = CanonicalResponse::new(201, json!({"ok": true})).with_header("X-Extra", "1");
        write_canonical(&mut sink, &resp);
        let resp = sink.into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-extra"], "1");
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn fatal_error_requests_shutdown() {
        let gateway = Arc::new(Gateway::new(Arc::new(StaticCredentialStore::default())));
        // No key material anywhere: the token check cannot proceed.
        let state = AppState::new(gateway, StageVariables::new());
        let mut shutdown = state.shutdown.subscribe();
        let req = request("GET", "/login").body(Full::default()).unwrap();
        let (status, _, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(shutdown.try_recv().unwrap(), ShutdownReason::Fatal);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let state = state();
        let tx = state.shutdown.clone();
        let rx = tx.subscribe();
        let server = tokio::spawn(serve(listener, state, rx, Duration::from_secs(1)));
        tx.send(ShutdownReason::Signal).unwrap();
        assert_eq!(server.await.unwrap(), ShutdownReason::Signal);
    }
}
