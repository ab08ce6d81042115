//! CORS headers and the automatic `OPTIONS` responder.

use authgate_core::Method;
use hyper::StatusCode;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW, CACHE_CONTROL, HeaderMap, HeaderValue,
};
use tracing::{debug, warn};

use crate::sink::ResponseSink;

/// Disable caching and allow cross-origin calls (e.g. from a Swagger UI).
pub fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("must-revalidate"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, PUT, PATCH, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightState {
    Init,
    /// The real status went out; everything passes through.
    HeaderWritten,
    /// A `404` was replaced by a synthesized `200`; body writes are dropped.
    Proxying,
}

/// Wraps the sink of an `OPTIONS` request.
///
/// When the router answers `404` for a path that does have routes under
/// other methods, the `404` is replaced by `200` with an `Allow` header
/// listing those methods plus `OPTIONS`, and no body.
#[derive(Debug)]
pub struct CorsPreflight<S> {
    inner: S,
    allowed: Vec<Method>,
    state: PreflightState,
}

impl<S: ResponseSink> CorsPreflight<S> {
    /// `allowed` is what the router registered for the requested path.
    pub fn new(inner: S, allowed: Vec<Method>) -> Self {
        Self {
            inner,
            allowed,
            state: PreflightState::Init,
        }
    }

    pub fn state(&self) -> PreflightState {
        self.state
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn allow_header(&self) -> String {
        let mut methods = self.allowed.clone();
        if !methods.contains(&Method::Options) {
            methods.push(Method::Options);
        }
        methods
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl<S: ResponseSink> ResponseSink for CorsPreflight<S> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.state == PreflightState::Init
            && status == StatusCode::NOT_FOUND
            && !self.allowed.is_empty()
        {
            self.state = PreflightState::Proxying;
            let allow = self.allow_header();
            debug!(allow = %allow, "answering preflight");
            let headers = self.inner.headers_mut();
            match HeaderValue::from_str(&allow) {
                Ok(value) => {
                    headers.insert(ALLOW, value);
                }
                Err(e) => warn!(error = %e, "invalid Allow header"),
            }
            apply_cors_headers(headers);
            self.inner.write_header(StatusCode::OK);
            return;
        }
        if self.state == PreflightState::Init {
            self.state = PreflightState::HeaderWritten;
        }
        self.inner.write_header(status);
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        match self.state {
            PreflightState::Proxying => buf.len(),
            PreflightState::Init => {
                self.state = PreflightState::HeaderWritten;
                self.inner.write(buf)
            }
            PreflightState::HeaderWritten => self.inner.write(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferedSink;
    use http_body_util::BodyExt;

    fn allow_set(headers: &HeaderMap) -> Vec<String> {
        let mut methods: Vec<String> = headers[ALLOW]
            .to_str()
            .unwrap()
            .split(", ")
            .map(str::to_string)
            .collect();
        methods.sort();
        methods
    }

    #[tokio::test]
    async fn not_found_with_known_methods_becomes_preflight() {
        let mut proxy = CorsPreflight::new(BufferedSink::new(), vec![Method::Get, Method::Post]);
        proxy.write_header(StatusCode::NOT_FOUND);
        assert_eq!(proxy.state(), PreflightState::Proxying);
        assert_eq!(proxy.write(b"404 page not found"), 18);
        proxy.write_header(StatusCode::INTERNAL_SERVER_ERROR);

        let resp = proxy.into_inner().into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(allow_set(resp.headers()), ["GET", "OPTIONS", "POST"]);
        assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(resp.headers()[CACHE_CONTROL], "must-revalidate");
        assert!(resp.into_body().collect().await.unwrap().to_bytes().is_empty());
    }

    #[test]
    fn options_is_not_duplicated() {
        let mut proxy =
            CorsPreflight::new(BufferedSink::new(), vec![Method::Options, Method::Get]);
        proxy.write_header(StatusCode::NOT_FOUND);
        let resp = proxy.into_inner().into_response();
        assert_eq!(resp.headers()[ALLOW], "OPTIONS, GET");
    }

    #[tokio::test]
    async fn unknown_path_passes_404_through() {
        let mut proxy = CorsPreflight::new(BufferedSink::new(), vec![]);
        proxy.write_header(StatusCode::NOT_FOUND);
        assert_eq!(proxy.state(), PreflightState::HeaderWritten);
        proxy.write(b"missing");
        let resp = proxy.into_inner().into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(!resp.headers().contains_key(ALLOW));
        assert_eq!(
            resp.into_body().collect().await.unwrap().to_bytes(),
            "missing"
        );
    }

    #[test]
    fn other_statuses_pass_through() {
        let mut proxy = CorsPreflight::new(BufferedSink::new(), vec![Method::Get]);
        proxy.write_header(StatusCode::OK);
        assert_eq!(proxy.state(), PreflightState::HeaderWritten);
        // A later 404 can no longer trigger the preflight.
        proxy.write_header(StatusCode::NOT_FOUND);
        assert_eq!(proxy.state(), PreflightState::HeaderWritten);
        assert_eq!(proxy.into_inner().into_response().status(), StatusCode::OK);
    }

    #[test]
    fn body_before_status_passes_through() {
        let mut proxy = CorsPreflight::new(BufferedSink::new(), vec![Method::Get]);
        proxy.write(b"x");
        assert_eq!(proxy.state(), PreflightState::HeaderWritten);
        assert_eq!(proxy.into_inner().status(), Some(StatusCode::OK));
    }
}
