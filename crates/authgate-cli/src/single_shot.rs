//! Single-shot mode: one canonical request on stdin, one canonical response
//! on stdout.

use std::io::{self, Read, Write};

use anyhow::Context;
use authgate_api::{CanonicalRequest, CanonicalResponse, GatewayError, status};
use authgate_runtime::Gateway;
use tracing::{error, info, warn};

/// What one invocation produced. `fatal` carries a key-material failure the
/// response alone cannot express.
#[derive(Debug)]
pub struct Invocation {
    pub response: CanonicalResponse,
    pub fatal: Option<GatewayError>,
}

impl Invocation {
    fn answered(response: CanonicalResponse) -> Self {
        Self {
            response,
            fatal: None,
        }
    }
}

/// Decode, dispatch and build the response. Every failure short of a broken
/// key pair becomes a response.
pub async fn handle_invocation<R: Read>(gateway: &Gateway, mut input: R) -> Invocation {
    let mut raw = Vec::new();
    if let Err(e) = input.read_to_end(&mut raw) {
        warn!(error = %e, "failed to read request");
        return Invocation::answered(CanonicalResponse::error(
            status::INTERNAL_SERVER_ERROR,
            format!("Failed to read from stdin - {e}"),
        ));
    }

    let req = match CanonicalRequest::from_json(&raw) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "malformed request");
            return Invocation::answered(CanonicalResponse::error(
                status::INTERNAL_SERVER_ERROR,
                e.to_string(),
            ));
        }
    };

    info!(method = %req.context.method, path = %req.context.path, "dispatching");
    match gateway.dispatch(&req).await {
        Ok(response) => Invocation::answered(response),
        Err(e) => {
            error!(error = %e, "fatal error while handling request");
            Invocation {
                response: CanonicalResponse::error(
                    status::INTERNAL_SERVER_ERROR,
                    "internal server error",
                ),
                fatal: Some(e),
            }
        }
    }
}

/// Write the response document followed by a newline.
pub fn emit<W: Write>(mut out: W, resp: &CanonicalResponse) -> anyhow::Result<()> {
    let body = resp.to_json().context("encoding response")?;
    out.write_all(&body).context("writing response")?;
    out.write_all(b"\n").context("writing response")?;
    out.flush().context("flushing response")?;
    Ok(())
}

pub async fn run<R: Read, W: Write>(gateway: &Gateway, input: R, out: W) -> anyhow::Result<()> {
    let invocation = handle_invocation(gateway, input).await;
    info!(status = invocation.response.status, "request completed");
    emit(out, &invocation.response)?;
    match invocation.fatal {
        Some(e) => Err(e).context("key material is unusable"),
        None => Ok(()),
    }
}

pub async fn run_stdio() -> anyhow::Result<()> {
    let gateway = Gateway::with_mysql();
    run(&gateway, io::stdin().lock(), io::stdout().lock()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use authgate_api::{STAGE_JWT_PRIVATE_KEY, STAGE_JWT_PUBLIC_KEY};
    use authgate_connectors::StaticCredentialStore;
    use serde_json::{Value, json};
    use std::sync::Arc;

    const PUBLIC_PEM: &str = include_str!("../../../testdata/jwt.pub");
    const PRIVATE_PEM: &str = include_str!("../../../testdata/jwt.key");

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(StaticCredentialStore::new([(
            "alice".to_string(),
            "wonderland".to_string(),
        )])))
    }

    async fn run_to_json(gateway: &Gateway, input: &[u8]) -> Value {
        let mut out = Vec::new();
        run(gateway, input, &mut out).await.unwrap();
        assert_eq!(out.last(), Some(&b'\n'));
        serde_json::from_slice(&out).unwrap()
    }

    #[tokio::test]
    async fn greeting_round_trip() {
        let input = br#"{"context": {"http-method": "GET", "resource-path": "/"}}"#;
        let resp = run_to_json(&gateway(), input).await;
        assert_eq!(
            resp,
            json!({"status": 200, "header": {}, "body-json": "Have a nice day"})
        );
    }

    #[tokio::test]
    async fn login_through_stdin() {
        let input = json!({
            "body-json": null,
            "params": {
                "path": {"username": "alice"},
                "querystring": {"password": "wonderland"},
                "header": {}
            },
            "stage-variables": {
                STAGE_JWT_PUBLIC_KEY: PUBLIC_PEM,
                STAGE_JWT_PRIVATE_KEY: PRIVATE_PEM
            },
            "context": {"http-method": "post", "resource-path": "/login/{username}"}
        });
        let resp = run_to_json(&gateway(), input.to_string().as_bytes()).await;
        assert_eq!(resp["status"], 200);
        let bearer = resp["header"]["Authorization"].as_str().unwrap();
        assert!(bearer.starts_with("Bearer "));
        assert_eq!(resp["body-json"]["Authorization"], bearer);
    }

    #[tokio::test]
    async fn unknown_route_is_404_document() {
        let input = br#"{"context": {"http-method": "DELETE", "resource-path": "/login"}}"#;
        let resp = run_to_json(&gateway(), input).await;
        assert_eq!(resp["status"], 404);
        assert_eq!(
            resp["body-json"],
            json!({"err": "No function found for 'DELETE' '/login'"})
        );
        assert_eq!(resp["header"], json!({}));
    }

    #[tokio::test]
    async fn malformed_input_is_500() {
        let resp = run_to_json(&gateway(), b"{not json").await;
        assert_eq!(resp["status"], 500);
        assert!(resp["body-json"]["err"].is_string());
    }

    #[tokio::test]
    async fn read_failure_is_500() {
        let invocation = handle_invocation(&gateway(), FailingReader).await;
        assert_eq!(invocation.response.status, status::INTERNAL_SERVER_ERROR);
        assert_eq!(
            invocation.response.body,
            Some(json!({"err": "Failed to read from stdin - pipe closed"}))
        );
        assert!(invocation.fatal.is_none());
    }

    #[tokio::test]
    async fn missing_keys_still_emit_a_response() {
        let input = br#"{"context": {"http-method": "GET", "resource-path": "/login"}}"#;
        let mut out = Vec::new();
        let err = run(&gateway(), &input[..], &mut out).await.unwrap_err();
        assert!(err.to_string().contains("key material"));
        let resp: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(resp["status"], 500);
    }
}
