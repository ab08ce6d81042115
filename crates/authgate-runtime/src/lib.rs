use std::sync::Arc;

use authgate_api::{
    CanonicalRequest, CanonicalResponse, CredentialCheck, CredentialStore, GatewayError,
    StageVariables, status,
};
use authgate_auth::{CLAIM_USERNAME, TokenAuthority, strip_bearer};
use authgate_connectors::MySqlCredentialStore;
use authgate_core::{Endpoint, RouteTable};
use serde_json::json;
use tracing::{debug, error, info};

pub const GREETING: &str = "Have a nice day";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const PARAM_USERNAME: &str = "username";
pub const PARAM_PASSWORD: &str = "password";

const MSG_BAD_CREDENTIALS: &str = "credentials are not accepted";
const MSG_BAD_TOKEN: &str = "token is not accepted";
const MSG_BACKEND: &str = "credential check failed";

/// The top-level gateway: route table, token authority and credential store.
///
/// Shared by both invocation modes; handlers behave identically whichever
/// adapter called them.
pub struct Gateway {
    routes: RouteTable,
    authority: TokenAuthority,
    credentials: Arc<dyn CredentialStore>,
}

impl Gateway {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self::with_routes(RouteTable::standard(), credentials)
    }

    pub fn with_routes(routes: RouteTable, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            routes,
            authority: TokenAuthority::new(),
            credentials,
        }
    }

    /// The production wiring: standard routes backed by MySQL.
    pub fn with_mysql() -> Self {
        Self::new(Arc::new(MySqlCredentialStore))
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn authority(&self) -> &TokenAuthority {
        &self.authority
    }

    /// Parse key material up front so a broken key pair stops startup.
    pub fn preload_keys(&self, stage: &StageVariables) -> Result<(), GatewayError> {
        self.authority.ensure_keys_loaded(stage)?;
        Ok(())
    }

    /// Exact-match dispatch on `METHOD+resource-path`, as used when the
    /// hosting platform has already resolved the template.
    ///
    /// An unknown route is a `404` response, not an error. `Err` is only
    /// returned for fatal key-material failures.
    pub async fn dispatch(&self, req: &CanonicalRequest) -> Result<CanonicalResponse, GatewayError> {
        let method = &req.context.method;
        let path = &req.context.path;
        match self.routes.lookup(method, path) {
            Some(route) => self.invoke(route.endpoint, req).await,
            None => {
                debug!(method = %method, path = %path, "no route");
                Ok(not_found(method, path))
            }
        }
    }

    pub async fn invoke(
        &self,
        endpoint: Endpoint,
        req: &CanonicalRequest,
    ) -> Result<CanonicalResponse, GatewayError> {
        match endpoint {
            Endpoint::Greeting => Ok(greeting()),
            Endpoint::Authenticate => self.authenticate(req).await,
            Endpoint::TestToken => self.test_token(req),
        }
    }

    /// `POST /login/{username}?password=...`
    async fn authenticate(&self, req: &CanonicalRequest) -> Result<CanonicalResponse, GatewayError> {
        let username = req.path_param(PARAM_USERNAME).unwrap_or_default();
        let password = req.query_param(PARAM_PASSWORD).unwrap_or_default();

        match self
            .credentials
            .check(&req.stage_variables, username, password)
            .await
        {
            Ok(CredentialCheck::Accepted) => {}
            Ok(CredentialCheck::Rejected) => {
                info!(username = %username, "credentials rejected");
                return Ok(CanonicalResponse::new(
                    status::UNAUTHORIZED,
                    MSG_BAD_CREDENTIALS,
                ));
            }
            Err(e) => {
                error!(error = %e, username = %username, "credential check failed");
                return Ok(CanonicalResponse::new(
                    status::INTERNAL_SERVER_ERROR,
                    MSG_BACKEND,
                ));
            }
        }

        self.authority.ensure_keys_loaded(&req.stage_variables)?;
        let bearer = format!("Bearer {}", self.authority.issue_token(username)?);
        info!(username = %username, "token issued");

        Ok(
            CanonicalResponse::new(status::OK, json!({ HEADER_AUTHORIZATION: bearer }))
                .with_header(HEADER_AUTHORIZATION, bearer),
        )
    }

    /// `GET /login` with an `Authorization` header, with or without `Bearer `.
    fn test_token(&self, req: &CanonicalRequest) -> Result<CanonicalResponse, GatewayError> {
        self.authority.ensure_keys_loaded(&req.stage_variables)?;

        let header = req.header(HEADER_AUTHORIZATION).unwrap_or_default();
        match self.authority.verify_token(strip_bearer(header.trim())) {
            Ok(username) => Ok(CanonicalResponse::new(
                status::OK,
                json!({ CLAIM_USERNAME: username }),
            )),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                debug!(error = %e, "token rejected");
                Ok(CanonicalResponse::new(status::UNAUTHORIZED, MSG_BAD_TOKEN))
            }
        }
    }
}

pub fn greeting() -> CanonicalResponse {
    CanonicalResponse::new(status::OK, GREETING)
}

pub fn not_found(method: &str, path: &str) -> CanonicalResponse {
    CanonicalResponse::error(
        status::NOT_FOUND,
        format!("No function found for '{method}' '{path}'"),
    )
}
