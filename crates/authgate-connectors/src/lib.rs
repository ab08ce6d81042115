use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use authgate_api::{
    CredentialCheck, CredentialStore, GatewayError, STAGE_DB_HOST, STAGE_DB_NAME, STAGE_DB_PASS,
    STAGE_DB_PORT, STAGE_DB_USER, StageVariables,
};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use tracing::debug;

pub const DEFAULT_DB_PORT: u16 = 3306;
pub const MAX_OPEN_CONNECTIONS: u32 = 20;
pub const DB_TIMEOUT: Duration = Duration::from_secs(30);

const CREDENTIAL_QUERY: &str = "select 1 from users where username = ? and password = ?";

/// Database coordinates taken from stage variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSettings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl DbSettings {
    pub fn from_stage(stage: &StageVariables) -> Result<Self, GatewayError> {
        let get = |key: &str| stage.get(key).cloned().unwrap_or_default();
        let port = match stage.get(STAGE_DB_PORT).map(|p| p.trim()) {
            None | Some("") => DEFAULT_DB_PORT,
            Some(p) => p
                .parse()
                .map_err(|_| GatewayError::Backend(format!("invalid {STAGE_DB_PORT}: {p}")))?,
        };
        Ok(Self {
            user: get(STAGE_DB_USER),
            password: get(STAGE_DB_PASS),
            host: get(STAGE_DB_HOST),
            port,
            database: get(STAGE_DB_NAME),
        })
    }

    pub fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .charset("utf8")
            .collation("utf8_general_ci")
    }
}

/// Checks credentials against the `users` table.
///
/// A pool is opened for each check and closed afterwards; nothing is held
/// between requests.
#[derive(Debug, Clone, Default)]
pub struct MySqlCredentialStore;

#[async_trait]
impl CredentialStore for MySqlCredentialStore {
    async fn check(
        &self,
        stage: &StageVariables,
        username: &str,
        password: &str,
    ) -> Result<CredentialCheck, GatewayError> {
        let settings = DbSettings::from_stage(stage)?;
        debug!(host = %settings.host, port = settings.port, db = %settings.database, "checking credentials");

        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_OPEN_CONNECTIONS)
            .min_connections(0)
            .acquire_timeout(DB_TIMEOUT)
            .idle_timeout(DB_TIMEOUT)
            .connect_lazy_with(settings.connect_options());

        let row = sqlx::query(CREDENTIAL_QUERY)
            .bind(username)
            .bind(password)
            .fetch_optional(&pool)
            .await;
        pool.close().await;

        match row {
            Ok(Some(_)) => Ok(CredentialCheck::Accepted),
            Ok(None) => Ok(CredentialCheck::Rejected),
            Err(e) => Err(GatewayError::Backend(e.to_string())),
        }
    }
}

/// Credentials held in memory, for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    users: BTreeMap<String, String>,
    unavailable: bool,
}

impl StaticCredentialStore {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
            unavailable: false,
        }
    }

    /// A store whose every check fails with a backend error.
    pub fn unavailable() -> Self {
        Self {
            users: BTreeMap::new(),
            unavailable: true,
        }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn check(
        &self,
        _stage: &StageVariables,
        username: &str,
        password: &str,
    ) -> Result<CredentialCheck, GatewayError> {
        if self.unavailable {
            return Err(GatewayError::Backend("credential store unavailable".to_string()));
        }
        match self.users.get(username) {
            Some(expected) if expected == password => Ok(CredentialCheck::Accepted),
            _ => Ok(CredentialCheck::Rejected),
        }
    }
}
