use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use authgate_api::{GatewayError, STAGE_JWT_PRIVATE_KEY, STAGE_JWT_PUBLIC_KEY, StageVariables};

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "jwt.pub";
pub const DEFAULT_PRIVATE_KEY_PATH: &str = "jwt.key";
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Everything server mode needs before it can bind.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub config_path: PathBuf,
    pub bind: String,
    pub port: u16,
    pub public_key_path: PathBuf,
    pub private_key_path: PathBuf,
    pub shutdown_timeout: Duration,
}

impl ServerSettings {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            public_key_path: PathBuf::from(DEFAULT_PUBLIC_KEY_PATH),
            private_key_path: PathBuf::from(DEFAULT_PRIVATE_KEY_PATH),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Read the stage-variable file and both key files, with the key file
    /// contents taking precedence over any keys in the file.
    pub fn load_stage_variables(&self) -> Result<StageVariables, GatewayError> {
        let mut stage = load_stage_variables(&self.config_path)?;
        let public = read_key_file(&self.public_key_path)?;
        let private = read_key_file(&self.private_key_path)?;
        stage.insert(STAGE_JWT_PUBLIC_KEY.to_string(), public);
        stage.insert(STAGE_JWT_PRIVATE_KEY.to_string(), private);
        Ok(stage)
    }
}

/// Parse a flat JSON object of string values.
pub fn load_stage_variables(path: &Path) -> Result<StageVariables, GatewayError> {
    let content = fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content).map_err(|e| {
        GatewayError::Config(format!(
            "invalid stage variables in {}: {e}",
            path.display()
        ))
    })
}

pub fn read_key_file(path: &Path) -> Result<String, GatewayError> {
    let pem = fs::read_to_string(path).map_err(|e| {
        GatewayError::KeyMaterial(format!("failed to read {}: {e}", path.display()))
    })?;
    if pem.trim().is_empty() {
        return Err(GatewayError::KeyMaterial(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(pem)
}
