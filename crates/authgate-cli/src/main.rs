mod cors;
mod server;
mod single_shot;
mod sink;

use std::path::PathBuf;
use std::time::Duration;

use authgate_core::{
    DEFAULT_BIND, DEFAULT_PORT, DEFAULT_PRIVATE_KEY_PATH, DEFAULT_PUBLIC_KEY_PATH,
    DEFAULT_SHUTDOWN_TIMEOUT_SECS, ServerSettings,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "authgate",
    version,
    about = "Username/password login issuing RS256 bearer tokens",
    long_about = "Without CONFIG, reads one canonical request from stdin and writes the \
                  response to stdout. With CONFIG, serves HTTP until interrupted."
)]
struct Cli {
    /// Stage-variable JSON file; switches to server mode.
    config: Option<PathBuf>,

    #[arg(long, env = "AUTHGATE_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    #[arg(long, env = "AUTHGATE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value = DEFAULT_PUBLIC_KEY_PATH)]
    public_key: PathBuf,

    #[arg(long, default_value = DEFAULT_PRIVATE_KEY_PATH)]
    private_key: PathBuf,

    /// Seconds in-flight connections get to finish after a shutdown signal.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    shutdown_timeout: u64,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn server_settings(&self) -> Option<ServerSettings> {
        let config = self.config.as_ref()?;
        let mut settings = ServerSettings::new(config);
        settings.bind.clone_from(&self.bind);
        settings.port = self.port;
        settings.public_key_path.clone_from(&self.public_key);
        settings.private_key_path.clone_from(&self.private_key);
        settings.shutdown_timeout = Duration::from_secs(self.shutdown_timeout);
        Some(settings)
    }
}

// Logs go to stderr; stdout carries the single-shot response.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("authgate=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.server_settings() {
        Some(settings) => server::run(settings).await,
        None => single_shot::run_stdio().await,
    }
}
