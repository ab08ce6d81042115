mod config;
mod routes;

pub use config::{
    DEFAULT_BIND, DEFAULT_PORT, DEFAULT_PRIVATE_KEY_PATH, DEFAULT_PUBLIC_KEY_PATH,
    DEFAULT_SHUTDOWN_TIMEOUT_SECS, ServerSettings, load_stage_variables, read_key_file,
};
pub use routes::{
    Endpoint, Method, PathTemplate, ROUTE_GREETING, ROUTE_LOGIN, ROUTE_LOGIN_USER, Resolution,
    Route, RouteTable, UnknownMethod,
};
