//! SurrealDB connection setup
//!
//! Supports in-memory (`mem://`), local file (`surrealkv://`) and remote
//! (WebSocket) connections. Every path selects the namespace/database and
//! runs the schema migrations before returning the handle.

use crate::error::StateError;
use crate::migrations;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

pub(crate) const DEFAULT_NAMESPACE: &str = "memtier";
pub(crate) const DEFAULT_DATABASE: &str = "main";

/// Local persistence path used when no connection is configured
pub(crate) const LOCAL_DB_PATH: &str = ".memtier/db";

const ENV_ENDPOINT: &str = "SURREALDB_ENDPOINT";
const ENV_USERNAME: &str = "SURREALDB_USERNAME";
const ENV_PASSWORD: &str = "SURREALDB_PASSWORD";
const ENV_NAMESPACE: &str = "SURREALDB_NAMESPACE";
const ENV_DATABASE: &str = "SURREALDB_DATABASE";
const ENV_ROOT: &str = "SURREALDB_ROOT";
const ENV_URL: &str = "SURREALDB_URL";

/// Authenticated remote connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    /// WebSocket endpoint, e.g. `wss://xxx.aws-use1.surrealdb.cloud`
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    /// Sign in as root instead of as a database user
    pub is_root: bool,
}

impl CloudConfig {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Read `SURREALDB_ENDPOINT`, `_USERNAME` and `_PASSWORD` (required) and
    /// `_NAMESPACE`, `_DATABASE`, `_ROOT` (optional).
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> std::result::Result<Self, String> {
        let required = |key: &str| lookup(key).ok_or_else(|| format!("{key} not set"));
        let mut config = Self::new(
            required(ENV_ENDPOINT)?,
            required(ENV_USERNAME)?,
            required(ENV_PASSWORD)?,
        );
        if let Some(ns) = lookup(ENV_NAMESPACE) {
            config.namespace = ns;
        }
        if let Some(db) = lookup(ENV_DATABASE) {
            config.database = db;
        }
        config.is_root = lookup(ENV_ROOT).is_some_and(|v| v.eq_ignore_ascii_case("true"));
        Ok(config)
    }
}

/// Where [`connect_from_env`] will connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectTarget {
    Cloud(CloudConfig),
    Url(String),
    Local(String),
}

impl ConnectTarget {
    /// Cloud settings win over `SURREALDB_URL`, which wins over local files.
    fn resolve(lookup: impl Fn(&str) -> Option<String>, local_path: &str) -> Self {
        if let Ok(config) = CloudConfig::from_lookup(&lookup) {
            return Self::Cloud(config);
        }
        match lookup(ENV_URL) {
            Some(url) if !url.trim().is_empty() => Self::Url(url),
            _ => Self::Local(local_path.to_string()),
        }
    }
}

fn connection_error(context: &str, e: impl std::fmt::Display) -> StateError {
    StateError::Connection(format!("{context}: {e}"))
}

async fn select_and_migrate(db: &Surreal<Any>, namespace: &str, database: &str) -> Result<()> {
    db.use_ns(namespace)
        .use_db(database)
        .await
        .map_err(|e| connection_error("failed to select namespace/database", e))?;
    migrations::init_schema(db).await
}

/// Connect to `url` without authentication, select the default
/// namespace/database and initialize the schema.
#[instrument]
pub(crate) async fn connect_url(url: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| connection_error(&format!("failed to connect to {url}"), e))?;
    select_and_migrate(&db, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await?;
    Ok(db)
}

/// Connect with credentials and initialize the schema.
#[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
pub(crate) async fn connect_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    info!(root = config.is_root, "connecting to remote SurrealDB");
    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| connection_error(&format!("failed to connect to {}", config.endpoint), e))?;

    let signed_in = if config.is_root {
        db.signin(Root {
            username: &config.username,
            password: &config.password,
        })
        .await
        .map(|_| ())
    } else {
        db.signin(Database {
            namespace: &config.namespace,
            database: &config.database,
            username: &config.username,
            password: &config.password,
        })
        .await
        .map(|_| ())
    };
    signed_in.map_err(|e| connection_error("authentication failed", e))?;

    select_and_migrate(&db, &config.namespace, &config.database).await?;
    Ok(db)
}

/// Connect according to the environment, falling back to local
/// persistence under `local_path`.
#[instrument]
pub(crate) async fn connect_from_env(local_path: &str) -> Result<Surreal<Any>> {
    match ConnectTarget::resolve(|key| std::env::var(key).ok(), local_path) {
        ConnectTarget::Cloud(config) => connect_cloud(&config).await,
        ConnectTarget::Url(url) => {
            info!(%url, "connecting via SURREALDB_URL");
            connect_url(&url).await
        }
        ConnectTarget::Local(path) => {
            std::fs::create_dir_all(&path)
                .map_err(|e| connection_error(&format!("failed to create {path}"), e))?;
            let url = format!("surrealkv://{path}");
            info!(%url, "no remote database configured, using local persistence");
            connect_url(&url).await
        }
    }
}
