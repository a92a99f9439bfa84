//! SurrealDB connection setup
//!
//! Resolves where the store lives (in-memory, explicit URL, cloud, or local
//! surrealkv directory), connects, selects namespace/database and runs the
//! schema migrations.

use std::path::PathBuf;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

const DEFAULT_NAMESPACE: &str = "hypnos";
const DEFAULT_DATABASE: &str = "main";
const DEFAULT_LOCAL_PATH: &str = ".hypnos/db";

/// Configuration for an authenticated remote SurrealDB
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "hypnos")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
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

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - HYPNOS_DB_ENDPOINT (required)
    /// - HYPNOS_DB_USERNAME (required)
    /// - HYPNOS_DB_PASSWORD (required)
    /// - HYPNOS_DB_NAMESPACE (optional, default: "hypnos")
    /// - HYPNOS_DB_DATABASE (optional, default: "main")
    /// - HYPNOS_DB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("HYPNOS_DB_ENDPOINT").map_err(|_| "HYPNOS_DB_ENDPOINT not set")?;
        let username =
            std::env::var("HYPNOS_DB_USERNAME").map_err(|_| "HYPNOS_DB_USERNAME not set")?;
        let password =
            std::env::var("HYPNOS_DB_PASSWORD").map_err(|_| "HYPNOS_DB_PASSWORD not set")?;
        let namespace = std::env::var("HYPNOS_DB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("HYPNOS_DB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("HYPNOS_DB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Where the store lives.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Ephemeral `mem://` database.
    Memory,
    /// Any URL `surrealdb::engine::any` understands, unauthenticated.
    Url(String),
    /// Authenticated remote database.
    Cloud(CloudConfig),
    /// Embedded surrealkv directory.
    Local(PathBuf),
}

impl StoreConfig {
    /// Resolve from the environment.
    ///
    /// Order: HYPNOS_DB_ENDPOINT (cloud) → HYPNOS_DB_URL → local `.hypnos/db`.
    pub fn from_env() -> Self {
        if let Ok(config) = CloudConfig::from_env() {
            return StoreConfig::Cloud(config);
        }
        if let Ok(url) = std::env::var("HYPNOS_DB_URL") {
            return StoreConfig::Url(url);
        }
        StoreConfig::Local(PathBuf::from(DEFAULT_LOCAL_PATH))
    }

    /// Connect, select namespace/database and initialize the schema.
    #[instrument(skip_all)]
    pub async fn connect(&self) -> Result<Surreal<Any>> {
        let db = match self {
            StoreConfig::Memory => {
                info!("Connecting to SurrealDB (in-memory)");
                open("mem://", DEFAULT_NAMESPACE, DEFAULT_DATABASE).await?
            }
            StoreConfig::Url(url) => {
                info!("Connecting to {}", url);
                open(url, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await?
            }
            StoreConfig::Local(path) => {
                std::fs::create_dir_all(path).map_err(|e| {
                    StateError::Connection(format!(
                        "Failed to create database directory {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let url = format!("surrealkv://{}", path.display());
                info!("Using local persistence: {}", url);
                open(&url, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await?
            }
            StoreConfig::Cloud(config) => connect_cloud(config).await?,
        };

        migrations::init_schema(&db).await?;
        Ok(db)
    }
}

async fn open(url: &str, namespace: &str, database: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

    db.use_ns(namespace)
        .use_db(database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    Ok(db)
}

#[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace))]
async fn connect_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    info!("Connecting to SurrealDB Cloud (root={})", config.is_root);

    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
        })?;

    if config.is_root {
        db.signin(Root {
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("Root authentication failed: {}", e)))?;
    } else {
        db.signin(Database {
            namespace: &config.namespace,
            database: &config.database,
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("Database authentication failed: {}", e)))?;
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to select namespace/database: {}", e))
        })?;

    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_config_builder_defaults() {
        let c = CloudConfig::new("wss://db", "u", "p").with_root(true);
        assert_eq!(c.namespace, "hypnos");
        assert_eq!(c.database, "main");
        assert!(c.is_root);
    }
}
