//! SurrealDB backend - connection and shared helpers
//!
//! `SurrealHandle` implements every storage trait. Supports in-memory,
//! local (`surrealkv://`) and cloud (WebSocket) connections.

mod builds;
mod crons;
mod hooks;
pub mod migrations;
pub mod schema;

use serde::de::DeserializeOwned;
use surrealdb::engine::any::Any;
use surrealdb::method::Query;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::{StateError, StorageError};
use crate::storage_traits::StorageResult;
use crate::Result;
use schema::{CountRow, SequenceRow};

const DEFAULT_NAMESPACE: &str = "kiln";
const DEFAULT_DATABASE: &str = "main";

/// Configuration for SurrealDB Cloud connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "kiln")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new cloud configuration for a database user
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

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "kiln")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false") - set to "true" for root users
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SURREALDB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
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

/// SurrealDB connection handle for Kiln
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn setup_db() -> Result<Self> {
        info!("Connecting to SurrealDB (in-memory)");
        Self::connect_url("mem://").await
    }

    /// Connect to SurrealDB Cloud
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn setup_cloud(config: CloudConfig) -> Result<Self> {
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
            .map_err(|e| {
                StateError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        let handle = SurrealHandle { db };
        migrations::init_schema(&handle.db).await?;

        info!("SurrealDB Cloud connected and schema initialized");
        Ok(handle)
    }

    /// Connect using environment variables
    ///
    /// If SURREALDB_ENDPOINT is set, connects to cloud.
    /// If SURREALDB_URL is set, connects to that URL.
    /// Otherwise, persists locally under `data_dir` with surrealkv.
    #[instrument(skip_all)]
    pub async fn setup_from_env(data_dir: &str) -> Result<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            info!("Cloud config found, connecting to SurrealDB Cloud");
            return Self::setup_cloud(config).await;
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            info!("SURREALDB_URL found, connecting to {}", url);
            return Self::connect_url(&url).await;
        }

        std::fs::create_dir_all(data_dir).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                data_dir, e
            ))
        })?;
        let url = format!("surrealkv://{}", data_dir);
        info!("No cloud config or SURREALDB_URL found, using local persistence: {}", url);
        Self::connect_url(&url).await
    }

    async fn connect_url(url: &str) -> Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        let handle = SurrealHandle { db };
        migrations::init_schema(&handle.db).await?;
        Ok(handle)
    }

    // -- shared helpers ------------------------------------------------------

    /// Mint the next numeric id for `table`.
    async fn next_id(&self, table: &'static str) -> StorageResult<i64> {
        let mut res = self
            .db
            .query(
                "UPSERT type::thing('sequences', $table) \
                 SET counter = (counter OR 0) + 1 RETURN counter",
            )
            .bind(("table", table))
            .await
            .map_err(backend)?;

        let rows: Vec<SequenceRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .map(|r| r.counter)
            .ok_or_else(|| StorageError::Backend(format!("sequence {table} returned no row")))
    }

    /// Run a query with a single `$id` binding and return every row.
    async fn select_by<T: DeserializeOwned>(
        &self,
        sql: &'static str,
        id: i64,
    ) -> StorageResult<Vec<T>> {
        let mut res = self
            .db
            .query(sql)
            .bind(("id", id))
            .await
            .map_err(backend)?;
        res.take(0).map_err(backend)
    }

    /// Like `select_by` but returns the first row or `NotFound`.
    async fn fetch_one<T: DeserializeOwned>(
        &self,
        sql: &'static str,
        kind: &'static str,
        id: i64,
    ) -> StorageResult<T> {
        self.select_by::<T>(sql, id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found(kind, id))
    }

    fn batch(&self) -> Batch<'_> {
        Batch::begin(&self.db)
    }

    async fn insert<T>(&self, table: &'static str, row: T) -> StorageResult<()>
    where
        T: serde::Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let _created: Option<T> = self
            .db
            .create(table)
            .content(row)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

/// Row writes queued into a single `BEGIN`/`COMMIT` block.
///
/// Nothing reaches the database until [`Batch::commit`]; a failing
/// statement rolls back every row before it.
struct Batch<'r> {
    query: Query<'r, Any>,
    rows: usize,
}

impl<'r> Batch<'r> {
    fn begin(db: &'r Surreal<Any>) -> Self {
        Batch {
            query: db.query("BEGIN TRANSACTION"),
            rows: 0,
        }
    }

    fn create<T>(mut self, table: &'static str, row: T) -> Self
    where
        T: serde::Serialize + 'static,
    {
        let var = format!("row{}", self.rows);
        self.query = self
            .query
            .query(format!("CREATE {table} CONTENT ${var}"))
            .bind((var, row));
        self.rows += 1;
        self
    }

    fn statement(mut self, sql: &'static str) -> Self {
        self.query = self.query.query(sql);
        self
    }

    fn bind<T>(mut self, name: &'static str, value: T) -> Self
    where
        T: serde::Serialize + 'static,
    {
        self.query = self.query.bind((name, value));
        self
    }

    async fn commit(self) -> StorageResult<()> {
        self.query
            .query("COMMIT TRANSACTION")
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn count(rows: Vec<CountRow>) -> u64 {
    rows.into_iter().next().map(|r| r.count).unwrap_or(0)
}
