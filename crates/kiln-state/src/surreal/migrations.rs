//! SurrealDB schema initialization
//!
//! Every table is SCHEMALESS; row shapes live in `schema.rs`. The indexes
//! below back the lookups the storage traits perform. Safe to call multiple
//! times (idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Tables and the indexes defined on each.
const TABLES: &[(&str, &str)] = &[
    (
        "sequences",
        "DEFINE TABLE IF NOT EXISTS sequences SCHEMALESS;",
    ),
    (
        "builds",
        r#"
        DEFINE TABLE IF NOT EXISTS builds SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_build_id ON TABLE builds COLUMNS build_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_build_user ON TABLE builds COLUMNS user_id;
        "#,
    ),
    (
        "triggers",
        r#"
        DEFINE TABLE IF NOT EXISTS triggers SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_trigger_build ON TABLE triggers COLUMNS build_id UNIQUE;
        "#,
    ),
    (
        "tags",
        r#"
        DEFINE TABLE IF NOT EXISTS tags SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_tag_build_name ON TABLE tags COLUMNS build_id, name UNIQUE;
        "#,
    ),
    (
        "stages",
        r#"
        DEFINE TABLE IF NOT EXISTS stages SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_stage_build_name ON TABLE stages COLUMNS build_id, name UNIQUE;
        "#,
    ),
    (
        "jobs",
        r#"
        DEFINE TABLE IF NOT EXISTS jobs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_job_id ON TABLE jobs COLUMNS job_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_job_stage_name ON TABLE jobs COLUMNS stage_id, name UNIQUE;
        "#,
    ),
    (
        "artifacts",
        r#"
        DEFINE TABLE IF NOT EXISTS artifacts SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_artifact_id ON TABLE artifacts COLUMNS artifact_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_artifact_build_name ON TABLE artifacts COLUMNS build_id, name;
        DEFINE INDEX IF NOT EXISTS idx_artifact_user_created ON TABLE artifacts COLUMNS user_id, created_at;
        "#,
    ),
    (
        "objects",
        r#"
        DEFINE TABLE IF NOT EXISTS objects SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_object_user_name ON TABLE objects COLUMNS user_id, name UNIQUE;
        "#,
    ),
    (
        "build_objects",
        r#"
        DEFINE TABLE IF NOT EXISTS build_objects SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_build_object_build ON TABLE build_objects COLUMNS build_id;
        "#,
    ),
    (
        "variables",
        r#"
        DEFINE TABLE IF NOT EXISTS variables SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_variable_build ON TABLE variables COLUMNS build_id;
        "#,
    ),
    (
        "ssh_keys",
        r#"
        DEFINE TABLE IF NOT EXISTS ssh_keys SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_key_build ON TABLE ssh_keys COLUMNS build_id;
        "#,
    ),
    (
        "users",
        r#"
        DEFINE TABLE IF NOT EXISTS users SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_user_id ON TABLE users COLUMNS user_id UNIQUE;
        "#,
    ),
    (
        "crons",
        r#"
        DEFINE TABLE IF NOT EXISTS crons SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_cron_id ON TABLE crons COLUMNS cron_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_cron_next_run ON TABLE crons COLUMNS next_run;
        "#,
    ),
    (
        "cron_builds",
        r#"
        DEFINE TABLE IF NOT EXISTS cron_builds SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_cron_build ON TABLE cron_builds COLUMNS cron_id, build_id UNIQUE;
        "#,
    ),
    (
        "namespaces",
        r#"
        DEFINE TABLE IF NOT EXISTS namespaces SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_namespace_id ON TABLE namespaces COLUMNS namespace_id UNIQUE;
        "#,
    ),
    (
        "webhooks",
        r#"
        DEFINE TABLE IF NOT EXISTS webhooks SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_webhook_namespace ON TABLE webhooks COLUMNS namespace_id;
        "#,
    ),
    (
        "deliveries",
        r#"
        DEFINE TABLE IF NOT EXISTS deliveries SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_delivery_hook_event ON TABLE deliveries COLUMNS webhook_id, event_id;
        "#,
    ),
];

/// Initialize all Kiln tables in SurrealDB.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Kiln SurrealDB schema");

    for (table, sql) in TABLES {
        debug!(table, "defining table");
        db.query(*sql)
            .await
            .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?
            .check()
            .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    }

    info!("Kiln schema initialization complete");
    Ok(())
}
