//! `CronStore` and `UserStore` over SurrealDB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::instrument;

use super::schema::*;
use super::{backend, count, SurrealHandle};
use crate::error::StorageError;
use crate::model::*;
use crate::storage_traits::*;

#[async_trait]
impl CronStore for SurrealHandle {
    async fn create_cron(&self, new: NewCron) -> StorageResult<Cron> {
        let now = Utc::now();
        let row = CronRow {
            id: None,
            cron_id: self.next_id("crons").await?,
            user_id: new.user_id,
            namespace_id: new.namespace_id,
            name: new.name,
            schedule: new.schedule.as_str().to_string(),
            manifest: new.manifest,
            prev_run: None,
            next_run: new.schedule.next(now),
            created_at: now,
        };
        let cron = row.clone().into_model()?;
        self.insert("crons", row).await?;
        Ok(cron)
    }

    async fn get_cron(&self, id: i64) -> StorageResult<Cron> {
        self.fetch_one::<CronRow>("SELECT * FROM crons WHERE cron_id = $id", "cron", id)
            .await?
            .into_model()
    }

    async fn count_due(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let mut res = self
            .db
            .query("SELECT count() FROM crons WHERE next_run <= $now GROUP ALL")
            .bind(("now", SurrealDatetime::from(now)))
            .await
            .map_err(backend)?;
        let rows: Vec<CountRow> = res.take(0).map_err(backend)?;
        Ok(count(rows))
    }

    #[instrument(skip(self))]
    async fn due_crons(
        &self,
        now: DateTime<Utc>,
        after_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<Cron>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM crons WHERE next_run <= $now AND cron_id > $after \
                 ORDER BY cron_id ASC LIMIT $limit",
            )
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("after", after_id))
            .bind(("limit", limit as i64))
            .await
            .map_err(backend)?;
        let rows: Vec<CronRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(CronRow::into_model).collect()
    }

    async fn record_cron_run(
        &self,
        id: i64,
        prev_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> StorageResult<Cron> {
        let mut res = self
            .db
            .query("UPDATE crons SET prev_run = $prev, next_run = $next WHERE cron_id = $id")
            .bind(("prev", SurrealDatetime::from(prev_run)))
            .bind(("next", SurrealDatetime::from(next_run)))
            .bind(("id", id))
            .await
            .map_err(backend)?;
        let rows: Vec<CronRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("cron", id))?
            .into_model()
    }

    async fn link_cron_build(&self, cron_id: i64, build_id: i64) -> StorageResult<()> {
        self.insert(
            "cron_builds",
            CronBuildRow {
                id: None,
                cron_id,
                build_id,
            },
        )
        .await
    }

    async fn cron_builds(&self, cron_id: i64) -> StorageResult<Vec<i64>> {
        let rows: Vec<CronBuildRow> = self
            .select_by(
                "SELECT * FROM cron_builds WHERE cron_id = $id ORDER BY build_id ASC",
                cron_id,
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.build_id).collect())
    }
}

#[async_trait]
impl UserStore for SurrealHandle {
    async fn create_user(&self, new: NewUser) -> StorageResult<User> {
        let row = UserRow {
            id: None,
            user_id: self.next_id("users").await?,
            username: new.username,
            email: new.email,
            cleanup: new.cleanup,
            created_at: Utc::now(),
        };
        let user = User::from(row.clone());
        self.insert("users", row).await?;
        Ok(user)
    }

    async fn get_user(&self, id: i64) -> StorageResult<User> {
        self.fetch_one::<UserRow>("SELECT * FROM users WHERE user_id = $id", "user", id)
            .await
            .map(User::from)
    }

    async fn get_users(&self, ids: &[i64]) -> StorageResult<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut res = self
            .db
            .query("SELECT * FROM users WHERE user_id IN $ids ORDER BY user_id ASC")
            .bind(("ids", ids.to_vec()))
            .await
            .map_err(backend)?;
        let rows: Vec<UserRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn cleanup_users(&self) -> StorageResult<Vec<User>> {
        let mut res = self
            .db
            .query("SELECT * FROM users WHERE cleanup = true ORDER BY user_id ASC")
            .await
            .map_err(backend)?;
        let rows: Vec<UserRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(User::from).collect())
    }
}
