//! `NamespaceStore`, `HookStore` and `DeliveryLog` over SurrealDB.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::schema::*;
use super::{backend, SurrealHandle};
use crate::error::StorageError;
use crate::model::*;
use crate::storage_traits::*;

#[async_trait]
impl NamespaceStore for SurrealHandle {
    async fn create_namespace(&self, new: NewNamespace) -> StorageResult<Namespace> {
        let (root_id, path) = match new.parent_id {
            Some(pid) => {
                let parent = self.get_namespace(pid).await?;
                (Some(parent.root()), format!("{}/{}", parent.path, new.name))
            }
            None => (None, new.name.clone()),
        };
        let row = NamespaceRow {
            id: None,
            namespace_id: self.next_id("namespaces").await?,
            user_id: new.user_id,
            root_id,
            parent_id: new.parent_id,
            name: new.name,
            path,
            description: new.description,
            visibility: new.visibility,
            collaborators: Vec::new(),
            created_at: Utc::now(),
        };
        let ns = Namespace::from(row.clone());
        self.insert("namespaces", row).await?;
        Ok(ns)
    }

    async fn get_namespace(&self, id: i64) -> StorageResult<Namespace> {
        self.fetch_one::<NamespaceRow>(
            "SELECT * FROM namespaces WHERE namespace_id = $id",
            "namespace",
            id,
        )
        .await
        .map(Namespace::from)
    }

    async fn add_collaborator(&self, namespace_id: i64, user_id: i64) -> StorageResult<()> {
        let mut res = self
            .db
            .query(
                "UPDATE namespaces SET collaborators = array::union(collaborators, [$user]) \
                 WHERE namespace_id = $id",
            )
            .bind(("user", user_id))
            .bind(("id", namespace_id))
            .await
            .map_err(backend)?;
        let rows: Vec<NamespaceRow> = res.take(0).map_err(backend)?;
        if rows.is_empty() {
            return Err(StorageError::not_found("namespace", namespace_id));
        }
        Ok(())
    }
}

#[async_trait]
impl HookStore for SurrealHandle {
    async fn create_webhook(&self, new: NewWebhook) -> StorageResult<Webhook> {
        let row = WebhookRow {
            id: None,
            webhook_id: self.next_id("webhooks").await?,
            user_id: new.user_id,
            namespace_id: new.namespace_id,
            payload_url: new.payload_url,
            secret: new.secret,
            ssl: new.ssl,
            events: new.events.bits(),
            active: new.active,
            created_at: Utc::now(),
        };
        let hook = Webhook::from(row.clone());
        self.insert("webhooks", row).await?;
        Ok(hook)
    }

    async fn get_webhook(&self, id: i64) -> StorageResult<Webhook> {
        self.fetch_one::<WebhookRow>("SELECT * FROM webhooks WHERE webhook_id = $id", "webhook", id)
            .await
            .map(Webhook::from)
    }

    async fn webhooks(&self, namespace_id: i64, active_only: bool) -> StorageResult<Vec<Webhook>> {
        let sql = if active_only {
            "SELECT * FROM webhooks WHERE namespace_id = $id AND active = true ORDER BY webhook_id ASC"
        } else {
            "SELECT * FROM webhooks WHERE namespace_id = $id ORDER BY webhook_id ASC"
        };
        let rows: Vec<WebhookRow> = self.select_by(sql, namespace_id).await?;
        Ok(rows.into_iter().map(Webhook::from).collect())
    }
}

#[async_trait]
impl DeliveryLog for SurrealHandle {
    #[instrument(skip(self, new), fields(webhook_id = new.webhook_id, event_id = %new.event_id))]
    async fn append_delivery(&self, new: NewDelivery) -> StorageResult<Delivery> {
        let wanted_original = !new.redelivery;
        let (webhook_id, event_id) = (new.webhook_id, new.event_id.to_string());
        let row = DeliveryRow::new(self.next_id("deliveries").await?, new);
        let id = row.delivery_id;

        self.batch()
            .statement(
                "LET $originals = (SELECT VALUE delivery_id FROM deliveries \
                 WHERE webhook_id = $hook AND event_id = $event AND redelivery = false)",
            )
            .create("deliveries", row)
            .statement(
                "IF array::len($originals) > 0 { \
                 UPDATE deliveries SET redelivery = true WHERE delivery_id = $id }",
            )
            .bind("hook", webhook_id)
            .bind("event", event_id)
            .bind("id", id)
            .commit()
            .await?;

        let delivery = self.get_delivery(id).await?;
        if wanted_original && delivery.redelivery {
            debug!("original delivery exists, recorded as redelivery");
        }
        Ok(delivery)
    }

    async fn original_delivery(
        &self,
        webhook_id: i64,
        event_id: Uuid,
    ) -> StorageResult<Option<Delivery>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM deliveries WHERE webhook_id = $hook AND event_id = $event \
                 AND redelivery = false ORDER BY delivery_id ASC LIMIT 1",
            )
            .bind(("hook", webhook_id))
            .bind(("event", event_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DeliveryRow> = res.take(0).map_err(backend)?;
        rows.into_iter().next().map(DeliveryRow::into_model).transpose()
    }

    async fn deliveries(&self, webhook_id: i64) -> StorageResult<Vec<Delivery>> {
        let rows: Vec<DeliveryRow> = self
            .select_by(
                "SELECT * FROM deliveries WHERE webhook_id = $id ORDER BY delivery_id ASC",
                webhook_id,
            )
            .await?;
        rows.into_iter().map(DeliveryRow::into_model).collect()
    }

    async fn get_delivery(&self, id: i64) -> StorageResult<Delivery> {
        self.fetch_one::<DeliveryRow>(
            "SELECT * FROM deliveries WHERE delivery_id = $id",
            "delivery",
            id,
        )
        .await?
        .into_model()
    }
}
