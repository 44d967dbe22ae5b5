//! Outbound webhook delivery.
//!
//! For an event bound to a namespace, every active webhook of the namespace
//! root whose event mask contains the event type receives a signed JSON POST.
//! Every attempt, successful or not, is appended to the delivery log; a
//! transport failure is recorded there and otherwise swallowed.

pub mod signature;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_state::model::{Delivery, Event, EventType, Headers, NewDelivery, Webhook};
use kiln_state::{DeliveryLog, HookStore, NamespaceStore};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::HookError;
use crate::event::Dispatcher;
use crate::obs;

pub use signature::{sign, verify, SIGNATURE_HEADER};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on the captured response body.
pub const DEFAULT_BODY_LIMIT: usize = 64 * 1024;

pub const DEFAULT_PRODUCT: &str = "Kiln";

/// Posts events to webhooks and records every attempt.
#[derive(Clone)]
pub struct HookDispatcher {
    namespaces: Arc<dyn NamespaceStore>,
    hooks: Arc<dyn HookStore>,
    log: Arc<dyn DeliveryLog>,
    product: String,
    timeout: Duration,
    body_limit: usize,
}

impl HookDispatcher {
    pub fn new(
        namespaces: Arc<dyn NamespaceStore>,
        hooks: Arc<dyn HookStore>,
        log: Arc<dyn DeliveryLog>,
    ) -> Self {
        Self {
            namespaces,
            hooks,
            log,
            product: DEFAULT_PRODUCT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cap on the captured response body; `0` keeps everything.
    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }

    pub fn user_agent(&self) -> String {
        format!("{}-Hook", self.product)
    }

    fn request_headers(
        &self,
        hook: &Webhook,
        event_type: EventType,
        body: &str,
    ) -> Result<Headers, HookError> {
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/json");
        headers.append("Content-Type", "charset=utf-8");
        headers.set("Accept", "*/*");
        headers.set("User-Agent", self.user_agent());
        headers.set("X-Event", event_type.as_str());
        headers.set("X-Hook-ID", hook.id.to_string());
        if let Some(secret) = hook.secret.as_deref().filter(|s| !s.is_empty()) {
            headers.set(SIGNATURE_HEADER, sign(secret, body.as_bytes())?);
        }
        Ok(headers)
    }

    /// Deliver `event` to every matching hook. Returns the recorded
    /// deliveries in hook order.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type.as_str()))]
    pub async fn deliver(&self, event: &Event) -> Result<Vec<Delivery>, HookError> {
        let Some(namespace_id) = event.namespace_id else {
            return Ok(Vec::new());
        };
        let namespace = match self.namespaces.get_namespace(namespace_id).await {
            Ok(ns) => ns,
            Err(e) if e.is_not_found() => {
                debug!(namespace_id, "namespace gone, nothing to deliver");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let hooks: Vec<Webhook> = self
            .hooks
            .webhooks(namespace.root(), true)
            .await?
            .into_iter()
            .filter(|h| h.wants(event.event_type))
            .collect();
        if hooks.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::to_string(&event.data)?;
        let mut deliveries = Vec::with_capacity(hooks.len());
        for hook in &hooks {
            let headers = self.request_headers(hook, event.event_type, &body)?;
            let delivery = self
                .send(hook, event.id, event.event_type, headers, body.clone(), false)
                .await?;
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }

    /// Replay the original delivery of `event_id` to `webhook_id` with the
    /// same headers and body.
    #[instrument(skip(self))]
    pub async fn redeliver(&self, webhook_id: i64, event_id: Uuid) -> Result<Delivery, HookError> {
        let original = self
            .log
            .original_delivery(webhook_id, event_id)
            .await?
            .ok_or(HookError::NotFound {
                webhook_id,
                event_id,
            })?;
        let hook = self.hooks.get_webhook(webhook_id).await?;
        self.send(
            &hook,
            original.event_id,
            original.event_type,
            original.request_headers,
            original.request_body,
            true,
        )
        .await
    }

    async fn send(
        &self,
        hook: &Webhook,
        event_id: Uuid,
        event_type: EventType,
        headers: Headers,
        body: String,
        redelivery: bool,
    ) -> Result<Delivery, HookError> {
        let exchange = transport::post(
            &hook.payload_url,
            hook.ssl,
            &headers,
            &body,
            self.timeout,
            self.body_limit,
        )
        .await?;
        if let Some(err) = &exchange.error {
            obs::emit_delivery_failed(hook.id, err);
        }

        let delivery = self
            .log
            .append_delivery(NewDelivery {
                webhook_id: hook.id,
                event_id,
                event_type,
                error: exchange.error,
                redelivery,
                request_headers: headers,
                request_body: body,
                response_code: exchange.code,
                response_headers: exchange.headers,
                response_body: exchange.body,
                response_truncated: exchange.truncated,
                duration_ms: exchange.duration_ms,
            })
            .await?;
        obs::emit_delivery_recorded(
            hook.id,
            event_type.as_str(),
            delivery.response_code,
            delivery.duration_ms,
            delivery.redelivery,
        );
        Ok(delivery)
    }
}

#[async_trait]
impl Dispatcher for HookDispatcher {
    async fn dispatch(&self, event: &Event) -> crate::Result<()> {
        self.deliver(event).await?;
        Ok(())
    }
}
