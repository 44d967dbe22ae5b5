//! Namespaces, webhooks and the delivery log rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{EventMask, EventType};
use super::headers::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Internal,
    Private,
}

/// A group of builds, crons and webhooks. Child namespaces point at the
/// root they were created under; webhooks always hang off the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: i64,
    pub user_id: i64,
    pub root_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub name: String,
    pub path: String,
    pub description: String,
    pub visibility: Visibility,
    /// Users other than the owner who may see a private namespace.
    pub collaborators: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

impl Namespace {
    /// Id of the root namespace this one belongs to.
    pub fn root(&self) -> i64 {
        self.root_id.unwrap_or(self.id)
    }

    pub fn is_root(&self) -> bool {
        self.root_id.is_none()
    }

    /// Whether `viewer` may see the namespace. Anonymous viewers are `None`
    /// and only ever see public namespaces.
    pub fn has_access(&self, viewer: Option<i64>) -> bool {
        match self.visibility {
            Visibility::Public => true,
            Visibility::Internal => viewer.is_some(),
            Visibility::Private => match viewer {
                Some(id) => id == self.user_id || self.collaborators.contains(&id),
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNamespace {
    pub user_id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub description: String,
    pub visibility: Visibility,
}

/// Outbound HTTP subscription owned by a root namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub user_id: i64,
    pub namespace_id: i64,
    pub payload_url: String,
    /// Signing secret, already decrypted.
    pub secret: Option<String>,
    pub ssl: bool,
    pub events: EventMask,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn wants(&self, typ: EventType) -> bool {
        self.active && self.events.contains(typ)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWebhook {
    pub user_id: i64,
    pub namespace_id: i64,
    pub payload_url: String,
    pub secret: Option<String>,
    pub ssl: bool,
    pub events: EventMask,
    pub active: bool,
}

/// One attempt to POST an event to a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub webhook_id: i64,
    pub event_id: Uuid,
    pub event_type: EventType,
    /// Transport error, when the request never produced a response.
    pub error: Option<String>,
    pub redelivery: bool,
    pub request_headers: Headers,
    pub request_body: String,
    pub response_code: Option<u16>,
    pub response_headers: Option<Headers>,
    pub response_body: Option<String>,
    pub response_truncated: bool,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && matches!(self.response_code, Some(200..=299))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDelivery {
    pub webhook_id: i64,
    pub event_id: Uuid,
    pub event_type: EventType,
    pub error: Option<String>,
    pub redelivery: bool,
    pub request_headers: Headers,
    pub request_body: String,
    pub response_code: Option<u16>,
    pub response_headers: Option<Headers>,
    pub response_body: Option<String>,
    pub response_truncated: bool,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace(visibility: Visibility) -> Namespace {
        Namespace {
            id: 3,
            user_id: 10,
            root_id: None,
            parent_id: None,
            name: "infra".into(),
            path: "infra".into(),
            description: String::new(),
            visibility,
            collaborators: vec![11],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn public_namespace_is_open_to_everyone() {
        let ns = namespace(Visibility::Public);
        assert!(ns.has_access(None));
        assert!(ns.has_access(Some(99)));
    }

    #[test]
    fn internal_namespace_needs_a_logged_in_viewer() {
        let ns = namespace(Visibility::Internal);
        assert!(!ns.has_access(None));
        assert!(ns.has_access(Some(99)));
    }

    #[test]
    fn private_namespace_is_owner_and_collaborators_only() {
        let ns = namespace(Visibility::Private);
        assert!(ns.has_access(Some(10)));
        assert!(ns.has_access(Some(11)));
        assert!(!ns.has_access(Some(99)));
        assert!(!ns.has_access(None));
    }

    #[test]
    fn root_of_a_child_is_its_root_id() {
        let mut ns = namespace(Visibility::Public);
        assert_eq!(ns.root(), 3);
        ns.root_id = Some(1);
        assert_eq!(ns.root(), 1);
        assert!(!ns.is_root());
    }

    #[test]
    fn inactive_hooks_want_nothing() {
        let mut hook = Webhook {
            id: 1,
            user_id: 10,
            namespace_id: 3,
            payload_url: "http://localhost/hook".into(),
            secret: None,
            ssl: false,
            events: EventType::BuildStarted | EventType::BuildFinished,
            active: true,
            created_at: Utc::now(),
        };
        assert!(hook.wants(EventType::BuildStarted));
        assert!(!hook.wants(EventType::BuildTagged));
        hook.active = false;
        assert!(!hook.wants(EventType::BuildStarted));
    }
}
