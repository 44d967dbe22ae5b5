//! Event fan-out.
//!
//! An [`EventBus`] stamps data into an [`Event`] and hands it to a
//! [`Dispatcher`]. [`MultiDispatcher`] composes several dispatchers and stops
//! at the first error.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_state::model::{Event, EventType};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

/// Something that reacts to published events.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, event: &Event) -> Result<()>;
}

/// Runs every dispatcher in order, failing fast.
#[derive(Clone, Default)]
pub struct MultiDispatcher {
    dispatchers: Vec<Arc<dyn Dispatcher>>,
}

impl MultiDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    pub fn push(&mut self, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatchers.push(dispatcher);
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}

#[async_trait]
impl Dispatcher for MultiDispatcher {
    async fn dispatch(&self, event: &Event) -> Result<()> {
        for dispatcher in &self.dispatchers {
            dispatcher.dispatch(event).await?;
        }
        Ok(())
    }
}

/// Publishes typed events to a dispatcher.
#[derive(Clone)]
pub struct EventBus {
    dispatcher: Arc<dyn Dispatcher>,
}

impl EventBus {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// A bus whose events go nowhere.
    pub fn noop() -> Self {
        Self::new(Arc::new(MultiDispatcher::new()))
    }

    /// Build an event with a fresh id around `data` and dispatch it.
    pub async fn publish<T: Serialize + ?Sized + Sync>(
        &self,
        namespace_id: Option<i64>,
        event_type: EventType,
        data: &T,
    ) -> Result<Event> {
        let event = Event::new(namespace_id, event_type, serde_json::to_value(data)?);
        debug!(event_id = %event.id, event_type = %event_type.as_str(), "publishing event");
        self.dispatcher.dispatch(&event).await?;
        Ok(event)
    }
}
