//! Domain entities shared by every layer.

pub mod build;
pub mod cron;
pub mod event;
pub mod headers;
pub mod hook;
pub mod passthrough;
pub mod status;
pub mod user;

pub use build::{
    Artifact, Build, BuildEvent, BuildObject, Job, JobUpdate, Key, NewBuild, NewBuildObject,
    NewJob, NewKey, NewObject, NewStage, NewTrigger, NewVariable, Object, Stage, Tag, Trigger,
    TriggerKind, Variable,
};
pub use cron::{Cron, CronBuild, NewCron, Schedule, UnknownSchedule};
pub use event::{Event, EventMask, EventType, UnknownEventType};
pub use headers::Headers;
pub use hook::{Delivery, Namespace, NewDelivery, NewNamespace, NewWebhook, Visibility, Webhook};
pub use passthrough::{base_name, Mapping, Passthrough};
pub use status::{Status, UnknownStatus};
pub use user::{NewUser, User};
