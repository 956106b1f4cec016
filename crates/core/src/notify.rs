//! Notification Fan-out.
//!
//! Everything here runs after the decision has committed. Failures are logged and
//! dropped; they never reach the actor who approved or rejected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::approval::{normalize_role, ApprovalRequest, ApprovalRequestId, EntityType};
use crate::ports::StoreError;

pub const DEFAULT_OBSERVERS_CHANNEL: &str = "observers";
pub const DEFAULT_REALTIME_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Requested,
    Approved,
    Rejected,
    Cancelled,
    Reminder,
}

impl NotificationKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Requested => "approval.requested",
            Self::Approved => "approval.approved",
            Self::Rejected => "approval.rejected",
            Self::Cancelled => "approval.cancelled",
            Self::Reminder => "approval.reminder",
        }
    }

    pub fn from_event_type(value: &str) -> Option<Self> {
        match value.trim() {
            "approval.requested" => Some(Self::Requested),
            "approval.approved" => Some(Self::Approved),
            "approval.rejected" => Some(Self::Rejected),
            "approval.cancelled" => Some(Self::Cancelled),
            "approval.reminder" => Some(Self::Reminder),
            _ => None,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::Requested => "submitted for approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Reminder => "awaiting your approval",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub id: String,
    pub request_id: ApprovalRequestId,
    pub kind: NotificationKind,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event_type: String,
    pub channel: String,
    pub request_id: ApprovalRequestId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

pub fn user_channel(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn role_channel(role: &str) -> String {
    format!("role:{}", normalize_role(role))
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn find_contact(&self, user_id: &str) -> Result<Option<Contact>, StoreError>;
}

#[async_trait]
pub trait EmailOutbox: Send + Sync {
    async fn enqueue(&self, email: &OutboundEmail) -> Result<(), StoreError>;
}

pub trait RealtimePublisher: Send + Sync {
    /// Delivery is best effort; having no subscribers is not an error.
    fn publish(&self, event: RealtimeEvent);
}

/// In-process realtime hub backed by a `tokio::sync::broadcast` channel.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_REALTIME_CAPACITY)
    }
}

impl RealtimePublisher for BroadcastPublisher {
    fn publish(&self, event: RealtimeEvent) {
        let _ = self.sender.send(event);
    }
}

#[derive(Default)]
pub struct InMemoryContactDirectory {
    contacts: RwLock<HashMap<String, Contact>>,
}

impl InMemoryContactDirectory {
    pub async fn insert(&self, contact: Contact) {
        self.contacts.write().await.insert(contact.user_id.clone(), contact);
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContactDirectory {
    async fn find_contact(&self, user_id: &str) -> Result<Option<Contact>, StoreError> {
        Ok(self.contacts.read().await.get(user_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryEmailOutbox {
    emails: RwLock<Vec<OutboundEmail>>,
}

impl InMemoryEmailOutbox {
    pub async fn emails(&self) -> Vec<OutboundEmail> {
        self.emails.read().await.clone()
    }
}

#[async_trait]
impl EmailOutbox for InMemoryEmailOutbox {
    async fn enqueue(&self, email: &OutboundEmail) -> Result<(), StoreError> {
        self.emails.write().await.push(email.clone());
        Ok(())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("contact lookup failed: {0}")]
    Contact(StoreError),
    #[error("email enqueue failed: {0}")]
    Email(StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub observers_channel: String,
    pub sender_address: String,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            observers_channel: DEFAULT_OBSERVERS_CHANNEL.to_owned(),
            sender_address: "approvals@tollgate.local".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub channels: Vec<String>,
    pub email_queued: bool,
}

/// Join handle for a spawned fan-out; dropping it detaches the task.
#[derive(Debug, Default)]
pub struct NotificationHandle {
    task: Option<JoinHandle<()>>,
}

impl NotificationHandle {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_scheduled(&self) -> bool {
        self.task.is_some()
    }

    /// Waits for the fan-out to finish. Used by tests and short-lived callers.
    pub async fn wait(self) {
        if let Some(task) = self.task {
            let _ = task.await;
        }
    }
}

#[derive(Clone)]
pub struct NotificationFanout {
    contacts: Arc<dyn ContactDirectory>,
    email: Arc<dyn EmailOutbox>,
    realtime: Arc<dyn RealtimePublisher>,
    settings: NotificationSettings,
}

impl NotificationFanout {
    pub fn new(
        contacts: Arc<dyn ContactDirectory>,
        email: Arc<dyn EmailOutbox>,
        realtime: Arc<dyn RealtimePublisher>,
        settings: NotificationSettings,
    ) -> Self {
        Self { contacts, email, realtime, settings }
    }

    /// Tells the requester and observers about a terminal outcome, and emails the
    /// requester when a contact address is on file.
    pub async fn notify(
        &self,
        kind: NotificationKind,
        request: &ApprovalRequest,
    ) -> Result<NotifyReport, NotificationError> {
        let channels =
            vec![user_channel(&request.requested_by), self.settings.observers_channel.clone()];
        self.publish_to(&channels, kind, request);

        let contact = self
            .contacts
            .find_contact(&request.requested_by)
            .await
            .map_err(NotificationError::Contact)?;
        let Some(address) = contact.as_ref().and_then(|contact| contact.email.clone()) else {
            debug!(
                event_name = "approval.notification.no_contact",
                request_id = %request.id,
                user_id = %request.requested_by,
                "requester has no email on file"
            );
            return Ok(NotifyReport { channels, email_queued: false });
        };

        let email = self.compose_email(kind, request, address, contact.as_ref());
        self.email.enqueue(&email).await.map_err(NotificationError::Email)?;
        Ok(NotifyReport { channels, email_queued: true })
    }

    /// Announces a new request to observers and to holders of the level-1 role.
    pub fn announce(&self, request: &ApprovalRequest) -> NotifyReport {
        let mut channels = vec![self.settings.observers_channel.clone()];
        if let Some(level) = request.active_level() {
            channels.push(role_channel(&level.approver_role));
        }
        self.publish_to(&channels, NotificationKind::Requested, request);
        NotifyReport { channels, email_queued: false }
    }

    /// Re-notifies the role that owns the active level.
    pub fn remind(&self, request: &ApprovalRequest) -> NotifyReport {
        let channels: Vec<String> = request
            .active_level()
            .map(|level| vec![role_channel(&level.approver_role)])
            .unwrap_or_default();
        self.publish_to(&channels, NotificationKind::Reminder, request);
        NotifyReport { channels, email_queued: false }
    }

    /// Runs [`Self::notify`] on a background task, logging failures at `warn`.
    pub fn spawn_notify(
        &self,
        kind: NotificationKind,
        request: ApprovalRequest,
    ) -> NotificationHandle {
        let fanout = self.clone();
        let task = tokio::spawn(async move {
            if let Err(error) = fanout.notify(kind, &request).await {
                warn!(
                    event_name = "approval.notification.failed",
                    request_id = %request.id,
                    entity_type = %request.entity_type,
                    entity_id = %request.entity_id,
                    notification = kind.event_type(),
                    error = %error,
                    "notification dropped"
                );
            }
        });
        NotificationHandle { task: Some(task) }
    }

    fn publish_to(&self, channels: &[String], kind: NotificationKind, request: &ApprovalRequest) {
        let payload = serde_json::json!({
            "title": request.title,
            "amount": request.amount.to_string(),
            "status": request.status.as_str(),
            "priority": request.priority.as_str(),
            "current_level": request.current_level,
            "total_levels": request.total_levels,
            "requested_by": request.requested_by,
        });
        let occurred_at = Utc::now();

        for channel in channels {
            self.realtime.publish(RealtimeEvent {
                event_type: kind.event_type().to_owned(),
                channel: channel.clone(),
                request_id: request.id.clone(),
                entity_type: request.entity_type,
                entity_id: request.entity_id.clone(),
                payload: payload.clone(),
                occurred_at,
            });
        }
    }

    fn compose_email(
        &self,
        kind: NotificationKind,
        request: &ApprovalRequest,
        to: String,
        contact: Option<&Contact>,
    ) -> OutboundEmail {
        let greeting = contact.map(|contact| contact.display_name.as_str()).unwrap_or("there");
        OutboundEmail {
            id: format!("EML-{}", Uuid::new_v4()),
            request_id: request.id.clone(),
            kind,
            from: self.settings.sender_address.clone(),
            to,
            subject: format!("{} {}", request.title, kind.verb()),
            body: format!(
                "Hello {greeting},\n\nYour {} request \"{}\" for {} was {}.\nReference: {}\n",
                request.entity_type,
                request.title,
                request.amount,
                kind.verb(),
                request.id
            ),
            created_at: Utc::now(),
        }
    }
}
