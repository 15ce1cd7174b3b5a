//! User-facing notifications about connection health.
//!
//! The health-check sweep reports outcomes through a [`NotificationEmitter`].
//! Delivery is best effort: an emitter returns `None` when it could not create
//! the notification and callers carry on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::model::{Platform, UserId};

/// Default number of notifications kept per user by [`MemoryNotifier`].
pub const DEFAULT_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    TokenWarning,
    TokenError,
    TokenRenewed,
    ConnectionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A notification before it has been assigned an ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub platform: Platform,
    pub message: String,
    pub severity: Severity,
    pub action_label: Option<String>,
    pub action_path: Option<String>,
}

impl NewNotification {
    pub fn new(
        kind: NotificationType,
        platform: Platform,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            platform,
            message: message.into(),
            severity,
            action_label: None,
            action_path: None,
        }
    }

    /// Attach a call to action, e.g. "Reconnect" with a deep link.
    pub fn with_action(mut self, label: impl Into<String>, path: impl Into<String>) -> Self {
        self.action_label = Some(label.into());
        self.action_path = Some(path.into());
        self
    }
}

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub platform: Platform,
    pub message: String,
    pub severity: Severity,
    pub action_label: Option<String>,
    pub action_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    fn from_new(user_id: &UserId, new: NewNotification) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.clone(),
            kind: new.kind,
            platform: new.platform,
            message: new.message,
            severity: new.severity,
            action_label: new.action_label,
            action_path: new.action_path,
            created_at: Utc::now(),
        }
    }
}

/// Sink for user notifications.
#[async_trait]
pub trait NotificationEmitter: Send + Sync {
    /// Create a notification for `user_id`.
    ///
    /// Returns `None` if the notification could not be created.
    async fn create(&self, user_id: &UserId, notification: NewNotification)
    -> Option<Notification>;
}

/// Keeps the most recent notifications per user in memory.
#[derive(Debug)]
pub struct MemoryNotifier {
    history: Mutex<HashMap<UserId, VecDeque<Notification>>>,
    capacity: usize,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }

    /// Keep at most `capacity` notifications per user; older ones are dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Notifications for `user_id`, newest first.
    pub fn list(&self, user_id: &UserId) -> Vec<Notification> {
        self.history
            .lock()
            .get(user_id)
            .map(|entries| entries.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Every stored notification, in no particular order.
    pub fn all(&self) -> Vec<Notification> {
        self.history
            .lock()
            .values()
            .flat_map(|entries| entries.iter().cloned())
            .collect()
    }
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationEmitter for MemoryNotifier {
    async fn create(
        &self,
        user_id: &UserId,
        notification: NewNotification,
    ) -> Option<Notification> {
        let notification = Notification::from_new(user_id, notification);
        tracing::info!(
            user = %user_id,
            platform = %notification.platform,
            kind = ?notification.kind,
            "{}",
            notification.message
        );

        let mut history = self.history.lock();
        let entries = history.entry(user_id.clone()).or_default();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(notification.clone());
        Some(notification)
    }
}

/// Emitter that only writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationEmitter for TracingNotifier {
    async fn create(
        &self,
        user_id: &UserId,
        notification: NewNotification,
    ) -> Option<Notification> {
        let notification = Notification::from_new(user_id, notification);
        match notification.severity {
            Severity::Error => tracing::error!(
                user = %user_id,
                platform = %notification.platform,
                "{}",
                notification.message
            ),
            Severity::Warning => tracing::warn!(
                user = %user_id,
                platform = %notification.platform,
                "{}",
                notification.message
            ),
            Severity::Info | Severity::Success => tracing::info!(
                user = %user_id,
                platform = %notification.platform,
                "{}",
                notification.message
            ),
        }
        Some(notification)
    }
}
