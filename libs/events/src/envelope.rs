//! Notification envelope - the common wrapper for all notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EventError;

/// Notification priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Info => write!(f, "info"),
            Priority::Warn => write!(f, "warn"),
            Priority::Error => write!(f, "error"),
        }
    }
}

/// The notification envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification<P> {
    /// Unique identifier of this message.
    pub message_id: Uuid,

    /// When the notification was produced.
    pub timestamp: DateTime<Utc>,

    /// Emitting service and host, e.g. `compute_task.conductor-1`.
    pub publisher_id: String,

    /// Delivery priority.
    pub priority: Priority,

    /// Dotted event type, e.g. `compute_task.migrate_server`.
    pub event_type: String,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> Notification<P> {
    /// Creates a new notification builder.
    pub fn builder() -> NotificationBuilder<P> {
        NotificationBuilder::new()
    }
}

impl<P: Serialize> Notification<P> {
    /// Converts the payload into an untyped JSON value.
    pub fn into_json(self) -> Result<Notification<serde_json::Value>, EventError> {
        Ok(Notification {
            message_id: self.message_id,
            timestamp: self.timestamp,
            publisher_id: self.publisher_id,
            priority: self.priority,
            event_type: self.event_type,
            payload: serde_json::to_value(self.payload)?,
        })
    }
}

/// Builder for constructing notifications.
#[derive(Debug)]
pub struct NotificationBuilder<P> {
    timestamp: Option<DateTime<Utc>>,
    publisher_id: Option<String>,
    priority: Priority,
    event_type: Option<String>,
    payload: Option<P>,
}

impl<P> NotificationBuilder<P> {
    pub fn new() -> Self {
        Self {
            timestamp: None,
            publisher_id: None,
            priority: Priority::Info,
            event_type: None,
            payload: None,
        }
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn publisher(mut self, service: &str, host: &str) -> Self {
        self.publisher_id = Some(format!("{service}.{host}"));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the notification.
    ///
    /// The event type must contain at least one `.` separating the service
    /// from the method.
    pub fn build(self) -> Result<Notification<P>, EventError> {
        let event_type = self
            .event_type
            .ok_or(EventError::MissingField("event_type"))?;
        match event_type.split_once('.') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => {}
            _ => return Err(EventError::InvalidEventType(event_type)),
        }

        Ok(Notification {
            message_id: Uuid::new_v4(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            publisher_id: self
                .publisher_id
                .ok_or(EventError::MissingField("publisher_id"))?,
            priority: self.priority,
            event_type,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for NotificationBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
