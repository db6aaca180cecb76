//! Queue identifiers.
//!
//! Every class of background work has a fixed name. Handler tables, job
//! definitions, and persisted records all key on [`QueueName`] rather than
//! free-form strings, so a missing arm shows up at compile time instead of as
//! a job stuck in a queue nobody consumes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Known job queues.
///
/// Serializes to the wire name (e.g. `"invitation-send"`), which is also the
/// value stored in the `queue` column of persisted job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// Fan-out of one trip notification to every going member.
    NotificationBatch,
    /// Delivery of a single notification SMS.
    NotificationDeliver,
    /// Dead-letter queue for `NotificationDeliver`.
    NotificationDeliverDlq,
    /// Delivery of a trip invitation SMS.
    InvitationSend,
    /// Dead-letter queue for `InvitationSend`.
    InvitationSendDlq,
    /// Periodic scan for events starting within the hour.
    EventReminders,
    /// Periodic morning itinerary digest.
    DailyItineraries,
}

impl QueueName {
    /// Every queue, in declaration order.
    pub const ALL: [QueueName; 7] = [
        QueueName::NotificationBatch,
        QueueName::NotificationDeliver,
        QueueName::NotificationDeliverDlq,
        QueueName::InvitationSend,
        QueueName::InvitationSendDlq,
        QueueName::EventReminders,
        QueueName::DailyItineraries,
    ];

    /// Returns the wire name of this queue.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::NotificationBatch => "notification-batch",
            QueueName::NotificationDeliver => "notification-deliver",
            QueueName::NotificationDeliverDlq => "notification-deliver-dlq",
            QueueName::InvitationSend => "invitation-send",
            QueueName::InvitationSendDlq => "invitation-send-dlq",
            QueueName::EventReminders => "event-reminders",
            QueueName::DailyItineraries => "daily-itineraries",
        }
    }

    /// Whether this queue is a terminal dead-letter queue.
    #[must_use]
    pub fn is_dead_letter(self) -> bool {
        matches!(
            self,
            QueueName::NotificationDeliverDlq | QueueName::InvitationSendDlq
        )
    }

    /// The dead-letter queue conventionally paired with this queue, if any.
    #[must_use]
    pub fn default_dead_letter(self) -> Option<QueueName> {
        match self {
            QueueName::NotificationDeliver => Some(QueueName::NotificationDeliverDlq),
            QueueName::InvitationSend => Some(QueueName::InvitationSendDlq),
            _ => None,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a string that names no known queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown queue name: {0}")]
pub struct UnknownQueueName(pub String);

impl FromStr for QueueName {
    type Err = UnknownQueueName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| UnknownQueueName(s.to_string()))
    }
}
