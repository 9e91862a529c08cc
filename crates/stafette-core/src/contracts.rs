//! Wire contracts shared by every service on the bus.
//!
//! Each message is a JSON object with a well-known shape per routing key.
//! Two fields are universal: `trace_id` (hex string, may be absent) and
//! the payload-specific identifiers. Adding a routing key requires only a
//! payload shape here, a producer appending through the outbox store, and
//! a subscriber declaring its own queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary topic exchange for business events.
pub const EXCHANGE: &str = "events";

/// Dead-letter topic exchange.
pub const DLQ_EXCHANGE: &str = "events.dlq";

/// Routing key for ingested emails.
pub const EMAIL_RECEIVED: &str = "email.received";

/// Routing key for tasks created from decisions.
pub const TASK_CREATED: &str = "task.created";

/// Routing key for in-app notifications.
pub const NOTIFICATION_CREATED: &str = "notification.created";

/// Routing key for tasks that passed their due date.
pub const TASK_OVERDUE: &str = "task.overdue";

/// Routing key for tasks generated from habit recurrence.
pub const HABIT_TASK_GENERATED: &str = "habit.task.generated";

/// Routing key for newly planned projects.
pub const PROJECT_CREATED: &str = "project.created";

/// Primary queue name for a subscriber of `routing_key`.
pub fn primary_queue(routing_key: &str) -> String {
    format!("{routing_key}.q")
}

/// Dead-letter queue name for `routing_key`.
pub fn dead_letter_queue(routing_key: &str) -> String {
    format!("{routing_key}.dlq")
}

/// Payload for `email.received`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailReceived {
    /// Identifier of the stored raw email.
    pub email_id: i64,

    /// Owner of the mailbox.
    pub user_id: i64,

    /// Subject line.
    pub subject: String,

    /// Plain-text body.
    pub body: String,

    /// When the mail ingestion service accepted the message.
    pub received_at: DateTime<Utc>,

    /// Trace identifier propagated from the producing request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Payload for `task.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreated {
    /// Email the task was derived from.
    pub email_id: i64,

    /// Owner of the task.
    pub user_id: i64,

    /// Task title.
    pub title: String,

    /// Days until the task is due.
    pub due_in_days: i32,

    /// Trace identifier propagated from the producing request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationChannel {
    /// Outbound email.
    Email,
    /// Mobile push.
    Push,
    /// SMS gateway.
    Sms,
    /// Customer-registered webhook.
    Webhook,
}

/// Payload for `notification.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationCreated {
    /// Recipient.
    pub user_id: i64,

    /// Email that triggered the notification, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<i64>,

    /// Task that triggered the notification, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,

    /// Channel the notification should be delivered on.
    pub channel: NotificationChannel,

    /// Rendered notification text.
    pub message: String,

    /// When the notification was created.
    pub created_at: DateTime<Utc>,

    /// Trace identifier propagated from the producing request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Payload for `task.overdue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOverdue {
    /// The overdue task.
    pub task_id: i64,

    /// Trace identifier propagated from the orchestrator tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Payload for `habit.task.generated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HabitTaskGenerated {
    /// Habit the task was generated from.
    pub habit_id: i64,

    /// Owner of the habit.
    pub user_id: i64,

    /// Generated task title.
    pub title: String,

    /// Due date in `YYYY-MM-DD` form.
    pub due_date: String,

    /// Trace identifier propagated from the orchestrator tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Task priority within a project plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    /// Nice to have.
    Low,
    /// Default.
    Medium,
    /// Blocking.
    High,
}

/// One task inside a project milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectTask {
    /// Task title.
    pub title: String,

    /// Days until due, relative to project start.
    pub due_in_days: i32,

    /// Planning priority.
    pub priority: TaskPriority,

    /// Titles of tasks this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// One milestone inside a project plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    /// Milestone title.
    pub title: String,

    /// Position within the project, 1-based.
    pub order: i32,

    /// Days until due, relative to project start.
    pub due_in_days: i32,

    /// Tasks that complete this milestone.
    pub tasks: Vec<ProjectTask>,
}

/// Payload for `project.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectCreated {
    /// Owner of the project.
    pub user_id: i64,

    /// Project title.
    pub title: String,

    /// Free-form description.
    pub description: String,

    /// Days until planned completion.
    pub target_days: i32,

    /// Ordered milestones with their tasks.
    pub milestones: Vec<Milestone>,

    /// Trace identifier propagated from the producing request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}
