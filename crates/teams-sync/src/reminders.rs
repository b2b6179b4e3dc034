//! Reminder scheduling.
//!
//! Every tick refreshes the meeting set, picks the meetings that are due and
//! surfaces them as one batch. The batch is answered as a whole: snooze all
//! or dismiss all.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::ReminderConfig;
use crate::meetings::{Meeting, MeetingReconciler};
use crate::poll_loop::PollLoop;

/// One line of a reminder batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueMeeting {
    pub event_id: String,
    pub subject: String,
    pub minutes_until_start: i64,
}

impl DueMeeting {
    fn from_meeting(meeting: &Meeting, now: DateTime<Utc>) -> Self {
        Self {
            event_id: meeting.id().to_string(),
            subject: meeting.subject().to_string(),
            minutes_until_start: meeting.minutes_until_start(now),
        }
    }
}

impl fmt::Display for DueMeeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mins : {}", self.minutes_until_start, self.subject)
    }
}

/// Every meeting due at one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueBatch {
    pub meetings: Vec<DueMeeting>,
    pub snooze_minutes: i64,
}

impl DueBatch {
    pub fn event_ids(&self) -> Vec<String> {
        self.meetings.iter().map(|m| m.event_id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderResponse {
    SnoozeAll,
    DismissAll,
}

impl ReminderResponse {
    pub fn as_str(&self) -> &str {
        match self {
            ReminderResponse::SnoozeAll => "snooze",
            ReminderResponse::DismissAll => "dismiss",
        }
    }
}

/// Presents a batch and waits for the answer.
///
/// `None` means the batch went unanswered; its meetings stay due.
#[async_trait]
pub trait ReminderNotifier: Send + Sync {
    async fn notify(&self, batch: DueBatch) -> Option<ReminderResponse>;
}

/// A batch handed to the presentation layer, answerable exactly once
#[derive(Debug)]
pub struct DueNotification {
    pub batch: DueBatch,
    responder: oneshot::Sender<ReminderResponse>,
}

impl DueNotification {
    /// Returns false if the scheduler stopped waiting for an answer
    pub fn respond(self, response: ReminderResponse) -> bool {
        self.responder.send(response).is_ok()
    }

    pub fn snooze_all(self) -> bool {
        self.respond(ReminderResponse::SnoozeAll)
    }

    pub fn dismiss_all(self) -> bool {
        self.respond(ReminderResponse::DismissAll)
    }
}

/// Delivers batches over an mpsc channel
pub struct ChannelNotifier {
    sender: mpsc::Sender<DueNotification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DueNotification>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ReminderNotifier for ChannelNotifier {
    async fn notify(&self, batch: DueBatch) -> Option<ReminderResponse> {
        let (responder, answer) = oneshot::channel();

        if self
            .sender
            .send(DueNotification { batch, responder })
            .await
            .is_err()
        {
            tracing::warn!("Reminder receiver closed, batch not delivered");
            return None;
        }

        answer.await.ok()
    }
}

/// What a single tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub due: usize,
    pub response: Option<ReminderResponse>,
}

pub struct ReminderScheduler {
    reconciler: Arc<MeetingReconciler>,
    notifier: Arc<dyn ReminderNotifier>,
    snooze_minutes: i64,
    stale_after: Duration,
}

impl ReminderScheduler {
    pub fn new(
        reconciler: Arc<MeetingReconciler>,
        notifier: Arc<dyn ReminderNotifier>,
        config: &ReminderConfig,
    ) -> Self {
        Self {
            reconciler,
            notifier,
            snooze_minutes: config.snooze_minutes,
            stale_after: Duration::minutes(config.stale_after_start_minutes),
        }
    }

    pub fn reconciler(&self) -> &Arc<MeetingReconciler> {
        &self.reconciler
    }

    /// Refresh, notify about due meetings and apply the answer.
    ///
    /// A failed refresh is logged and the tick continues with the meetings
    /// already known. A snooze runs from `now`, the time the tick started.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let meetings = match self.reconciler.refresh(now).await {
            Ok(meetings) => meetings,
            Err(e) => {
                tracing::warn!("Reminder refresh failed: {}", e);
                self.reconciler.snapshot().await
            }
        };

        let due: Vec<DueMeeting> = meetings
            .due(now, self.stale_after)
            .into_iter()
            .map(|m| DueMeeting::from_meeting(m, now))
            .collect();

        if due.is_empty() {
            return TickOutcome::default();
        }

        let batch = DueBatch {
            meetings: due,
            snooze_minutes: self.snooze_minutes,
        };
        let ids = batch.event_ids();
        tracing::info!("{} meeting reminder(s) due", ids.len());

        let response = self.notifier.notify(batch).await;
        match response {
            Some(ReminderResponse::SnoozeAll) => {
                let until = now + Duration::minutes(self.snooze_minutes);
                let count = self.reconciler.snooze(&ids, until).await;
                tracing::info!("Snoozed {} reminder(s) until {}", count, until);
            }
            Some(ReminderResponse::DismissAll) => {
                let count = self.reconciler.dismiss(&ids).await;
                tracing::info!("Dismissed {} reminder(s)", count);
            }
            None => {
                tracing::debug!("Reminder batch went unanswered");
            }
        }

        TickOutcome {
            due: ids.len(),
            response,
        }
    }

    /// Tick every `period` until the returned loop is stopped or dropped
    pub fn start(self: Arc<Self>, period: std::time::Duration) -> PollLoop {
        PollLoop::start("Reminder check", period, move || {
            let scheduler = Arc::clone(&self);
            async move {
                scheduler.tick(Utc::now()).await;
            }
        })
    }
}
