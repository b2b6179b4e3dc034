//! Meeting reconciliation.
//!
//! The calendar backend exposes events and reminders as two separate feeds.
//! `MeetingReconciler` drains both and folds them into a `MeetingSet` keyed
//! by event id. Notification state (dismissed / snoozed) is owned locally and
//! survives every refresh.

use chrono::{DateTime, Duration, Utc};
use shared_types::{MeetingEvent, ReminderEntry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::ReminderConfig;
use crate::error::SyncResult;
use crate::feed::{drain, CalendarSource, CalendarWindow, EventFeed, ReminderFeed};

/// Where a meeting stands with respect to notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
    Active,
    Snoozed { until: DateTime<Utc> },
    Dismissed,
}

/// A calendar event together with its reminder and local notification state.
#[derive(Debug, Clone, PartialEq)]
pub struct Meeting {
    pub event: MeetingEvent,
    pub reminder: Option<ReminderEntry>,
    pub dismissed: bool,
    pub snoozed_until: Option<DateTime<Utc>>,
}

impl Meeting {
    pub fn new(event: MeetingEvent, reminder: Option<ReminderEntry>) -> Self {
        Self {
            event,
            reminder,
            dismissed: false,
            snoozed_until: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn subject(&self) -> &str {
        &self.event.subject
    }

    pub fn organizer(&self) -> &str {
        &self.event.organizer
    }

    pub fn attendees(&self) -> &[String] {
        &self.event.attendees
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.event.start.to_utc()
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.event.end.to_utc()
    }

    pub fn fire_instant(&self) -> Option<DateTime<Utc>> {
        self.reminder.as_ref().map(ReminderEntry::fire_instant)
    }

    pub fn state(&self, now: DateTime<Utc>) -> NotificationState {
        if self.dismissed {
            return NotificationState::Dismissed;
        }
        match self.snoozed_until {
            Some(until) if until > now => NotificationState::Snoozed { until },
            _ => NotificationState::Active,
        }
    }

    pub fn snooze(&mut self, until: DateTime<Utc>) {
        self.snoozed_until = Some(until);
    }

    pub fn dismiss(&mut self) {
        self.dismissed = true;
    }

    /// The reminder has fired, the meeting is neither dismissed nor snoozed,
    /// and it did not start more than `stale_after` ago.
    pub fn is_due(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let Some(reminder) = &self.reminder else {
            return false;
        };

        self.state(now) == NotificationState::Active
            && reminder.fire_instant() <= now
            && self.start() + stale_after >= now
    }

    /// Whole minutes from `now` until the start, negative once started
    pub fn minutes_until_start(&self, now: DateTime<Utc>) -> i64 {
        let seconds = (self.start() - now).num_seconds();
        (seconds as f64 / 60.0).round() as i64
    }

    fn replace_feeds(&mut self, event: MeetingEvent, reminder: ReminderEntry) {
        self.event = event;
        self.reminder = Some(reminder);
    }
}

/// Meetings keyed by event id. At most one meeting per event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeetingSet {
    meetings: HashMap<String, Meeting>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeOutcome {
    Inserted,
    Updated,
}

impl MeetingSet {
    pub fn get(&self, event_id: &str) -> Option<&Meeting> {
        self.meetings.get(event_id)
    }

    pub fn len(&self) -> usize {
        self.meetings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meetings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Meeting> {
        self.meetings.values()
    }

    /// All meetings ordered by start time
    pub fn by_start(&self) -> Vec<&Meeting> {
        let mut meetings: Vec<&Meeting> = self.meetings.values().collect();
        meetings.sort_by(|a, b| a.start().cmp(&b.start()).then_with(|| a.id().cmp(b.id())));
        meetings
    }

    /// Meetings due for a notification at `now`, ordered by start time
    pub fn due(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<&Meeting> {
        self.by_start()
            .into_iter()
            .filter(|m| m.is_due(now, stale_after))
            .collect()
    }

    fn get_mut(&mut self, event_id: &str) -> Option<&mut Meeting> {
        self.meetings.get_mut(event_id)
    }

    /// Replace event and reminder in place, keeping notification state
    fn merge(&mut self, event: MeetingEvent, reminder: ReminderEntry) -> MergeOutcome {
        match self.meetings.get_mut(&event.id) {
            Some(meeting) => {
                meeting.replace_feeds(event, reminder);
                MergeOutcome::Updated
            }
            None => {
                self.meetings
                    .insert(event.id.clone(), Meeting::new(event, Some(reminder)));
                MergeOutcome::Inserted
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub updated: usize,
    pub unresolved: usize,
}

/// Merges the event and reminder feeds into the meeting set.
pub struct MeetingReconciler {
    source: Arc<dyn CalendarSource>,
    lookahead_days: i64,
    stale_after: Duration,
    max_pages: usize,
    meetings: Mutex<MeetingSet>,
}

impl MeetingReconciler {
    pub fn new(source: Arc<dyn CalendarSource>, config: &ReminderConfig) -> Self {
        Self {
            source,
            lookahead_days: config.lookahead_days,
            stale_after: Duration::minutes(config.stale_after_start_minutes),
            max_pages: config.max_pages,
            meetings: Mutex::new(MeetingSet::default()),
        }
    }

    pub async fn snapshot(&self) -> MeetingSet {
        self.meetings.lock().await.clone()
    }

    /// Drain both feeds and merge them by event id.
    ///
    /// Reminders are read for `now .. now + lookahead`. Events are read for
    /// the same range reaching back far enough to cover meetings that are
    /// still due after they started. Reminders whose event is not in that
    /// listing are looked up one by one.
    ///
    /// Both feeds are fetched completely before anything is merged; if either
    /// fails the set is left untouched. Meetings missing from this fetch are
    /// kept.
    pub async fn refresh(&self, now: DateTime<Utc>) -> SyncResult<MeetingSet> {
        let window = CalendarWindow::starting_at(now, self.lookahead_days);
        let event_feed = EventFeed {
            source: self.source.as_ref(),
            window: window.reaching_back(self.stale_after),
        };
        let reminder_feed = ReminderFeed {
            source: self.source.as_ref(),
            window,
        };

        let (events, reminders) = tokio::try_join!(
            drain(&event_feed, self.max_pages),
            drain(&reminder_feed, self.max_pages),
        )?;

        tracing::debug!(
            "Fetched {} events and {} reminders",
            events.len(),
            reminders.len()
        );

        let mut events: HashMap<String, MeetingEvent> =
            events.into_iter().map(|e| (e.id.clone(), e)).collect();
        self.resolve_missing_events(&reminders, &mut events).await;

        let mut meetings = self.meetings.lock().await;
        let mut stats = ReconcileStats::default();

        for reminder in reminders {
            let Some(event) = events.get(&reminder.event_id) else {
                tracing::debug!(
                    "Reminder {} refers to unknown event {}",
                    reminder.id,
                    reminder.event_id
                );
                stats.unresolved += 1;
                continue;
            };

            match meetings.merge(event.clone(), reminder) {
                MergeOutcome::Inserted => stats.inserted += 1,
                MergeOutcome::Updated => stats.updated += 1,
            }
        }

        if stats.inserted > 0 || stats.unresolved > 0 {
            tracing::info!(
                "Reconciled meetings: {} new, {} updated, {} unresolved ({} total)",
                stats.inserted,
                stats.updated,
                stats.unresolved,
                meetings.len()
            );
        }

        Ok(meetings.clone())
    }

    /// Look up events referenced by reminders but absent from the listing.
    /// A failed lookup leaves the reminder unresolved for this pass.
    async fn resolve_missing_events(
        &self,
        reminders: &[ReminderEntry],
        events: &mut HashMap<String, MeetingEvent>,
    ) {
        let mut missing: Vec<&str> = reminders
            .iter()
            .map(|r| r.event_id.as_str())
            .filter(|id| !events.contains_key(*id))
            .collect();
        missing.sort_unstable();
        missing.dedup();

        for event_id in missing {
            match self.source.fetch_event(event_id).await {
                Ok(Some(event)) => {
                    events.insert(event_id.to_string(), event);
                }
                Ok(None) => tracing::debug!("Event {} no longer exists", event_id),
                Err(e) => tracing::warn!("Failed to look up event {}: {}", event_id, e),
            }
        }
    }

    /// Snooze the given meetings until `until`. Returns how many were found.
    pub async fn snooze(&self, event_ids: &[String], until: DateTime<Utc>) -> usize {
        let mut meetings = self.meetings.lock().await;
        let mut count = 0;
        for id in event_ids {
            if let Some(meeting) = meetings.get_mut(id) {
                meeting.snooze(until);
                count += 1;
            }
        }
        count
    }

    /// Dismiss the given meetings. Returns how many were found.
    pub async fn dismiss(&self, event_ids: &[String]) -> usize {
        let mut meetings = self.meetings.lock().await;
        let mut count = 0;
        for id in event_ids {
            if let Some(meeting) = meetings.get_mut(id) {
                meeting.dismiss();
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::testing::{event, reminder, FakeCalendar};

    const STALE: i64 = 15;

    fn stale() -> Duration {
        Duration::minutes(STALE)
    }

    fn reconciler(fake: &Arc<FakeCalendar>) -> MeetingReconciler {
        MeetingReconciler::new(fake.clone(), &ReminderConfig::default())
    }

    #[test]
    fn test_due_meeting_state_machine() {
        let now = Utc::now();
        let mut meeting = Meeting::new(
            event("e1", "Standup", now + Duration::minutes(5)),
            Some(reminder("e1", now - Duration::minutes(10))),
        );
        assert_eq!(meeting.state(now), NotificationState::Active);
        assert!(meeting.is_due(now, stale()));

        let until = now + Duration::minutes(5);
        meeting.snooze(until);
        assert_eq!(meeting.state(now), NotificationState::Snoozed { until });
        assert!(!meeting.is_due(now, stale()));
        assert!(!meeting.is_due(now + Duration::minutes(4), stale()));
        assert!(meeting.is_due(until, stale()));

        meeting.dismiss();
        assert_eq!(meeting.state(until), NotificationState::Dismissed);
        assert!(!meeting.is_due(until, stale()));
    }

    #[test]
    fn test_not_due_before_fire_time() {
        let now = Utc::now();
        let meeting = Meeting::new(
            event("e1", "Planning", now + Duration::hours(1)),
            Some(reminder("e1", now + Duration::minutes(45))),
        );
        assert!(!meeting.is_due(now, stale()));
        assert!(meeting.is_due(now + Duration::minutes(45), stale()));
    }

    #[test]
    fn test_stale_meeting_is_not_due() {
        let now = Utc::now();
        let meeting = Meeting::new(
            event("e1", "Retro", now - Duration::minutes(16)),
            Some(reminder("e1", now - Duration::minutes(31))),
        );
        assert!(!meeting.is_due(now, stale()));

        let meeting = Meeting::new(
            event("e2", "Retro", now - Duration::minutes(14)),
            Some(reminder("e2", now - Duration::minutes(29))),
        );
        assert!(meeting.is_due(now, stale()));
    }

    #[test]
    fn test_meeting_without_reminder_is_never_due() {
        let now = Utc::now();
        let meeting = Meeting::new(event("e1", "Lunch", now), None);
        assert!(!meeting.is_due(now, stale()));
    }

    #[test]
    fn test_minutes_until_start() {
        let now = Utc::now();
        let meeting = Meeting::new(event("e1", "1:1", now + Duration::seconds(299)), None);
        assert_eq!(meeting.minutes_until_start(now), 5);

        let meeting = Meeting::new(event("e2", "1:1", now - Duration::minutes(3)), None);
        assert_eq!(meeting.minutes_until_start(now), -3);
    }

    #[tokio::test]
    async fn test_refresh_merges_across_pages() {
        let fake = Arc::new(FakeCalendar::new(2));
        let now = Utc::now();
        fake.set_events(vec![
            event("e1", "Standup", now + Duration::hours(1)),
            event("e2", "Planning", now + Duration::hours(2)),
            event("e3", "Lunch", now + Duration::hours(3)),
        ]);
        fake.set_reminders(vec![
            reminder("e3", now + Duration::minutes(165)),
            reminder("e1", now + Duration::minutes(45)),
            reminder("e2", now + Duration::minutes(105)),
        ]);

        let set = reconciler(&fake).refresh(now).await.unwrap();
        assert_eq!(set.len(), 3);
        let order: Vec<&str> = set.by_start().iter().map(|m| m.id()).collect();
        assert_eq!(order, vec!["e1", "e2", "e3"]);
        assert!(set.iter().all(|m| !m.dismissed && m.snoozed_until.is_none()));

        let windows = fake.requested_windows();
        assert!(windows.iter().all(|w| w.start == now));
        assert_eq!(windows[0].end - windows[0].start, Duration::days(60));

        let event_windows = fake.event_windows();
        assert!(event_windows.iter().all(|w| w.start == now - stale()));
        assert!(event_windows.iter().all(|w| w.end == now + Duration::days(60)));
        assert!(fake.lookups().is_empty());
    }

    #[tokio::test]
    async fn test_event_history_beyond_page_limit_is_not_listed() {
        let fake = Arc::new(FakeCalendar::new(1));
        let now = Utc::now();
        let mut events: Vec<MeetingEvent> = (0..150)
            .map(|i| {
                let start = now - Duration::days(30) - Duration::hours(i);
                event(&format!("old-{}", i), "Retro", start)
            })
            .collect();
        events.push(event("soon", "Standup", now + Duration::minutes(5)));
        fake.set_events(events);
        fake.set_reminders(vec![reminder("soon", now - Duration::minutes(10))]);

        let reconciler = reconciler(&fake);
        assert_eq!(reconciler.max_pages, 100);
        let set = reconciler.refresh(now).await.unwrap();

        assert_eq!(set.len(), 1);
        let due: Vec<&str> = set.due(now, stale()).iter().map(|m| m.id()).collect();
        assert_eq!(due, vec!["soon"]);
        assert!(fake.lookups().is_empty());
    }

    #[tokio::test]
    async fn test_reminder_for_unlisted_occurrence_is_looked_up() {
        let fake = Arc::new(FakeCalendar::new(10));
        let now = Utc::now();
        fake.set_events(vec![event("series", "Weekly sync", now - Duration::days(90))]);
        fake.set_hidden_events(vec![event(
            "series-occ-12",
            "Weekly sync",
            now + Duration::minutes(10),
        )]);
        fake.set_reminders(vec![
            reminder("series-occ-12", now - Duration::minutes(5)),
            reminder("series-occ-12", now - Duration::minutes(5)),
        ]);

        let set = reconciler(&fake).refresh(now).await.unwrap();

        assert_eq!(fake.lookups(), vec!["series-occ-12".to_string()]);
        assert!(set.get("series").is_none());
        let meeting = set.get("series-occ-12").unwrap();
        assert_eq!(meeting.subject(), "Weekly sync");
        assert!(meeting.is_due(now, stale()));
    }

    #[tokio::test]
    async fn test_failed_lookup_leaves_reminder_unresolved() {
        let fake = Arc::new(FakeCalendar::new(10));
        let now = Utc::now();
        fake.set_events(vec![event("e1", "Standup", now + Duration::hours(1))]);
        fake.set_hidden_events(vec![event("occ", "Weekly sync", now + Duration::hours(2))]);
        fake.set_reminders(vec![
            reminder("e1", now + Duration::minutes(45)),
            reminder("occ", now + Duration::minutes(105)),
        ]);
        fake.fail_lookups(true);

        let reconciler = reconciler(&fake);
        let set = reconciler.refresh(now).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get("occ").is_none());

        fake.fail_lookups(false);
        let set = reconciler.refresh(now).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get("occ").is_some());
    }

    #[tokio::test]
    async fn test_events_without_reminders_are_not_meetings() {
        let fake = Arc::new(FakeCalendar::new(10));
        let now = Utc::now();
        fake.set_events(vec![
            event("e1", "Standup", now + Duration::hours(1)),
            event("e2", "Focus time", now + Duration::hours(2)),
        ]);
        fake.set_reminders(vec![
            reminder("e1", now + Duration::minutes(45)),
            reminder("ghost", now),
        ]);

        let set = reconciler(&fake).refresh(now).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get("e1").is_some());
        assert!(set.get("e2").is_none());
        assert!(set.get("ghost").is_none());
    }

    #[tokio::test]
    async fn test_refresh_preserves_notification_state() {
        let fake = Arc::new(FakeCalendar::new(10));
        let now = Utc::now();
        fake.set_events(vec![
            event("e1", "Standup", now + Duration::minutes(5)),
            event("e2", "Review", now + Duration::minutes(5)),
        ]);
        fake.set_reminders(vec![
            reminder("e1", now - Duration::minutes(10)),
            reminder("e2", now - Duration::minutes(10)),
        ]);
        let reconciler = reconciler(&fake);
        reconciler.refresh(now).await.unwrap();

        let snoozed_until = now + Duration::minutes(5);
        assert_eq!(reconciler.snooze(&["e1".to_string()], snoozed_until).await, 1);
        assert_eq!(reconciler.dismiss(&["e2".to_string()]).await, 1);

        // Subject changes upstream; local state must survive
        fake.set_events(vec![
            event("e1", "Standup (moved)", now + Duration::minutes(5)),
            event("e2", "Review", now + Duration::minutes(5)),
        ]);
        let set = reconciler.refresh(now).await.unwrap();

        let e1 = set.get("e1").unwrap();
        assert_eq!(e1.event.subject, "Standup (moved)");
        assert_eq!(e1.snoozed_until, Some(snoozed_until));
        assert!(set.get("e2").unwrap().dismissed);
    }

    #[tokio::test]
    async fn test_meetings_absent_from_later_fetch_are_retained() {
        let fake = Arc::new(FakeCalendar::new(10));
        let now = Utc::now();
        fake.set_events(vec![event("e1", "Standup", now + Duration::hours(1))]);
        fake.set_reminders(vec![reminder("e1", now + Duration::minutes(45))]);
        let reconciler = reconciler(&fake);
        reconciler.refresh(now).await.unwrap();

        fake.set_events(vec![]);
        fake.set_reminders(vec![]);
        let set = reconciler.refresh(now).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get("e1").is_some());
    }

    #[tokio::test]
    async fn test_failed_feed_leaves_set_untouched() {
        let fake = Arc::new(FakeCalendar::new(1));
        let now = Utc::now();
        fake.set_events(vec![
            event("e1", "Standup", now + Duration::hours(1)),
            event("e2", "Planning", now + Duration::hours(2)),
        ]);
        fake.set_reminders(vec![reminder("e1", now + Duration::minutes(45))]);
        let reconciler = reconciler(&fake);
        let before = reconciler.refresh(now).await.unwrap();

        fake.set_reminders(vec![
            reminder("e1", now + Duration::minutes(40)),
            reminder("e2", now + Duration::minutes(105)),
        ]);
        fake.fail_events(true);
        let err = reconciler.refresh(now).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteFetch(_)));
        assert_eq!(reconciler.snapshot().await, before);

        fake.fail_events(false);
        fake.fail_reminders(true);
        assert!(reconciler.refresh(now).await.is_err());
        assert_eq!(reconciler.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_due_set_query() {
        let fake = Arc::new(FakeCalendar::new(10));
        let now = Utc::now();
        fake.set_events(vec![
            event("soon", "Standup", now + Duration::minutes(5)),
            event("later", "Planning", now + Duration::hours(3)),
            event("stale", "Yesterday", now - Duration::hours(20)),
        ]);
        fake.set_reminders(vec![
            reminder("soon", now - Duration::minutes(10)),
            reminder("later", now + Duration::minutes(165)),
            reminder("stale", now - Duration::hours(21)),
        ]);

        let set = reconciler(&fake).refresh(now).await.unwrap();
        let due: Vec<&str> = set.due(now, stale()).iter().map(|m| m.id()).collect();
        assert_eq!(due, vec!["soon"]);
    }
}
