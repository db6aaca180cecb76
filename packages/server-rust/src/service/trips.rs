//! Read access to trips, events, and members for the scheduled handlers.
//!
//! The relational store behind trips is owned by the web tier; the worker only
//! needs the few queries below, so they sit behind [`TripDirectory`].

use std::ops::Range;

use async_trait::async_trait;
use parking_lot::RwLock;

/// An event that starts soon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpcomingEvent {
    pub id: String,
    pub trip_id: String,
    pub trip_name: String,
    pub name: String,
    pub location: Option<String>,
    /// Start time in milliseconds since the Unix epoch.
    pub starts_at: u64,
}

/// One line of a trip's schedule, already rendered in the trip's timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItineraryEntry {
    /// e.g. `"9:30 AM"`.
    pub local_time: String,
    pub name: String,
}

/// Today's schedule for a trip whose local morning window is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripItinerary {
    pub trip_id: String,
    pub trip_name: String,
    /// `yyyy-mm-dd` in the trip's timezone.
    pub local_date: String,
    pub entries: Vec<ItineraryEntry>,
}

/// Per-trip SMS preferences of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationPrefs {
    pub event_reminders: bool,
    pub daily_itinerary: bool,
    pub trip_messages: bool,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            event_reminders: true,
            daily_itinerary: true,
            trip_messages: true,
        }
    }
}

impl NotificationPrefs {
    /// Whether a notification of `kind` may be sent as SMS.
    ///
    /// Trip updates and unknown kinds always send.
    #[must_use]
    pub fn allows(&self, kind: &str) -> bool {
        match kind {
            "event_reminder" => self.event_reminders,
            "daily_itinerary" => self.daily_itinerary,
            "trip_message" => self.trip_messages,
            _ => true,
        }
    }
}

/// A member who is going on a trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripMember {
    pub user_id: String,
    pub phone_number: String,
    pub prefs: NotificationPrefs,
}

#[async_trait]
pub trait TripDirectory: Send + Sync {
    /// Events starting within `[from, to]`.
    async fn events_starting_between(&self, from: u64, to: u64) -> anyhow::Result<Vec<UpcomingEvent>>;

    /// Itineraries of active trips whose local morning window contains `now`.
    async fn morning_itineraries(&self, now: u64) -> anyhow::Result<Vec<TripItinerary>>;

    /// Members with status `going`.
    async fn going_members(&self, trip_id: &str) -> anyhow::Result<Vec<TripMember>>;
}

/// Process-local directory. The worker binary starts with an empty one.
#[derive(Debug, Default)]
pub struct InMemoryTripDirectory {
    events: RwLock<Vec<UpcomingEvent>>,
    itineraries: RwLock<Vec<(Range<u64>, TripItinerary)>>,
    members: RwLock<Vec<(String, TripMember)>>,
}

impl InMemoryTripDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&self, event: UpcomingEvent) {
        self.events.write().push(event);
    }

    /// Adds an itinerary reported while `now` is within `window`.
    pub fn add_itinerary(&self, window: Range<u64>, itinerary: TripItinerary) {
        self.itineraries.write().push((window, itinerary));
    }

    pub fn add_member(&self, trip_id: impl Into<String>, member: TripMember) {
        self.members.write().push((trip_id.into(), member));
    }
}

#[async_trait]
impl TripDirectory for InMemoryTripDirectory {
    async fn events_starting_between(&self, from: u64, to: u64) -> anyhow::Result<Vec<UpcomingEvent>> {
        let mut events: Vec<UpcomingEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| (from..=to).contains(&e.starts_at))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.starts_at);
        Ok(events)
    }

    async fn morning_itineraries(&self, now: u64) -> anyhow::Result<Vec<TripItinerary>> {
        Ok(self
            .itineraries
            .read()
            .iter()
            .filter(|(window, _)| window.contains(&now))
            .map(|(_, itinerary)| itinerary.clone())
            .collect())
    }

    async fn going_members(&self, trip_id: &str) -> anyhow::Result<Vec<TripMember>> {
        Ok(self
            .members
            .read()
            .iter()
            .filter(|(trip, _)| trip == trip_id)
            .map(|(_, member)| member.clone())
            .collect())
    }
}
