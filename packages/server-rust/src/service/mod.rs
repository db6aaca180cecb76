//! Service registry, process lifecycle, and background execution.
//!
//! 1. **Registry** (`registry`): dependency-ordered construction of named services
//! 2. **Shutdown** (`shutdown`): health state and in-flight job tracking
//! 3. **SMS** (`sms`): outbound text message capability
//! 4. **Trips** (`trips`): trip, event, and member lookups for scheduled jobs
//! 5. **Background workers** (`worker`): ticking tasks (scheduler, maintenance)

pub mod registry;
pub mod shutdown;
pub mod sms;
pub mod trips;
pub mod worker;

pub use registry::{ApplicationContext, RegistryError, ServiceDescriptor, ServiceRegistry};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use sms::{MockSmsService, SentMessage, SmsService};
pub use trips::{
    InMemoryTripDirectory, ItineraryEntry, NotificationPrefs, TripDirectory, TripItinerary,
    TripMember, UpcomingEvent,
};
pub use worker::{BackgroundRunnable, BackgroundWorker, WorkerStats};

/// Well-known names in the [`ApplicationContext`].
pub mod service_names {
    /// [`AppConfig`](crate::config::AppConfig), seeded before build.
    pub const CONFIG: &str = "config";
    /// `Arc<dyn ClockSource>`, seeded before build.
    pub const CLOCK: &str = "clock";
    /// `Arc<dyn SmsService>`.
    pub const SMS_SERVICE: &str = "sms-service";
    /// `Arc<dyn TripDirectory>`.
    pub const TRIP_DIRECTORY: &str = "trip-directory";
    /// [`JobQueue`](crate::jobs::JobQueue).
    pub const JOB_QUEUE: &str = "job-queue";
    /// [`DeadLetterLog`](crate::jobs::DeadLetterLog).
    pub const DEAD_LETTER_LOG: &str = "dead-letter-log";
}
