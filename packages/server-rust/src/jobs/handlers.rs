//! Handlers for the SMS queues and the scheduled fan-out queues.
//!
//! `event-reminders` and `daily-itineraries` turn directory lookups into
//! `notification-batch` jobs; `notification-batch` fans each one out into a
//! `notification-deliver` SMS per going member.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use tripful_core::clock::duration_millis;
use tripful_core::{JobView, NotificationBatchPayload, NotificationDeliverPayload};

use super::dispatcher::{HandlerServices, JobHandler};
use super::queue::{EnqueueOptions, JobQueue};
use crate::service::service_names;
use crate::service::sms::SmsService;
use crate::service::trips::{TripDirectory, TripItinerary, UpcomingEvent};

/// Wire shape shared by `notification-deliver` and `invitation-send`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SmsJob {
    phone_number: String,
    message: String,
}

/// Forwards a queued message to the `sms-service` transport.
///
/// Transport errors are returned unchanged so the queue's retry policy applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmsDeliveryHandler;

const SMS_DEPENDENCIES: &[&str] = &[service_names::SMS_SERVICE];

#[async_trait]
impl JobHandler for SmsDeliveryHandler {
    fn dependencies(&self) -> &[&'static str] {
        SMS_DEPENDENCIES
    }

    async fn handle(&self, job: &JobView, services: &HandlerServices) -> anyhow::Result<()> {
        let sms: SmsJob = job
            .payload_as()
            .with_context(|| format!("malformed {} payload", job.queue))?;
        let transport = services
            .instance::<Arc<dyn SmsService>>(service_names::SMS_SERVICE)
            .context("sms-service is not available")?;

        transport
            .send_message(&sms.phone_number, &sms.message)
            .await
            .with_context(|| format!("sending sms for job {}", job.id))?;
        debug!(attempt = job.attempt, "sms handed to transport");
        Ok(())
    }
}

const FAN_OUT_DEPENDENCIES: &[&str] = &[service_names::TRIP_DIRECTORY, service_names::JOB_QUEUE];

/// Events starting this far ahead, give or take [`REMINDER_SLACK`], get a reminder.
pub const REMINDER_LEAD: Duration = Duration::from_secs(60 * 60);
pub const REMINDER_SLACK: Duration = Duration::from_secs(5 * 60);

fn fan_out_services(services: &HandlerServices) -> anyhow::Result<(Arc<dyn TripDirectory>, JobQueue)> {
    let directory = services
        .instance::<Arc<dyn TripDirectory>>(service_names::TRIP_DIRECTORY)
        .context("trip-directory is not available")?;
    let queue = services
        .instance::<JobQueue>(service_names::JOB_QUEUE)
        .context("job-queue is not available")?;
    Ok((directory, queue))
}

fn reminder_batch(event: &UpcomingEvent) -> NotificationBatchPayload {
    let body = match &event.location {
        Some(location) => format!("{} starts in 1 hour at {location}", event.name),
        None => format!("{} starts in 1 hour", event.name),
    };
    let data = json!({"eventId": event.id, "referenceId": event.id});
    NotificationBatchPayload {
        trip_id: event.trip_id.clone(),
        kind: "event_reminder".into(),
        title: event.trip_name.clone(),
        body,
        data: data.as_object().cloned(),
        exclude_user_id: None,
    }
}

fn itinerary_batch(itinerary: &TripItinerary) -> NotificationBatchPayload {
    let body = if itinerary.entries.is_empty() {
        "No events scheduled for today.".to_string()
    } else {
        itinerary
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("{}. {} - {}", i + 1, entry.local_time, entry.name))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let reference = format!("{}:{}", itinerary.trip_id, itinerary.local_date);
    let data = json!({"tripId": itinerary.trip_id, "referenceId": reference});
    NotificationBatchPayload {
        trip_id: itinerary.trip_id.clone(),
        kind: "daily_itinerary".into(),
        title: format!("{} - Today's Schedule", itinerary.trip_name),
        body,
        data: data.as_object().cloned(),
        exclude_user_id: None,
    }
}

/// Enqueues a reminder batch for every event starting in about an hour.
///
/// The singleton key `event-reminder:<event>` keeps overlapping scans from
/// reminding twice while the first batch is live.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventReminderHandler;

#[async_trait]
impl JobHandler for EventReminderHandler {
    fn dependencies(&self) -> &[&'static str] {
        FAN_OUT_DEPENDENCIES
    }

    async fn handle(&self, _job: &JobView, services: &HandlerServices) -> anyhow::Result<()> {
        let (directory, queue) = fan_out_services(services)?;
        let now = queue.now();
        let from = now + duration_millis(REMINDER_LEAD - REMINDER_SLACK);
        let to = now + duration_millis(REMINDER_LEAD + REMINDER_SLACK);

        let events = directory.events_starting_between(from, to).await?;
        for event in &events {
            queue
                .enqueue_typed(
                    &reminder_batch(event),
                    EnqueueOptions::singleton(format!("event-reminder:{}", event.id)),
                )
                .await?;
        }
        if !events.is_empty() {
            info!(count = events.len(), "event reminder batches enqueued");
        }
        Ok(())
    }
}

/// Enqueues today's schedule for every trip whose local morning window is open.
#[derive(Debug, Default, Clone, Copy)]
pub struct DailyItineraryHandler;

#[async_trait]
impl JobHandler for DailyItineraryHandler {
    fn dependencies(&self) -> &[&'static str] {
        FAN_OUT_DEPENDENCIES
    }

    async fn handle(&self, _job: &JobView, services: &HandlerServices) -> anyhow::Result<()> {
        let (directory, queue) = fan_out_services(services)?;
        let itineraries = directory.morning_itineraries(queue.now()).await?;
        for itinerary in &itineraries {
            let key = format!("daily-itinerary:{}:{}", itinerary.trip_id, itinerary.local_date);
            queue
                .enqueue_typed(&itinerary_batch(itinerary), EnqueueOptions::singleton(key))
                .await?;
        }
        if !itineraries.is_empty() {
            info!(count = itineraries.len(), "daily itinerary batches enqueued");
        }
        Ok(())
    }
}

/// Sends one `notification-deliver` SMS per going member who allows the kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationBatchHandler;

#[async_trait]
impl JobHandler for NotificationBatchHandler {
    fn dependencies(&self) -> &[&'static str] {
        FAN_OUT_DEPENDENCIES
    }

    async fn handle(&self, job: &JobView, services: &HandlerServices) -> anyhow::Result<()> {
        let batch: NotificationBatchPayload = job
            .payload_as()
            .with_context(|| format!("malformed {} payload", job.queue))?;
        let (directory, queue) = fan_out_services(services)?;

        let message = format!("{}: {}", batch.title, batch.body);
        let mut sent = 0;
        for member in directory.going_members(&batch.trip_id).await? {
            if batch.exclude_user_id.as_deref() == Some(member.user_id.as_str())
                || !member.prefs.allows(&batch.kind)
            {
                continue;
            }
            let sms = NotificationDeliverPayload {
                phone_number: member.phone_number,
                message: message.clone(),
            };
            queue.enqueue_typed(&sms, EnqueueOptions::default()).await?;
            sent += 1;
        }
        debug!(trip_id = %batch.trip_id, kind = %batch.kind, sent, "notification batch fanned out");
        Ok(())
    }
}
