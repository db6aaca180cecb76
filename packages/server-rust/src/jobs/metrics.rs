//! Job counters and timings, recorded through the `metrics` facade.
//!
//! Nothing is exported unless a recorder is installed (see
//! [`telemetry::init_metrics`](crate::telemetry::init_metrics)).

use std::time::Duration;

use metrics::{counter, histogram};
use tripful_core::QueueName;

pub fn job_enqueued(queue: QueueName) {
    counter!("tripful_jobs_enqueued_total", "queue" => queue.as_str()).increment(1);
}

pub fn job_completed(queue: QueueName, duration: Duration) {
    counter!("tripful_jobs_completed_total", "queue" => queue.as_str()).increment(1);
    histogram!("tripful_job_duration_seconds", "queue" => queue.as_str(), "outcome" => "completed")
        .record(duration.as_secs_f64());
}

pub fn job_failed(queue: QueueName, duration: Duration) {
    counter!("tripful_jobs_failed_total", "queue" => queue.as_str()).increment(1);
    histogram!("tripful_job_duration_seconds", "queue" => queue.as_str(), "outcome" => "failed")
        .record(duration.as_secs_f64());
}

pub fn job_dead_lettered(queue: QueueName) {
    counter!("tripful_jobs_dead_lettered_total", "queue" => queue.as_str()).increment(1);
}

pub fn job_reclaimed(queue: QueueName) {
    counter!("tripful_jobs_reclaimed_total", "queue" => queue.as_str()).increment(1);
}

pub fn claim_error() {
    counter!("tripful_job_claim_errors_total").increment(1);
}
