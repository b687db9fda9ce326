use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::metrics::{DROPPED_TOTAL, PIPELINE_LATENCY_SECONDS, PIPELINE_OUTCOMES_TOTAL};
use crate::model::Frame;
use crate::pipeline::{Outcome, Pipeline};

/// Drains the work queue, running at most `max_in_flight` pipelines at once.
///
/// Returns once the queue is closed, or `shutdown` fires, and the in-flight
/// runs have finished or `grace` has elapsed. Frames still queued when
/// `shutdown` fires are dropped; the count is returned.
pub async fn run_workers(
    mut rx: mpsc::Receiver<Frame>,
    pipeline: Arc<Pipeline>,
    max_in_flight: usize,
    grace: Duration,
    shutdown: CancellationToken,
) -> usize {
    info!(
        "Starting workers with max_in_flight={}, grace={:?}",
        max_in_flight, grace
    );

    let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let tracker = TaskTracker::new();
    let mut abandoned = 0;

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                abandoned += 1;
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let pipeline = pipeline.clone();
        let span = info_span!("worker", component = "worker", topic = %frame.topic);
        tracker.spawn(
            async move {
                let _permit = permit;
                handle_frame(&pipeline, frame).await;
            }
            .instrument(span),
        );
    }

    rx.close();
    while rx.try_recv().is_ok() {
        abandoned += 1;
    }
    if abandoned > 0 {
        DROPPED_TOTAL
            .with_label_values(&["shutdown"])
            .inc_by(abandoned as f64);
        warn!(abandoned, "Dropped queued frames at shutdown");
    }

    tracker.close();
    info!("Work queue closed, waiting for {} in-flight runs", tracker.len());
    if timeout(grace, tracker.wait()).await.is_err() {
        warn!(
            "Grace period elapsed with {} runs still in flight",
            tracker.len()
        );
    }

    info!("Workers stopped");
    abandoned
}

/// Runs one frame through the pipeline and logs the outcome.
pub async fn handle_frame(pipeline: &Pipeline, frame: Frame) -> Outcome {
    let start = Instant::now();
    let outcome = pipeline.run(&frame.payload).await;
    let elapsed = start.elapsed();

    PIPELINE_LATENCY_SECONDS.observe(elapsed.as_secs_f64());
    PIPELINE_OUTCOMES_TOTAL
        .with_label_values(&[outcome.label()])
        .inc();

    match &outcome {
        Outcome::Succeeded => {
            debug!(duration = ?elapsed, "Telemetry processed successfully");
        }
        Outcome::DuplicateSkipped => {
            info!(duration = ?elapsed, "Duplicate payload skipped");
        }
        Outcome::Dropped(e) => {
            DROPPED_TOTAL.with_label_values(&[e.reason()]).inc();
            warn!(
                reason = e.reason(),
                class = ?e.class(),
                error = %e,
                duration = ?elapsed,
                "Message dropped"
            );
        }
        Outcome::PartiallySucceeded(e) => {
            error!(
                attempts = e.attempts,
                error = %e,
                duration = ?elapsed,
                "Reading persisted but publish failed"
            );
        }
    }

    outcome
}
