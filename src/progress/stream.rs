//! Background deployment with a drained, disconnect-tolerant relay.
//!
//! The worker task writes into an unbounded queue so it never blocks on the
//! consumer and never loses a line. After its terminal outcome it enqueues a
//! single [`QueueItem::Drained`] sentinel. The relay drains the queue until
//! that sentinel, translating lines into [`ProgressEvent`]s, and checks for a
//! departed consumer at every poll interval.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::pipeline::ProvisionedInstance;

use super::{ProgressEvent, ProgressSink};

/// Default interval at which the relay checks for consumer departure.
pub const DEFAULT_RELAY_POLL: Duration = Duration::from_millis(500);

/// Item carried from the worker to the relay.
#[derive(Debug)]
enum QueueItem {
    Line(String),
    Finished(Result<ProvisionedInstance, String>),
    Drained,
}

/// Sink handed to the background worker.
#[derive(Clone, Debug)]
pub struct QueueSink {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl ProgressSink for QueueSink {
    fn log(&self, line: &str) {
        tracing::info!(target: "skiff::progress", "{line}");
        if self.tx.send(QueueItem::Line(line.to_owned())).is_err() {
            debug!("progress relay has gone away; line kept only in logs");
        }
    }
}

/// How a relayed stream ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamOutcome {
    /// The deployment finished and `complete` was delivered.
    Completed(ProvisionedInstance),
    /// The deployment failed and `error` was delivered.
    Failed(String),
    /// The consumer went away; the deployment keeps running unobserved.
    Disconnected,
}

/// Receiving half of a background deployment.
#[derive(Debug)]
pub struct DeploymentStream {
    rx: mpsc::UnboundedReceiver<QueueItem>,
}

/// Starts `job` on a detached task and returns the stream of its progress.
///
/// Dropping the returned stream does not cancel the job.
pub fn spawn_streaming<F, Fut, E>(job: F) -> DeploymentStream
where
    F: FnOnce(QueueSink) -> Fut + Send + 'static,
    Fut: Future<Output = Result<ProvisionedInstance, E>> + Send + 'static,
    E: Display,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = QueueSink { tx: tx.clone() };
    // The join handle is dropped on purpose: the task is detached.
    drop(tokio::spawn(async move {
        let outcome = job(sink).await.map_err(|err| err.to_string());
        if let Err(message) = &outcome {
            warn!(error = %message, "background deployment failed");
        }
        if tx.send(QueueItem::Finished(outcome)).is_err() || tx.send(QueueItem::Drained).is_err() {
            debug!("progress relay has gone away before the deployment finished");
        }
    }));
    DeploymentStream { rx }
}

impl DeploymentStream {
    /// Forwards events to `out` until the terminal event has been delivered
    /// and the queue is drained, or until `out` is closed.
    ///
    /// The consumer is checked for departure at least once per
    /// `poll_interval`.
    pub async fn relay(
        mut self,
        out: &mpsc::Sender<ProgressEvent>,
        poll_interval: Duration,
    ) -> StreamOutcome {
        let mut terminal: Option<StreamOutcome> = None;
        loop {
            if out.is_closed() {
                debug!("progress consumer disconnected");
                return StreamOutcome::Disconnected;
            }
            let item = match timeout(poll_interval, self.rx.recv()).await {
                Err(_elapsed) => continue,
                Ok(Some(item)) => item,
                Ok(None) => {
                    // The worker vanished without reporting (for example it panicked).
                    if let Some(outcome) = terminal {
                        return outcome;
                    }
                    let message =
                        String::from("deployment worker stopped before reporting an outcome");
                    if out
                        .send(ProgressEvent::Error {
                            message: message.clone(),
                        })
                        .await
                        .is_err()
                    {
                        return StreamOutcome::Disconnected;
                    }
                    return StreamOutcome::Failed(message);
                }
            };
            let events = match item {
                QueueItem::Line(line) => ProgressEvent::from_line(&line),
                QueueItem::Finished(Ok(instance)) => {
                    terminal = Some(StreamOutcome::Completed(instance.clone()));
                    vec![ProgressEvent::Complete { instance }]
                }
                QueueItem::Finished(Err(message)) => {
                    terminal = Some(StreamOutcome::Failed(message.clone()));
                    vec![ProgressEvent::Error { message }]
                }
                QueueItem::Drained => {
                    return terminal.unwrap_or(StreamOutcome::Disconnected);
                }
            };
            for event in events {
                if out.send(event).await.is_err() {
                    debug!("progress consumer disconnected mid-event");
                    return StreamOutcome::Disconnected;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Notify;

    use super::*;

    fn instance() -> ProvisionedInstance {
        ProvisionedInstance {
            id: String::from("i-0abc"),
            address: String::from("ec2-host.compute.amazonaws.com"),
            instance_type: String::from("t3.micro"),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn events_arrive_in_order_and_end_with_one_terminal() {
        let stream = spawn_streaming(|sink: QueueSink| async move {
            sink.log("Launching instance");
            sink.log("some output");
            sink.log("Deployment completed successfully");
            Ok::<_, String>(instance())
        });
        let (tx, rx) = mpsc::channel(4);
        let collector = tokio::spawn(collect(rx));
        let outcome = stream.relay(&tx, DEFAULT_RELAY_POLL).await;
        drop(tx);
        let events = collector.await.expect("collector task");

        assert_eq!(outcome, StreamOutcome::Completed(instance()));
        assert_eq!(
            events,
            vec![
                ProgressEvent::Log {
                    text: String::from("Launching instance")
                },
                ProgressEvent::Milestone { percent: 25 },
                ProgressEvent::Log {
                    text: String::from("some output")
                },
                ProgressEvent::Log {
                    text: String::from("Deployment completed successfully")
                },
                ProgressEvent::Milestone { percent: 100 },
                ProgressEvent::Complete {
                    instance: instance()
                },
            ]
        );
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn lines_queued_before_a_fast_failure_are_still_drained() {
        let stream = spawn_streaming(|sink: QueueSink| async move {
            for step in 0..50 {
                sink.log(&format!("line {step}"));
            }
            Err::<ProvisionedInstance, _>("install failed")
        });
        // Let the worker finish before the relay starts reading.
        tokio::task::yield_now().await;
        let (tx, rx) = mpsc::channel(128);
        let outcome = stream.relay(&tx, DEFAULT_RELAY_POLL).await;
        drop(tx);
        let events = collect(rx).await;

        assert_eq!(outcome, StreamOutcome::Failed(String::from("install failed")));
        assert_eq!(events.len(), 51);
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Error {
                message: String::from("install failed")
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_returns_within_one_poll_and_worker_continues() {
        let release = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let worker_release = Arc::clone(&release);
        let worker_finished = Arc::clone(&finished);
        let stream = spawn_streaming(move |sink: QueueSink| async move {
            sink.log("Launching instance");
            worker_release.notified().await;
            sink.log("still working");
            worker_finished.store(true, Ordering::SeqCst);
            Ok::<_, String>(instance())
        });

        let poll = Duration::from_secs(1);
        let (tx, mut rx) = mpsc::channel(8);
        let relay = tokio::spawn(async move { stream.relay(&tx, poll).await });

        let first = rx.recv().await.expect("first event");
        assert_eq!(
            first,
            ProgressEvent::Log {
                text: String::from("Launching instance")
            }
        );
        drop(rx);

        let outcome = timeout(poll + Duration::from_millis(1), relay)
            .await
            .expect("relay should notice the disconnect within a poll interval")
            .expect("relay task");
        assert_eq!(outcome, StreamOutcome::Disconnected);

        release.notify_one();
        for _ in 0..10 {
            if finished.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(finished.load(Ordering::SeqCst), "worker must run to completion");
    }

    #[tokio::test]
    async fn panicking_worker_still_yields_one_error() {
        let stream = spawn_streaming(|_sink: QueueSink| async move {
            let result: Result<ProvisionedInstance, String> = Err(String::new());
            if result.is_err() {
                panic!("worker exploded");
            }
            result
        });
        let (tx, rx) = mpsc::channel(4);
        let outcome = stream.relay(&tx, DEFAULT_RELAY_POLL).await;
        drop(tx);
        let events = collect(rx).await;

        assert!(matches!(outcome, StreamOutcome::Failed(_)));
        assert_eq!(events.len(), 1);
        assert!(events.iter().all(|event| event.is_terminal()));
    }
}
