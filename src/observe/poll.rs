//! Observer that re-runs its query and diffs snapshots.

use crate::error::Result;
use crate::observe::callbacks::{Notification, ObserveCallbacks};
use crate::observe::{fetch, LiveObserver, ObserveHandle, ObserverStatus, Row, Wake};
use crate::query::{PredicateEvaluator, Query};
use crate::store::DocumentStore;
use crate::types::{DocumentId, Namespace};
use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

struct PollState {
    status: ObserverStatus,
    /// Last delivered result. `None` once stopped.
    snapshot: Option<Vec<Row>>,
}

/// Keeps a query result live by re-running it.
///
/// A refresh happens whenever the `pulses` channel fires (collection writes,
/// cursor option changes) and every `poll_interval` otherwise. The query is
/// shared with its cursor, so option changes apply to the next refresh.
pub struct PollingObserver {
    namespace: Namespace,
    store: Arc<dyn DocumentStore>,
    query: Arc<RwLock<Query>>,
    callbacks: ObserveCallbacks,
    delivery: ReentrantMutex<()>,
    state: Mutex<PollState>,
    stop_tx: Sender<()>,
}

impl PollingObserver {
    /// Run `query` once, deliver the result, then refresh on every pulse and
    /// timer tick until stopped.
    ///
    /// `pulses` should be subscribed before this call so that no write
    /// between the initial load and the first refresh goes unnoticed.
    pub fn observe(
        store: Arc<dyn DocumentStore>,
        evaluator: &dyn PredicateEvaluator,
        namespace: Namespace,
        query: Arc<RwLock<Query>>,
        pulses: Receiver<()>,
        poll_interval: Duration,
        callbacks: ObserveCallbacks,
    ) -> Result<ObserveHandle> {
        let current = query.read().clone();
        evaluator.validate(&current.filter)?;
        current.options.validate()?;

        let initial = fetch(store.as_ref(), &namespace, &current)?;
        let (stop_tx, stop_rx) = bounded(1);
        let observer = Arc::new(Self {
            namespace,
            store,
            query,
            callbacks,
            delivery: ReentrantMutex::new(()),
            state: Mutex::new(PollState {
                status: ObserverStatus::Initializing,
                snapshot: Some(initial.clone()),
            }),
            stop_tx,
        });

        observer.load_initial(initial);
        {
            let mut state = observer.state.lock();
            if state.status == ObserverStatus::Stopped {
                return Ok(ObserveHandle::new(observer.clone()));
            }
            state.status = ObserverStatus::Active;
        }

        let worker = Arc::clone(&observer);
        thread::Builder::new()
            .name("livequery-poll".into())
            .spawn(move || worker.run(pulses, stop_rx, poll_interval))?;

        debug!(namespace = %observer.namespace, "polling observer active");
        Ok(ObserveHandle::new(observer))
    }

    fn load_initial(&self, rows: Vec<Row>) {
        let _delivery = self.delivery.lock();
        let documents = rows.into_iter().map(|(_, doc)| doc).collect();
        self.callbacks.deliver_initial(documents);
    }

    fn run(self: Arc<Self>, pulses: Receiver<()>, stop: Receiver<()>, interval: Duration) {
        let ticker = tick(interval);
        let mut pulses = pulses;
        loop {
            let wake = select! {
                recv(stop) -> _ => Wake::Stop,
                recv(pulses) -> msg => match msg {
                    Ok(()) => Wake::Refresh,
                    Err(_) => Wake::PulsesClosed,
                },
                recv(ticker) -> _ => Wake::Refresh,
            };
            match wake {
                Wake::Stop => break,
                Wake::PulsesClosed => {
                    // Notifier gone; keep polling on the timer.
                    pulses = never();
                    continue;
                }
                Wake::Refresh => {}
            }
            if self.status() == ObserverStatus::Stopped {
                break;
            }
            self.refresh();
        }
        debug!(namespace = %self.namespace, "polling thread exiting");
    }

    /// Re-run the query and deliver the difference from the last snapshot.
    fn refresh(&self) {
        let _delivery = self.delivery.lock();
        let query = self.query.read().clone();
        let next = match fetch(self.store.as_ref(), &self.namespace, &query) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "polling query failed");
                return;
            }
        };

        let notifications = {
            let mut state = self.state.lock();
            let Some(previous) = state.snapshot.as_mut() else {
                return;
            };
            let notifications = diff(previous, &next);
            *previous = next;
            notifications
        };

        trace!(
            namespace = %self.namespace,
            changes = notifications.len(),
            "poll refresh"
        );
        for notification in notifications {
            if self.status() == ObserverStatus::Stopped {
                break;
            }
            self.callbacks.notify(notification);
        }
    }
}

impl LiveObserver for PollingObserver {
    fn stop(&self) {
        let _delivery = self.delivery.lock();
        {
            let mut state = self.state.lock();
            if state.status == ObserverStatus::Stopped {
                return;
            }
            state.status = ObserverStatus::Stopped;
            state.snapshot = None;
        }
        let _ = self.stop_tx.try_send(());
        debug!(namespace = %self.namespace, "polling observer stopped");
    }

    fn status(&self) -> ObserverStatus {
        self.state.lock().status
    }

    fn membership(&self) -> Vec<DocumentId> {
        self.state
            .lock()
            .snapshot
            .as_ref()
            .map(|rows| rows.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }
}

/// Compute the notifications that turn `previous` into `next`.
///
/// Removals are reported first, with indexes into the shrinking old list.
/// The new list is then walked in order: unseen ids are `Added` at their
/// final index, ids found elsewhere are `Moved` there, and ids whose
/// content differs are `Changed`. Applying the notifications in order to
/// `previous` yields `next`.
pub(crate) fn diff(previous: &[Row], next: &[Row]) -> Vec<Notification> {
    let mut notifications = Vec::new();
    let mut working: Vec<Row> = Vec::with_capacity(previous.len().max(next.len()));

    for row in previous {
        if next.iter().any(|(id, _)| *id == row.0) {
            working.push(row.clone());
        } else {
            notifications.push(Notification::Removed {
                document: row.1.clone(),
                index: working.len(),
            });
        }
    }

    for (index, (id, document)) in next.iter().enumerate() {
        match working.iter().position(|(cached, _)| cached == id) {
            None => {
                working.insert(index, (id.clone(), document.clone()));
                notifications.push(Notification::Added {
                    document: document.clone(),
                    index,
                });
            }
            Some(from) => {
                if from != index {
                    let row = working.remove(from);
                    working.insert(index, row);
                    notifications.push(Notification::Moved {
                        document: document.clone(),
                        from,
                        to: index,
                    });
                }
                if working[index].1 != *document {
                    let before = std::mem::replace(&mut working[index].1, document.clone());
                    notifications.push(Notification::Changed {
                        before: Some(before),
                        after: document.clone(),
                        index,
                    });
                }
            }
        }
    }

    notifications
}
