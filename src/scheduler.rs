//! Periodic dispatch of group updates.
//!
//! Every group has its own period. One background task keeps the next due
//! time of each group in a min-heap, sleeps until the earliest one, and
//! pushes that group onto a bounded queue. A single consumer drains the
//! queue and runs [`Group::update`] one group at a time, which keeps every
//! [`RouteTable`] mutation on one task.
//!
//! ```text
//!  heap[(due, group)] ──sleep_until──▶ dispatcher ──mpsc──▶ consumer ──▶ Group::update
//!                                         ▲
//!                              stop (watch) ┘
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use crate::group::Group;
use crate::metrics;
use crate::table::RouteTable;

/// Capacity of the update queue.
const QUEUE_DEPTH: usize = 16;

/// Stand-in deadline for intervals past the clock's range.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Owns the groups, the route table and the dispatch task.
pub struct Scheduler {
    groups: Vec<Arc<Group>>,
    table: RouteTable,
    updates_tx: Option<mpsc::Sender<Arc<Group>>>,
    updates_rx: Option<mpsc::Receiver<Arc<Group>>>,
    stop_tx: watch::Sender<bool>,
    dispatcher: Option<JoinHandle<()>>,
    started: bool,
}

impl Scheduler {
    /// Create a scheduler over `groups`, reconciling into `table`.
    pub fn new(groups: Vec<Group>, table: RouteTable) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(QUEUE_DEPTH);
        let (stop_tx, _) = watch::channel(false);
        Self {
            groups: groups.into_iter().map(Arc::new).collect(),
            table,
            updates_tx: Some(updates_tx),
            updates_rx: Some(updates_rx),
            stop_tx,
            dispatcher: None,
            started: false,
        }
    }

    /// Groups in configuration order.
    pub fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    /// The route table every update reconciles into.
    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Mutable access for the queue consumer.
    pub fn table_mut(&mut self) -> &mut RouteTable {
        &mut self.table
    }

    /// Start the timers and the dispatch task.
    ///
    /// # Panics
    ///
    /// Panics when called a second time.
    pub fn start(&mut self) {
        if self.started {
            panic!("Scheduler::start may not be called twice");
        }
        self.started = true;

        let Some(updates) = self.updates_tx.take() else {
            info!("Scheduler stopped before start, not dispatching");
            return;
        };

        info!(groups = self.groups.len(), "Starting group timers");
        let groups = self.groups.clone();
        let stop = self.stop_tx.subscribe();
        self.dispatcher = Some(tokio::spawn(dispatch(groups, updates, stop)));
    }

    /// Hand out the update queue. Only the first call gets it.
    ///
    /// Yields one group per timer expiry, in expiry order. Closes after
    /// [`stop`](Self::stop).
    pub fn take_updates(&mut self) -> Option<mpsc::Receiver<Arc<Group>>> {
        self.updates_rx.take()
    }

    /// Update every group once, right now, regardless of timers.
    pub async fn update_all(&mut self) {
        info!(groups = self.groups.len(), "Initial update of all groups");
        for group in &self.groups {
            group.update(&mut self.table).await;
        }
    }

    /// Stop all timers and close the update queue.
    ///
    /// Groups already queued are still delivered before the queue reports
    /// closed.
    pub fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        self.updates_tx = None;
        debug!("Scheduler stop requested");
    }

    /// Delete every managed route and release the groups.
    ///
    /// Waits for the dispatch task to exit, so call [`stop`](Self::stop)
    /// first.
    pub async fn cleanup(mut self) {
        self.stop();
        if let Some(handle) = self.dispatcher.take() {
            if let Err(e) = handle.await {
                error!("Dispatch task panicked: {}", e);
            }
        }
        self.table.flush().await;
        self.groups.clear();
        info!("Scheduler cleaned up");
    }
}

/// `from + interval`, saturating at a point roughly thirty years out.
fn deadline(from: Instant, interval: Duration) -> Instant {
    from.checked_add(interval).unwrap_or_else(|| Instant::now() + FAR_FUTURE)
}

/// Dispatch loop: emit each group every time its period elapses.
async fn dispatch(
    groups: Vec<Arc<Group>>,
    updates: mpsc::Sender<Arc<Group>>,
    mut stop: watch::Receiver<bool>,
) {
    let start = Instant::now();
    let mut timers: BinaryHeap<Reverse<(Instant, usize)>> = groups
        .iter()
        .enumerate()
        .map(|(index, group)| Reverse((deadline(start, group.interval()), index)))
        .collect();

    loop {
        if *stop.borrow() {
            break;
        }

        let Some(&Reverse((due, index))) = timers.peek() else {
            // No groups: nothing to dispatch until told to stop.
            let _ = stop.changed().await;
            break;
        };

        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = sleep_until(due) => {}
        }

        timers.pop();
        let group = Arc::clone(&groups[index]);
        // Late expiries are not replayed; the next one is a full period away.
        let now = Instant::now();
        let mut next = deadline(due, group.interval());
        if next <= now {
            next = deadline(now, group.interval());
        }
        timers.push(Reverse((next, index)));

        debug!(group = %group.id(), "group is due");
        metrics::record_dispatch();

        tokio::select! {
            biased;
            _ = stop.changed() => break,
            sent = updates.send(group) => {
                if sent.is_err() {
                    debug!("update queue receiver dropped");
                    break;
                }
            }
        }
    }

    debug!("dispatch loop stopped");
}
