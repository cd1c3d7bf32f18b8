//! [`Balancer`] – least-outstanding assignment of HTTP requests to Workers.
//!
//! Every connected Worker has an outstanding-request counter. A request goes
//! to the Worker with the lowest counter, ties broken by connection order.
//! Picking and incrementing happen under one lock, so concurrent requests
//! never see the same counter value twice. The returned [`Assignment`]
//! decrements on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use switchboard_types::{Frame, ResponseDescriptor};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// What a Worker answered to one `access` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    End(ResponseDescriptor),
    Error(String),
}

#[derive(Default)]
struct Pending {
    /// Set once the connection is gone; no new request may wait after that.
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<WorkerReply>>,
}

/// One Worker connected on `/webserver`.
pub struct WorkerLink {
    id: Uuid,
    outstanding: AtomicUsize,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<Pending>,
}

impl WorkerLink {
    pub fn new(outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outstanding: AtomicUsize::new(0),
            outbound,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `frame` and return the receiver its reply will arrive on.
    /// `None` when the Worker's connection is already gone.
    pub fn send(&self, id: u64, frame: Frame) -> Option<oneshot::Receiver<WorkerReply>> {
        let mut pending = self.pending();
        if pending.closed || self.outbound.send(frame).is_err() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(id, tx);
        Some(rx)
    }

    /// Deliver a reply. Returns `false` if nothing was waiting for `id`.
    pub fn complete(&self, id: u64, reply: WorkerReply) -> bool {
        match self.pending().waiters.remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Close the link and drop every waiting request; their receivers
    /// observe a closed channel. Later [`send`](Self::send)s return `None`.
    pub fn abandon(&self) -> usize {
        let mut pending = self.pending();
        pending.closed = true;
        let count = pending.waiters.len();
        pending.waiters.clear();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.pending().closed
    }
}

/// A request's claim on a Worker; releases the counter on drop.
pub struct Assignment {
    link: Arc<WorkerLink>,
}

impl Assignment {
    pub fn link(&self) -> &WorkerLink {
        &self.link
    }
}

impl Drop for Assignment {
    fn drop(&mut self) {
        self.link.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connected Workers in connection order. Clone it cheaply.
#[derive(Clone, Default)]
pub struct Balancer {
    links: Arc<Mutex<Vec<Arc<WorkerLink>>>>,
}

impl Balancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, Vec<Arc<WorkerLink>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, link: Arc<WorkerLink>) {
        self.links().push(link);
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut links = self.links();
        let before = links.len();
        links.retain(|l| l.id != id);
        links.len() != before
    }

    pub fn len(&self) -> usize {
        self.links().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links().is_empty()
    }

    /// Outstanding counters in connection order.
    pub fn counters(&self) -> Vec<usize> {
        self.links().iter().map(|l| l.outstanding()).collect()
    }

    /// Claim the least-loaded Worker, or `None` when none is connected.
    pub fn assign(&self) -> Option<Assignment> {
        let links = self.links();
        // `min_by_key` keeps the first of equal minima: connection order.
        let link = links.iter().min_by_key(|l| l.outstanding())?;
        link.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(Assignment {
            link: Arc::clone(link),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn link() -> (Arc<WorkerLink>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(WorkerLink::new(tx)), rx)
    }

    #[test]
    fn empty_balancer_assigns_nothing() {
        assert!(Balancer::new().assign().is_none());
    }

    #[test]
    fn ties_go_to_the_earliest_connection() {
        let balancer = Balancer::new();
        let (a, _ra) = link();
        let (b, _rb) = link();
        balancer.add(Arc::clone(&a));
        balancer.add(Arc::clone(&b));
        let first = balancer.assign().unwrap();
        assert_eq!(first.link().id(), a.id());
        let second = balancer.assign().unwrap();
        assert_eq!(second.link().id(), b.id());
        drop(first);
        assert_eq!(balancer.assign().unwrap().link().id(), a.id());
    }

    #[test]
    fn counters_never_drift_more_than_one_apart() {
        let balancer = Balancer::new();
        let (a, _ra) = link();
        let (b, _rb) = link();
        balancer.add(a);
        balancer.add(b);
        let mut held = Vec::new();
        for _ in 0..7 {
            held.push(balancer.assign().unwrap());
            let counters = balancer.counters();
            assert!(counters[0].abs_diff(counters[1]) <= 1, "{counters:?}");
        }
        drop(held);
        assert_eq!(balancer.counters(), vec![0, 0]);
    }

    #[tokio::test]
    async fn complete_and_abandon() {
        let (link, mut wire) = link();
        let rx = link.send(1, Frame::ok(Some(1), Value::Null)).unwrap();
        assert!(wire.recv().await.is_some());
        assert!(link.complete(1, WorkerReply::Error("boom".into())));
        assert_eq!(rx.await.unwrap(), WorkerReply::Error("boom".into()));
        assert!(!link.complete(1, WorkerReply::Error("again".into())));

        let rx = link.send(2, Frame::ok(Some(2), Value::Null)).unwrap();
        assert_eq!(link.abandon(), 1);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn send_after_abandon_fails_instead_of_waiting_forever() {
        let (link, _wire) = link();
        let early = link.send(1, Frame::ok(Some(1), Value::Null)).unwrap();
        assert_eq!(link.abandon(), 1);
        assert!(link.is_closed());
        assert!(early.await.is_err());
        // The outbound channel is still open, yet the link refuses new work.
        assert!(link.send(7, Frame::ok(Some(7), Value::Null)).is_none());
        assert!(!link.complete(7, WorkerReply::Error("late".into())));
    }

    #[test]
    fn send_on_closed_link_fails() {
        let (link, wire) = link();
        drop(wire);
        assert!(link.send(1, Frame::ok(Some(1), Value::Null)).is_none());
    }
}
