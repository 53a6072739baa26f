//! Hand-off of streamed prediction events from worker threads to the host.
//!
//! Workers never call user callbacks. Each request gets a bounded(1)
//! channel, so at most one produced chunk waits for delivery, and a doorbell
//! tells the host there is something to dispatch. Callbacks run on whatever
//! thread calls [`ChunkDispatcher::dispatch_pending`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TryRecvError};
use llm_host_models::Response;
use parking_lot::Mutex;
use tracing::{debug, warn};

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictionEvent {
    /// A produced chunk. The one with `done` set ends the request.
    Chunk(Response),
    Error(String),
    Cancelled,
}

impl PredictionEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Chunk(response) => response.done,
            Self::Error(_) | Self::Cancelled => true,
        }
    }
}

type Callback = Box<dyn FnMut(PredictionEvent) + Send>;

pub(crate) struct Subscription {
    request_id: RequestId,
    events: Receiver<PredictionEvent>,
    callback: Callback,
}

pub(crate) enum SendOutcome {
    Sent,
    Cancelled,
    Disconnected,
}

/// Worker side of one request.
pub(crate) struct ChunkSender {
    request_id: RequestId,
    events: Sender<PredictionEvent>,
    doorbell: Sender<()>,
    poll_interval: Duration,
}

impl Subscription {
    pub(crate) fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl ChunkSender {
    pub(crate) fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Waits for room in the queue while watching `cancel`. The event is
    /// dropped, not queued, once cancellation is seen.
    pub(crate) fn send_chunk(&self, event: PredictionEvent, cancel: &AtomicBool) -> SendOutcome {
        let mut event = event;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return SendOutcome::Cancelled;
            }
            match self.events.send_timeout(event, self.poll_interval) {
                Ok(()) => {
                    self.ring();
                    return SendOutcome::Sent;
                }
                Err(SendTimeoutError::Timeout(back)) => event = back,
                Err(SendTimeoutError::Disconnected(_)) => return SendOutcome::Disconnected,
            }
        }
    }

    /// Blocks until the terminal event is queued or the host goes away.
    pub(crate) fn send_terminal(&self, event: PredictionEvent) {
        if self.events.send(event).is_ok() {
            self.ring();
        } else {
            debug!(request_id = self.request_id, "terminal event dropped, dispatcher gone");
        }
    }

    fn ring(&self) {
        let _ = self.doorbell.send(());
    }
}

pub struct ChunkDispatcher {
    subscriptions: Mutex<Vec<Subscription>>,
    consumer: Mutex<()>,
    in_flight: AtomicUsize,
    next_request: AtomicU64,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
    poll_interval: Duration,
}

impl ChunkDispatcher {
    /// `poll_interval` is how often a worker blocked on a full queue looks
    /// at its cancellation flag.
    pub fn new(poll_interval: Duration) -> Self {
        let (doorbell_tx, doorbell_rx) = channel::unbounded();
        Self {
            subscriptions: Mutex::new(Vec::new()),
            consumer: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            next_request: AtomicU64::new(1),
            doorbell_tx,
            doorbell_rx,
            poll_interval,
        }
    }

    /// Creates the channel of a new request. Nothing is dispatched for it
    /// until the returned subscription is passed to [`Self::activate`];
    /// dropping it instead forgets the request without calling back.
    pub(crate) fn open<F>(&self, callback: F) -> (ChunkSender, Subscription)
    where
        F: FnMut(PredictionEvent) + Send + 'static,
    {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = channel::bounded(1);
        let sender = ChunkSender {
            request_id,
            events: tx,
            doorbell: self.doorbell_tx.clone(),
            poll_interval: self.poll_interval,
        };
        let subscription = Subscription {
            request_id,
            events: rx,
            callback: Box::new(callback),
        };
        (sender, subscription)
    }

    pub(crate) fn activate(&self, subscription: Subscription) {
        self.subscriptions.lock().push(subscription);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        // The worker may have queued an event before the subscription existed.
        let _ = self.doorbell_tx.send(());
    }

    /// Delivers every queued event on the calling thread. Returns how many
    /// callbacks ran; 0 when another dispatch is already in progress.
    pub fn dispatch_pending(&self) -> usize {
        let Some(_consumer) = self.consumer.try_lock() else {
            return 0;
        };
        while self.doorbell_rx.try_recv().is_ok() {}

        // Callbacks may start new predictions, so the list is not locked
        // while they run.
        let mut active = std::mem::take(&mut *self.subscriptions.lock());
        let mut delivered = 0;
        active.retain_mut(|sub| {
            let keep = drain_subscription(sub, &mut delivered);
            if !keep {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            keep
        });

        let mut subscriptions = self.subscriptions.lock();
        active.append(&mut subscriptions);
        *subscriptions = active;
        delivered
    }

    /// Waits up to `timeout` for a worker to signal, then dispatches.
    pub fn wait_and_dispatch(&self, timeout: Duration) -> usize {
        let delivered = self.dispatch_pending();
        if delivered > 0 {
            return delivered;
        }
        match self.doorbell_rx.recv_timeout(timeout) {
            Ok(()) => self.dispatch_pending(),
            Err(_) => 0,
        }
    }

    /// Dispatches until no request is in flight or `timeout` elapses.
    /// Returns true when everything finished.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait_and_dispatch(deadline - now);
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Returns false once the subscription is finished.
fn drain_subscription(sub: &mut Subscription, delivered: &mut usize) -> bool {
    loop {
        match sub.events.try_recv() {
            Ok(event) => {
                let terminal = event.is_terminal();
                (sub.callback)(event);
                *delivered += 1;
                if terminal {
                    return false;
                }
            }
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => {
                warn!(
                    request_id = sub.request_id,
                    "prediction worker exited without a terminal event"
                );
                (sub.callback)(PredictionEvent::Error(
                    "prediction worker exited unexpectedly".to_string(),
                ));
                *delivered += 1;
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn recorder() -> (Arc<Mutex<Vec<PredictionEvent>>>, impl FnMut(PredictionEvent) + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |event| sink.lock().push(event))
    }

    fn register<F>(dispatcher: &ChunkDispatcher, callback: F) -> (RequestId, ChunkSender)
    where
        F: FnMut(PredictionEvent) + Send + 'static,
    {
        let (sender, subscription) = dispatcher.open(callback);
        let request_id = subscription.request_id();
        dispatcher.activate(subscription);
        (request_id, sender)
    }

    fn chunk(text: &str, done: bool) -> PredictionEvent {
        PredictionEvent::Chunk(Response::new(vec![text.to_string()], done))
    }

    #[test]
    fn delivers_in_order_and_drops_after_terminal() {
        let dispatcher = ChunkDispatcher::new(Duration::from_millis(5));
        let (seen, callback) = recorder();
        let (_, sender) = register(&dispatcher, callback);
        let cancel = AtomicBool::new(false);

        let worker = thread::spawn(move || {
            for piece in ["a", "b"] {
                assert!(matches!(
                    sender.send_chunk(chunk(piece, false), &cancel),
                    SendOutcome::Sent
                ));
            }
            sender.send_terminal(chunk("c", true));
        });

        assert!(dispatcher.drain(Duration::from_secs(5)));
        worker.join().expect("worker");

        assert_eq!(
            *seen.lock(),
            vec![chunk("a", false), chunk("b", false), chunk("c", true)]
        );
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.dispatch_pending(), 0);
    }

    #[test]
    fn full_queue_yields_to_cancellation() {
        let dispatcher = ChunkDispatcher::new(Duration::from_millis(2));
        let (seen, callback) = recorder();
        let (_, sender) = register(&dispatcher, callback);
        let cancel = Arc::new(AtomicBool::new(false));

        assert!(matches!(
            sender.send_chunk(chunk("first", false), &cancel),
            SendOutcome::Sent
        ));

        let flag = cancel.clone();
        let worker = thread::spawn(move || {
            let outcome = sender.send_chunk(chunk("second", false), &flag);
            sender.send_terminal(PredictionEvent::Cancelled);
            outcome
        });
        thread::sleep(Duration::from_millis(20));
        cancel.store(true, Ordering::SeqCst);
        // Let the worker notice before the slot frees up.
        thread::sleep(Duration::from_millis(20));

        assert!(dispatcher.drain(Duration::from_secs(5)));
        let outcome = worker.join().expect("worker");
        assert!(matches!(outcome, SendOutcome::Cancelled));
        assert_eq!(*seen.lock(), vec![chunk("first", false), PredictionEvent::Cancelled]);
    }

    #[test]
    fn vanished_worker_gets_a_terminal_error() {
        let dispatcher = ChunkDispatcher::new(Duration::from_millis(5));
        let (seen, callback) = recorder();
        let (_, sender) = register(&dispatcher, callback);
        drop(sender);

        assert_eq!(dispatcher.dispatch_pending(), 1);
        assert!(matches!(seen.lock().as_slice(), [PredictionEvent::Error(_)]));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn unactivated_requests_never_call_back() {
        let dispatcher = ChunkDispatcher::new(Duration::from_millis(5));
        let (seen, callback) = recorder();
        let (sender, subscription) = dispatcher.open(callback);
        let cancel = AtomicBool::new(false);
        assert!(matches!(
            sender.send_chunk(chunk("early", false), &cancel),
            SendOutcome::Sent
        ));

        drop(subscription);
        drop(sender);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.dispatch_pending(), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn events_queued_before_activation_are_not_lost() {
        let dispatcher = ChunkDispatcher::new(Duration::from_millis(5));
        let (seen, callback) = recorder();
        let (sender, subscription) = dispatcher.open(callback);
        sender.send_terminal(chunk("all at once", true));
        assert_eq!(dispatcher.dispatch_pending(), 0);

        dispatcher.activate(subscription);
        assert_eq!(dispatcher.wait_and_dispatch(Duration::from_secs(1)), 1);
        assert_eq!(*seen.lock(), vec![chunk("all at once", true)]);
    }

    #[test]
    fn wait_times_out_when_nothing_arrives() {
        let dispatcher = ChunkDispatcher::new(Duration::from_millis(5));
        let (_seen, callback) = recorder();
        let (_, _sender) = register(&dispatcher, callback);

        assert_eq!(dispatcher.wait_and_dispatch(Duration::from_millis(10)), 0);
        assert!(!dispatcher.drain(Duration::from_millis(10)));
        assert_eq!(dispatcher.in_flight(), 1);
    }
}
