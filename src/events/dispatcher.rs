//! Priority event dispatcher
//!
//! Events are queued by `(priority, sequence)` and delivered by a single background
//! task. Handlers for one event run sequentially in registration order, and a handler
//! that fails, panics, or overruns its timeout is logged without affecting the others.

use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::handler::EventHandler;
use super::types::{Event, EventType};
use crate::config::{DispatcherConfig, OverflowPolicy};
use crate::error::{BusError, Result};

/// Narrow publishing capability handed to components that emit events
pub trait EventPublisher: Send + Sync {
    /// Enqueue an event, returning its assigned sequence
    fn publish(&self, event: Event) -> Result<u64>;

    /// Number of events waiting for delivery
    fn queue_size(&self) -> usize;

    /// Whether the delivery loop is active
    fn is_running(&self) -> bool;
}

/// Acknowledgment that every handler for an event has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub sequence: u64,
    pub handlers_invoked: usize,
    pub handlers_failed: usize,
}

impl DeliveryReceipt {
    pub fn is_success(&self) -> bool {
        self.handlers_failed == 0
    }
}

struct QueuedEvent {
    event: Event,
    receipt: Option<oneshot::Sender<DeliveryReceipt>>,
}

type QueueKey = (i32, u64);
type HandlerTable = HashMap<EventType, Vec<Arc<dyn EventHandler>>>;

struct Shared {
    config: DispatcherConfig,
    queue: Mutex<BTreeMap<QueueKey, QueuedEvent>>,
    handlers: RwLock<HandlerTable>,
    next_sequence: AtomicU64,
    wakeup: Notify,
    running: AtomicBool,
    stopping: AtomicBool,
    drain_deadline: Mutex<Option<Instant>>,
}

pub struct EventDispatcher {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl EventDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(BTreeMap::new()),
                handlers: RwLock::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
                wakeup: Notify::new(),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                drain_deadline: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Register a handler; handlers for the same type run in registration order
    pub fn register_handler(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        event_type.validate()?;

        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(
            event_type = %event_type,
            handler = handler.name(),
            "Registering event handler"
        );
        handlers.entry(event_type).or_default().push(handler);
        Ok(())
    }

    /// Snapshot of the handlers registered for `event_type`
    pub fn get_handlers(&self, event_type: &EventType) -> Vec<Arc<dyn EventHandler>> {
        self.shared.handlers_for(event_type)
    }

    /// Enqueue an event; returns once queued, not once delivered
    pub fn dispatch_event(&self, event: Event) -> Result<u64> {
        self.shared.enqueue(event, None)
    }

    /// Enqueue an event and wait until all of its handlers have run
    pub async fn dispatch_and_wait(&self, event: Event) -> Result<DeliveryReceipt> {
        let (tx, rx) = oneshot::channel();
        let sequence = self.shared.enqueue(event, Some(tx))?;
        rx.await
            .map_err(|_| BusError::EventUndelivered { sequence })
    }

    pub fn get_queue_size(&self) -> usize {
        self.shared.lock_queue().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Spawn the background delivery loop; a second call while running is a no-op
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("Event dispatcher already running");
            return;
        }
        self.shared.stopping.store(false, Ordering::SeqCst);
        *self
            .shared
            .drain_deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            shared.run_loop().await;
        });

        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *task = Some(handle);
        info!("Event dispatcher started");
    }

    /// Stop the loop after delivering what is already queued
    ///
    /// A handler that is running is always allowed to finish. Queued events are
    /// delivered until the queue is empty or the drain timeout passes.
    pub async fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let Some(handle) = handle else {
            debug!("Event dispatcher stop requested but no loop is running");
            return;
        };

        *self
            .shared
            .drain_deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(Instant::now() + self.shared.config.drain_timeout());
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_one();

        if let Err(e) = handle.await {
            error!(error = %e, "Event dispatch loop ended abnormally");
        }
        self.shared.running.store(false, Ordering::SeqCst);
        info!("Event dispatcher stopped");
    }

    /// Cancel the loop outright without draining
    pub fn abort(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.shared.running.store(false, Ordering::SeqCst);

        let dropped = {
            let mut queue = self.shared.lock_queue();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        warn!(dropped_events = dropped, "Event dispatcher aborted");
    }
}

impl EventPublisher for EventDispatcher {
    fn publish(&self, event: Event) -> Result<u64> {
        self.dispatch_event(event)
    }

    fn queue_size(&self) -> usize {
        self.get_queue_size()
    }

    fn is_running(&self) -> bool {
        EventDispatcher::is_running(self)
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, BTreeMap<QueueKey, QueuedEvent>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers_for(&self, event_type: &EventType) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn enqueue(
        &self,
        mut event: Event,
        receipt: Option<oneshot::Sender<DeliveryReceipt>>,
    ) -> Result<u64> {
        let sequence = {
            let mut queue = self.lock_queue();

            if let Some(capacity) = self.config.queue_capacity {
                if queue.len() >= capacity {
                    self.make_room(&mut queue, &event, capacity)?;
                }
            }

            // Assigned under the queue lock so key order matches enqueue order
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            event.assign_sequence(sequence);
            trace!(
                sequence,
                priority = event.priority,
                level = %event.priority_level(),
                event_type = %event.event_type,
                kind = event.kind().unwrap_or(""),
                "Event enqueued"
            );
            queue.insert((event.priority, sequence), QueuedEvent { event, receipt });
            sequence
        };

        self.wakeup.notify_one();
        Ok(sequence)
    }

    fn make_room(
        &self,
        queue: &mut BTreeMap<QueueKey, QueuedEvent>,
        incoming: &Event,
        capacity: usize,
    ) -> Result<()> {
        match self.config.overflow_policy {
            OverflowPolicy::Reject => {
                warn!(capacity, "Event queue full, rejecting event");
                Err(BusError::QueueFull { capacity })
            }
            OverflowPolicy::DropLowest => {
                let least_urgent = queue.last_key_value().map(|(key, _)| key.0);
                match least_urgent {
                    // Incoming sequence is always newer, so it only wins on strictly lower priority
                    Some(priority) if incoming.priority < priority => {
                        if let Some(((priority, sequence), dropped)) = queue.pop_last() {
                            warn!(
                                sequence,
                                priority,
                                level = %dropped.event.priority_level(),
                                kind = dropped.event.kind().unwrap_or(""),
                                "Event queue full, dropping least urgent event"
                            );
                        }
                        Ok(())
                    }
                    _ => {
                        warn!(capacity, "Event queue full of more urgent events, rejecting event");
                        Err(BusError::QueueFull { capacity })
                    }
                }
            }
        }
    }

    fn drain_expired(&self) -> bool {
        self.drain_deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map_or(false, |deadline| Instant::now() >= deadline)
    }

    async fn run_loop(self: Arc<Self>) {
        info!("Event dispatch loop started");

        loop {
            let stopping = self.stopping.load(Ordering::SeqCst);
            if stopping && self.drain_expired() {
                warn!(
                    remaining = self.lock_queue().len(),
                    "Drain timeout reached, leaving events queued"
                );
                break;
            }

            let next = self.lock_queue().pop_first().map(|(_, item)| item);
            match next {
                Some(item) => self.deliver(item).await,
                None if stopping => break,
                None => self.wakeup.notified().await,
            }
        }

        // Waiters on events left behind get an error instead of hanging
        for item in self.lock_queue().values_mut() {
            item.receipt = None;
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Event dispatch loop exited");
    }

    async fn deliver(&self, item: QueuedEvent) {
        let QueuedEvent { event, receipt } = item;
        let handlers = self.handlers_for(&event.event_type);
        let timeout = self.config.handler_timeout();
        let mut failed = 0;

        for handler in &handlers {
            let invocation = AssertUnwindSafe(handler.handle(&event)).catch_unwind();
            match tokio::time::timeout(timeout, invocation).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    failed += 1;
                    error!(
                        handler = handler.name(),
                        sequence = event.sequence(),
                        kind = event.kind().unwrap_or(""),
                        error = %e,
                        "Event handler failed"
                    );
                }
                Ok(Err(_)) => {
                    failed += 1;
                    error!(
                        handler = handler.name(),
                        sequence = event.sequence(),
                        "Event handler panicked"
                    );
                }
                Err(_) => {
                    failed += 1;
                    error!(
                        handler = handler.name(),
                        sequence = event.sequence(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Event handler timed out"
                    );
                }
            }
        }

        if let Some(tx) = receipt {
            let _ = tx.send(DeliveryReceipt {
                sequence: event.sequence(),
                handlers_invoked: handlers.len(),
                handlers_failed: failed,
            });
        }
    }
}
