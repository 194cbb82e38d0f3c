use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bitcoin::{Block, BlockHash, Transaction};

use crate::util::spawn_thread;

/// Chain and lifecycle events fanned out to the in-process subscribers
/// (notification engine, protocol servers, estimator upkeep).
#[derive(Clone, Debug)]
pub enum ChainEvent {
    BlockConnected {
        height: u32,
        hash: BlockHash,
        block: Arc<Block>,
    },
    BlockDisconnected {
        height: u32,
        hash: BlockHash,
        block: Arc<Block>,
    },
    TxAccepted {
        tx: Arc<Transaction>,
    },
    TipChanged {
        height: u32,
        hash: BlockHash,
    },
    Suspend,
    Resume,
    Stop,
}

impl ChainEvent {
    pub fn is_stop(&self) -> bool {
        matches!(self, ChainEvent::Stop)
    }
}

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

struct SubscriberQueue {
    name: String,
    depth: usize,
    deque: Mutex<VecDeque<ChainEvent>>,
    cond: Condvar,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    /// Append one event, evicting the oldest non-`Stop` entry when full.
    /// `Stop` is always accepted.
    fn push(&self, event: &ChainEvent) {
        let mut deque = self.deque.lock().unwrap();
        if deque.len() >= self.depth {
            if let Some(pos) = deque.iter().position(|queued| !queued.is_stop()) {
                deque.remove(pos);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else if !event.is_stop() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        deque.push_back(event.clone());
        drop(deque);
        self.cond.notify_one();
    }

    fn pop(&self) -> Option<ChainEvent> {
        let mut deque = self.deque.lock().unwrap();
        loop {
            if let Some(event) = deque.pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            deque = self.cond.wait(deque).unwrap();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.deque.lock().unwrap();
        self.cond.notify_all();
    }
}

/// Keeps the subscription alive; dropping it does NOT unsubscribe (explicit
/// `unsubscribe()` or a `Stop` event end the dispatch thread).
pub struct BusHandle {
    queue: Arc<SubscriberQueue>,
}

impl BusHandle {
    pub fn unsubscribe(&self) {
        self.queue.close();
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// In-process publish/subscribe for `ChainEvent`s. Each subscriber gets a
/// bounded queue drained by its own dispatch thread, so handlers never run
/// on the publisher's thread and one slow subscriber cannot stall another.
pub struct EventBus {
    depth: usize,
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
}

impl EventBus {
    pub fn new(depth: usize) -> Self {
        EventBus {
            depth,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler. It runs on a dedicated thread, receiving events
    /// in publish order (per-subscriber FIFO). The thread unwinds after
    /// handling `Stop` or after `unsubscribe()`.
    pub fn subscribe<F>(&self, name: &str, mut handler: F) -> BusHandle
    where
        F: FnMut(ChainEvent) + Send + 'static,
    {
        let queue = Arc::new(SubscriberQueue {
            name: name.to_string(),
            depth: self.depth,
            deque: Mutex::new(VecDeque::with_capacity(self.depth)),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.subscribers.lock().unwrap().push(Arc::clone(&queue));

        let dispatch_queue = Arc::clone(&queue);
        spawn_thread(&format!("bus-{}", name), move || {
            while let Some(event) = dispatch_queue.pop() {
                let stop = event.is_stop();
                handler(event);
                if stop {
                    break;
                }
            }
            dispatch_queue.close();
            trace!(target: "bsg::events", "bus subscriber {} unwound", dispatch_queue.name);
        });

        BusHandle { queue }
    }

    pub fn publish(&self, event: ChainEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|queue| !queue.closed.load(Ordering::SeqCst));
        for queue in subscribers.iter() {
            queue.push(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|queue| !queue.closed.load(Ordering::SeqCst));
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn tip(height: u32) -> ChainEvent {
        ChainEvent::TipChanged {
            height,
            hash: Default::default(),
        }
    }

    fn height_of(event: &ChainEvent) -> u32 {
        match event {
            ChainEvent::TipChanged { height, .. } => *height,
            _ => panic!("unexpected event"),
        }
    }

    #[test]
    fn delivers_in_fifo_order() {
        let bus = EventBus::new(DEFAULT_QUEUE_DEPTH);
        let (tx, rx) = mpsc::channel();
        let _handle = bus.subscribe("test", move |event| {
            tx.send(event).unwrap();
        });

        for height in 0..10 {
            bus.publish(tip(height));
        }
        for height in 0..10 {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(height_of(&event), height);
        }
    }

    #[test]
    fn overflow_drops_oldest_but_never_stop() {
        let bus = EventBus::new(4);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();
        let handle = bus.subscribe("test", move |event| {
            gate_rx.recv().ok();
            tx.send(event).unwrap();
        });

        // 1 event in flight at the handler + 4 queued + overflow
        for height in 0..8 {
            bus.publish(tip(height));
        }
        bus.publish(ChainEvent::Stop);

        // un-gate everything
        for _ in 0..16 {
            gate_tx.send(()).ok();
        }

        let mut received = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            let stop = event.is_stop();
            received.push(event);
            if stop {
                break;
            }
        }

        assert!(received.last().unwrap().is_stop());
        assert!(received.len() < 9, "some events must have been dropped");
        assert!(handle.dropped_count() > 0);

        // survivors arrive in order
        let heights: Vec<u32> = received[..received.len() - 1].iter().map(height_of).collect();
        let mut sorted = heights.clone();
        sorted.sort_unstable();
        assert_eq!(heights, sorted);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(4);
        let handle = bus.subscribe("test", |_| {});
        handle.unsubscribe();
        handle.unsubscribe();
        // a publish after unsubscribe is a no-op, not an error
        bus.publish(tip(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
