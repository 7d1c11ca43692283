// Per-connection state: identity, watched operations, room back-reference and
// the bounded outbound queue that the connection's writer drains.
use crate::room::Room;
use crate::{HubError, Result};
use ahash::RandomState;
use courier_wire::Proto;
use hashbrown::HashSet;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Item handed to a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Outbound frame.
    Proto(Proto),
    /// Stop writing; the connection is going away.
    Finish,
}

/// Who is on the other end of a channel, as resolved by the logic tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub key: String,
    pub mid: i64,
    pub ip: String,
}

#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    identity: Identity,
    sender: mpsc::Sender<Signal>,
    capacity: usize,
    // Frames currently sitting in the queue.
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
    // Set while the channel occupies a slot in a bucket's table.
    registered: AtomicBool,
    watch_ops: RwLock<HashSet<i32, RandomState>>,
    // Non-owning; the room table owns rooms.
    room: Mutex<Weak<Room>>,
}

impl Channel {
    /// Creates a channel whose queue holds at most `capacity` frames.
    ///
    /// One extra slot is reserved so the finish signal always fits.
    pub fn new(identity: Identity, capacity: usize) -> (Arc<Self>, ChannelReceiver) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity + 1);
        let pending = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            sender,
            capacity,
            pending: Arc::clone(&pending),
            closed: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            watch_ops: RwLock::new(HashSet::with_hasher(RandomState::new())),
            room: Mutex::new(Weak::new()),
        });
        (channel, ChannelReceiver { receiver, pending })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.identity.key
    }

    pub fn mid(&self) -> i64 {
        self.identity.mid
    }

    pub fn ip(&self) -> &str {
        &self.identity.ip
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames queued but not yet taken by the writer.
    pub fn queued(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn watch(&self, ops: &[i32]) {
        let mut watched = self.watch_ops.write();
        watched.extend(ops.iter().copied());
    }

    pub fn unwatch(&self, ops: &[i32]) {
        let mut watched = self.watch_ops.write();
        for op in ops {
            watched.remove(op);
        }
    }

    pub fn needs_delivery(&self, op: i32) -> bool {
        self.watch_ops.read().contains(&op)
    }

    /// Watched operations in ascending order.
    pub fn watched(&self) -> Vec<i32> {
        let mut ops: Vec<i32> = self.watch_ops.read().iter().copied().collect();
        ops.sort_unstable();
        ops
    }

    /// Enqueues a frame without blocking.
    pub fn push(&self, proto: Proto) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::ChannelClosed);
        }
        if self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_err()
        {
            metrics::counter!("courier_channel_push_dropped_total").increment(1);
            return Err(HubError::QueueFull);
        }
        match self.sender.try_send(Signal::Proto(proto)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.release_slot();
                metrics::counter!("courier_channel_push_dropped_total").increment(1);
                Err(HubError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.release_slot();
                Err(HubError::ChannelClosed)
            }
        }
    }

    /// Asks the writer to stop. Only the first call enqueues anything.
    pub fn signal_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The reserved slot guarantees room unless the writer is already gone.
        let _ = self.sender.try_send(Signal::Finish);
    }

    /// Room the channel currently belongs to, if any.
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.lock().upgrade()
    }

    pub(crate) fn room_slot(&self) -> MutexGuard<'_, Weak<Room>> {
        self.room.lock()
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    /// Clears the registration flag, returning whether it was set.
    pub(crate) fn take_registered(&self) -> bool {
        self.registered.swap(false, Ordering::AcqRel)
    }

    fn release_slot(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Writer-side end of a channel queue.
#[derive(Debug)]
pub struct ChannelReceiver {
    receiver: mpsc::Receiver<Signal>,
    pending: Arc<AtomicUsize>,
}

impl ChannelReceiver {
    /// Waits for the next signal. A vanished channel reads as `Finish`.
    pub async fn ready(&mut self) -> Signal {
        match self.receiver.recv().await {
            Some(signal) => self.account(signal),
            None => Signal::Finish,
        }
    }

    pub fn try_ready(&mut self) -> Option<Signal> {
        self.receiver.try_recv().ok().map(|signal| self.account(signal))
    }

    /// Discards everything up to and including the finish signal.
    pub async fn drain_until_finish(&mut self) {
        loop {
            if let Signal::Finish = self.ready().await {
                return;
            }
        }
    }

    fn account(&self, signal: Signal) -> Signal {
        if !matches!(signal, Signal::Finish) {
            let _ = self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        signal
    }
}
