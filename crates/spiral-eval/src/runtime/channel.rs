//! Cooperative channels: buffered FIFO or zero-capacity rendezvous.
//!
//! Capacity `n > 0` buffers up to `n` values; a send blocks when the buffer
//! is full and a receive blocks when it is empty. Capacity `0` is a
//! rendezvous: each send pairs with exactly one receive and both complete
//! together. Waiter queues are strict FIFO -- a new send may not overtake
//! senders already waiting.
//!
//! `close` is idempotent. It fails every *waiting* sender and receiver with
//! `ChannelClosed` and rejects future sends, but buffered values remain
//! receivable until drained; only then does `recv` fail.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use indexmap::IndexMap;

use spiral_core::error::ErrorCode;
use spiral_core::types::ChannelKind;
use spiral_core::value::{ChannelId, ErrorValue, Value};

fn closed_error() -> ErrorValue {
    ErrorValue::with_message(ErrorCode::ChannelClosed, "channel is closed")
}

type SendSlot = Rc<RefCell<Option<Result<(), ErrorValue>>>>;
type RecvSlot = Rc<RefCell<Option<Result<Value, ErrorValue>>>>;

struct PendingSend {
    value: Option<Value>,
    slot: SendSlot,
}

struct PendingRecv {
    slot: RecvSlot,
}

struct ChannelState {
    capacity: usize,
    buffer: VecDeque<Value>,
    pending_sends: VecDeque<PendingSend>,
    pending_recvs: VecDeque<PendingRecv>,
    closed: bool,
}

impl ChannelState {
    /// Hands the head waiting sender's value into the buffer after a
    /// receive freed a slot.
    fn promote_sender(&mut self) {
        if self.buffer.len() < self.capacity {
            if let Some(mut send) = self.pending_sends.pop_front() {
                if let Some(value) = send.value.take() {
                    self.buffer.push_back(value);
                }
                *send.slot.borrow_mut() = Some(Ok(()));
            }
        }
    }
}

/// A cooperative channel. Clones share the same state.
#[derive(Clone)]
pub struct Channel {
    state: Rc<RefCell<ChannelState>>,
}

impl Channel {
    /// `capacity == 0` creates a rendezvous channel.
    pub fn new(capacity: usize) -> Self {
        Channel {
            state: Rc::new(RefCell::new(ChannelState {
                capacity,
                buffer: VecDeque::new(),
                pending_sends: VecDeque::new(),
                pending_recvs: VecDeque::new(),
                closed: false,
            })),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        if self.state.borrow().capacity == 0 {
            ChannelKind::Rendezvous
        } else {
            ChannelKind::Buffered
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    pub fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().buffer.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Sends a value, suspending while the buffer is full (or, for a
    /// rendezvous channel, until a receiver arrives).
    pub fn send(&self, value: Value) -> SendFuture {
        SendFuture {
            state: self.state.clone(),
            value: Some(value),
            slot: None,
        }
    }

    /// Receives a value, suspending while nothing is available.
    pub fn recv(&self) -> RecvFuture {
        RecvFuture {
            state: self.state.clone(),
            slot: None,
        }
    }

    /// Non-suspending send. `Ok(true)` on delivery, `Ok(false)` when the
    /// send would block, `Err(ChannelClosed)` after close.
    pub fn try_send(&self, value: Value) -> Result<bool, ErrorValue> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(closed_error());
        }
        if state.capacity == 0 {
            if let Some(recv) = state.pending_recvs.pop_front() {
                *recv.slot.borrow_mut() = Some(Ok(value));
                return Ok(true);
            }
            return Ok(false);
        }
        if state.buffer.len() < state.capacity && state.pending_sends.is_empty() {
            if let Some(recv) = state.pending_recvs.pop_front() {
                *recv.slot.borrow_mut() = Some(Ok(value));
            } else {
                state.buffer.push_back(value);
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Non-suspending receive. `Ok(Some)` on a value, `Ok(None)` when
    /// nothing is ready, `Err(ChannelClosed)` once closed and drained.
    pub fn try_recv(&self) -> Result<Option<Value>, ErrorValue> {
        let mut state = self.state.borrow_mut();
        if let Some(value) = state.buffer.pop_front() {
            state.promote_sender();
            return Ok(Some(value));
        }
        if state.capacity == 0 {
            if let Some(mut send) = state.pending_sends.pop_front() {
                let value = send.value.take();
                *send.slot.borrow_mut() = Some(Ok(()));
                return Ok(value);
            }
        }
        if state.closed {
            return Err(closed_error());
        }
        Ok(None)
    }

    /// Closes the channel: waiting senders and receivers fail immediately,
    /// future sends fail, buffered values stay receivable. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return;
        }
        state.closed = true;
        for send in state.pending_sends.drain(..) {
            *send.slot.borrow_mut() = Some(Err(closed_error()));
        }
        for recv in state.pending_recvs.drain(..) {
            *recv.slot.borrow_mut() = Some(Err(closed_error()));
        }
    }
}

/// Future returned by [`Channel::send`].
pub struct SendFuture {
    state: Rc<RefCell<ChannelState>>,
    value: Option<Value>,
    slot: Option<SendSlot>,
}

impl Future for SendFuture {
    type Output = Result<(), ErrorValue>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(slot) = &this.slot {
            // Registered: wait for the channel to resolve the slot.
            return match slot.borrow_mut().take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            };
        }

        let mut state = this.state.borrow_mut();
        if state.closed {
            return Poll::Ready(Err(closed_error()));
        }

        if state.capacity == 0 {
            if let Some(recv) = state.pending_recvs.pop_front() {
                let value = this.value.take().expect("send value present until delivery");
                *recv.slot.borrow_mut() = Some(Ok(value));
                return Poll::Ready(Ok(()));
            }
        } else if state.buffer.len() < state.capacity && state.pending_sends.is_empty() {
            let value = this.value.take().expect("send value present until delivery");
            if let Some(recv) = state.pending_recvs.pop_front() {
                *recv.slot.borrow_mut() = Some(Ok(value));
            } else {
                state.buffer.push_back(value);
            }
            return Poll::Ready(Ok(()));
        }

        let slot: SendSlot = Rc::new(RefCell::new(None));
        state.pending_sends.push_back(PendingSend {
            value: this.value.take(),
            slot: slot.clone(),
        });
        this.slot = Some(slot);
        Poll::Pending
    }
}

/// Future returned by [`Channel::recv`].
pub struct RecvFuture {
    state: Rc<RefCell<ChannelState>>,
    slot: Option<RecvSlot>,
}

impl Future for RecvFuture {
    type Output = Result<Value, ErrorValue>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(slot) = &this.slot {
            return match slot.borrow_mut().take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            };
        }

        let mut state = this.state.borrow_mut();
        if let Some(value) = state.buffer.pop_front() {
            state.promote_sender();
            return Poll::Ready(Ok(value));
        }
        if state.capacity == 0 {
            if let Some(mut send) = state.pending_sends.pop_front() {
                let value = send.value.take().expect("paired send holds a value");
                *send.slot.borrow_mut() = Some(Ok(()));
                return Poll::Ready(Ok(value));
            }
        }
        if state.closed {
            return Poll::Ready(Err(closed_error()));
        }

        let slot: RecvSlot = Rc::new(RefCell::new(None));
        state.pending_recvs.push_back(PendingRecv { slot: slot.clone() });
        this.slot = Some(slot);
        Poll::Pending
    }
}

struct StoreInner {
    channels: IndexMap<ChannelId, Channel>,
    next: u64,
}

/// Channel store scoped to one evaluation run; ids are monotonic `ch_N`.
#[derive(Clone)]
pub struct ChannelStore {
    inner: Rc<RefCell<StoreInner>>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        ChannelStore::new()
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        ChannelStore {
            inner: Rc::new(RefCell::new(StoreInner {
                channels: IndexMap::new(),
                next: 0,
            })),
        }
    }

    pub fn create(&self, capacity: usize) -> ChannelId {
        let mut inner = self.inner.borrow_mut();
        let id = ChannelId(inner.next);
        inner.next += 1;
        inner.channels.insert(id, Channel::new(capacity));
        id
    }

    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.inner.borrow().channels.get(&id).cloned()
    }

    /// Closes and removes the channel.
    pub fn delete(&self, id: ChannelId) -> bool {
        let removed = self.inner.borrow_mut().channels.shift_remove(&id);
        match removed {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Closes and removes every channel.
    pub fn clear(&self) {
        let drained: Vec<Channel> = {
            let mut inner = self.inner.borrow_mut();
            inner.channels.drain(..).map(|(_, c)| c).collect()
        };
        for channel in drained {
            channel.close();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().channels.is_empty()
    }
}
