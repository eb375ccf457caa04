//! Go-style channels over a mutex and condition variables
//!
//! Two variants behind one trait: a rendezvous channel where send and
//! receive must meet, and a bounded buffered channel. Both follow the
//! drain-then-error close contract: a closed buffered channel still hands
//! out what it holds, and only then starts failing receives.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("send on closed channel")]
    SendOnClosed,
    #[error("receive on closed channel")]
    ReceiveOnClosed,
}

/// Single-producer/single-consumer handoff with close semantics.
pub trait Channel<T>: Send + Sync {
    fn send(&self, value: T) -> Result<(), ChannelError>;
    fn receive(&self) -> Result<T, ChannelError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Capacity 0 yields the rendezvous variant, anything else the buffered one.
pub fn make_channel<T: Send + 'static>(capacity: usize) -> Arc<dyn Channel<T>> {
    if capacity == 0 {
        Arc::new(RendezvousChannel::new())
    } else {
        Arc::new(BufferedChannel::new(capacity))
    }
}

fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn wait_on<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(|e| e.into_inner())
}

struct RendezvousState<T> {
    open: bool,
    receiver_ready: bool,
    slot: Option<T>,
}

/// Unbuffered channel: both sides must be present before either returns.
/// At most one value is ever in flight.
pub struct RendezvousChannel<T> {
    state: Mutex<RendezvousState<T>>,
    sender: Condvar,
    receiver: Condvar,
}

impl<T> RendezvousChannel<T> {
    pub fn new() -> Self {
        RendezvousChannel {
            state: Mutex::new(RendezvousState {
                open: true,
                receiver_ready: false,
                slot: None,
            }),
            sender: Condvar::new(),
            receiver: Condvar::new(),
        }
    }
}

impl<T> Default for RendezvousChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Channel<T> for RendezvousChannel<T> {
    fn send(&self, value: T) -> Result<(), ChannelError> {
        let mut st = lock_state(&self.state);
        if !st.open {
            return Err(ChannelError::SendOnClosed);
        }
        // Wait for a receiver to arrive.
        while !st.receiver_ready && st.open {
            st = wait_on(&self.sender, st);
        }
        if !st.open {
            return Err(ChannelError::SendOnClosed);
        }
        st.slot = Some(value);
        self.receiver.notify_all();
        // Wait until the receiver has taken the value.
        while st.slot.is_some() && st.open {
            st = wait_on(&self.sender, st);
        }
        if st.slot.is_some() {
            // Closed before pickup; the value is lost to both sides.
            st.slot = None;
            return Err(ChannelError::SendOnClosed);
        }
        Ok(())
    }

    fn receive(&self) -> Result<T, ChannelError> {
        let mut st = lock_state(&self.state);
        if !st.open {
            return Err(ChannelError::ReceiveOnClosed);
        }
        st.receiver_ready = true;
        self.sender.notify_all();
        while st.slot.is_none() && st.open {
            st = wait_on(&self.receiver, st);
        }
        let Some(value) = st.slot.take() else {
            st.receiver_ready = false;
            return Err(ChannelError::ReceiveOnClosed);
        };
        st.receiver_ready = false;
        self.sender.notify_all();
        Ok(value)
    }

    fn close(&self) {
        let mut st = lock_state(&self.state);
        st.open = false;
        self.receiver.notify_all();
        self.sender.notify_all();
    }

    fn is_closed(&self) -> bool {
        !lock_state(&self.state).open
    }
}

struct BufferedState<T> {
    open: bool,
    buffer: VecDeque<T>,
}

/// Bounded channel: send blocks while full, receive while empty. Closing
/// leaves buffered items receivable.
pub struct BufferedChannel<T> {
    capacity: usize,
    state: Mutex<BufferedState<T>>,
    sender: Condvar,
    receiver: Condvar,
}

impl<T> BufferedChannel<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffered channel needs a positive capacity");
        BufferedChannel {
            capacity,
            state: Mutex::new(BufferedState {
                open: true,
                buffer: VecDeque::with_capacity(capacity),
            }),
            sender: Condvar::new(),
            receiver: Condvar::new(),
        }
    }
}

impl<T: Send> Channel<T> for BufferedChannel<T> {
    fn send(&self, value: T) -> Result<(), ChannelError> {
        let mut st = lock_state(&self.state);
        if !st.open {
            return Err(ChannelError::SendOnClosed);
        }
        while st.buffer.len() >= self.capacity && st.open {
            st = wait_on(&self.sender, st);
        }
        if !st.open {
            return Err(ChannelError::SendOnClosed);
        }
        st.buffer.push_back(value);
        self.receiver.notify_one();
        Ok(())
    }

    fn receive(&self) -> Result<T, ChannelError> {
        let mut st = lock_state(&self.state);
        while st.buffer.is_empty() && st.open {
            st = wait_on(&self.receiver, st);
        }
        let Some(value) = st.buffer.pop_front() else {
            return Err(ChannelError::ReceiveOnClosed);
        };
        self.sender.notify_one();
        Ok(value)
    }

    fn close(&self) {
        let mut st = lock_state(&self.state);
        st.open = false;
        self.receiver.notify_all();
        self.sender.notify_all();
    }

    /// Closed only once the buffer has also drained.
    fn is_closed(&self) -> bool {
        let st = lock_state(&self.state);
        !st.open && st.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_buffered_fifo_order() {
        let chan = make_channel::<u32>(4);
        let producer = {
            let chan = chan.clone();
            thread::spawn(move || {
                for i in 0..100u32 {
                    chan.send(i).unwrap();
                }
                chan.close();
            })
        };
        let mut got = Vec::new();
        while let Ok(v) = chan.receive() {
            got.push(v);
        }
        producer.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_rendezvous_blocks_until_matched() {
        let chan = Arc::new(RendezvousChannel::<u8>::new());
        let delivered = Arc::new(AtomicBool::new(false));
        let sender = {
            let chan = chan.clone();
            let delivered = delivered.clone();
            thread::spawn(move || {
                chan.send(9).unwrap();
                delivered.store(true, Ordering::SeqCst);
            })
        };
        // No receiver yet: the send must still be parked.
        thread::sleep(Duration::from_millis(50));
        assert!(!delivered.load(Ordering::SeqCst));
        assert_eq!(chan.receive().unwrap(), 9);
        sender.join().unwrap();
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_receive_on_closed_empty_fails() {
        let chan = make_channel::<u8>(2);
        chan.close();
        assert_eq!(chan.receive(), Err(ChannelError::ReceiveOnClosed));
        assert_eq!(chan.send(1), Err(ChannelError::SendOnClosed));
    }

    #[test]
    fn test_close_drains_before_failing() {
        let chan = make_channel::<char>(8);
        for c in ['a', 'b', 'c'] {
            chan.send(c).unwrap();
        }
        chan.close();
        assert_eq!(chan.receive(), Ok('a'));
        assert_eq!(chan.receive(), Ok('b'));
        assert_eq!(chan.receive(), Ok('c'));
        assert_eq!(chan.receive(), Err(ChannelError::ReceiveOnClosed));
    }

    #[test]
    fn test_is_closed_waits_for_drain() {
        let chan = BufferedChannel::new(4);
        chan.send(1u8).unwrap();
        assert!(!chan.is_closed());
        chan.close();
        assert!(!chan.is_closed());
        chan.receive().unwrap();
        assert!(chan.is_closed());
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let chan = make_channel::<u8>(1);
        let consumer = {
            let chan = chan.clone();
            thread::spawn(move || chan.receive())
        };
        thread::sleep(Duration::from_millis(50));
        chan.close();
        assert_eq!(consumer.join().unwrap(), Err(ChannelError::ReceiveOnClosed));
    }

    #[test]
    fn test_close_wakes_blocked_rendezvous_sender() {
        let chan: Arc<dyn Channel<u8>> = Arc::new(RendezvousChannel::new());
        let producer = {
            let chan = chan.clone();
            thread::spawn(move || chan.send(1))
        };
        thread::sleep(Duration::from_millis(50));
        chan.close();
        assert_eq!(producer.join().unwrap(), Err(ChannelError::SendOnClosed));
    }

    #[test]
    fn test_bounded_send_blocks_at_capacity() {
        let chan = make_channel::<u32>(2);
        chan.send(1).unwrap();
        chan.send(2).unwrap();
        let blocked = {
            let chan = chan.clone();
            thread::spawn(move || {
                chan.send(3).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());
        assert_eq!(chan.receive(), Ok(1));
        blocked.join().unwrap();
        assert_eq!(chan.receive(), Ok(2));
        assert_eq!(chan.receive(), Ok(3));
    }
}
