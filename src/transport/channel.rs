//! One logical stream multiplexed onto a connection.
//!
//! A channel is identified by a 16-bit local id; the matching remote id is
//! learned during the announce/reply handshake. Closing is monotonic: a
//! closed channel never reopens and later arrivals for it are dropped.

use super::message::Message;
use crate::multiqueue::Subqueue;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Allocated on accept, not yet bound by an announce.
    Created,
    /// Announce sent, waiting for the reply.
    Connecting,
    /// Both ends have exchanged ids.
    Connected,
    /// Terminal.
    Closed,
}

pub(crate) struct ChanState {
    pub phase: Phase,
    pub remote: Option<u16>,
}

pub(crate) struct Channel {
    /// Our id for this stream.
    pub local: u16,
    /// Owning connection, by id (the bus owns the connection itself).
    pub conn: i32,
    state: Mutex<ChanState>,
    /// Wakes a creator blocked on the handshake reply.
    pending: Notify,
    /// Inbound queue; a subqueue of the owning group's multiqueue.
    pub(crate) queue: Subqueue<Message>,
}

impl Channel {
    pub(crate) fn new(local: u16, conn: i32, phase: Phase, queue: Subqueue<Message>) -> Self {
        Self {
            local,
            conn,
            state: Mutex::new(ChanState {
                phase,
                remote: None,
            }),
            pending: Notify::new(),
            queue,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub(crate) fn remote(&self) -> Option<u16> {
        self.lock().remote
    }

    /// Record the peer's id and move to Connected. Ignored after close.
    pub(crate) fn set_connected(&self, remote: u16) {
        {
            let mut st = self.lock();
            if st.phase == Phase::Closed {
                return;
            }
            st.remote = Some(remote);
            st.phase = Phase::Connected;
        }
        self.pending.notify_waiters();
    }

    pub(crate) fn set_connecting(&self) {
        let mut st = self.lock();
        if st.phase == Phase::Created {
            st.phase = Phase::Connecting;
        }
    }

    /// Monotonic close; returns true on the first transition and wakes any
    /// handshake waiter.
    pub(crate) fn close(&self) -> bool {
        let first = {
            let mut st = self.lock();
            if st.phase == Phase::Closed {
                false
            } else {
                st.phase = Phase::Closed;
                true
            }
        };
        if first {
            self.pending.notify_waiters();
        }
        first
    }

    /// Wait until the reply arrives (returning the remote id) or the
    /// channel dies while pending.
    pub(crate) async fn wait_connected(&self) -> Result<u16> {
        loop {
            let notified = self.pending.notified();
            {
                let st = self.lock();
                match st.phase {
                    Phase::Connected => {
                        return st
                            .remote
                            .ok_or_else(|| Error::protocol("connected channel without remote id"));
                    }
                    Phase::Closed => return Err(Error::Closed),
                    Phase::Created | Phase::Connecting => {}
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiqueue::{Multiqueue, Order};

    fn make_channel(phase: Phase) -> (Multiqueue<Message>, Channel) {
        let mq = Multiqueue::new(Order::Fair);
        let queue = mq.subqueue();
        (mq.clone(), Channel::new(5, 1, phase, queue))
    }

    #[tokio::test]
    async fn handshake_wakes_waiter() {
        let (_mq, chan) = make_channel(Phase::Connecting);
        let waiter = async { chan.wait_connected().await };
        let driver = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            chan.set_connected(7);
        };
        let (got, ()) = tokio::join!(waiter, driver);
        assert_eq!(got.unwrap(), 7);
        assert_eq!(chan.phase(), Phase::Connected);
    }

    #[tokio::test]
    async fn close_while_pending_fails_waiter() {
        let (_mq, chan) = make_channel(Phase::Connecting);
        let waiter = async { chan.wait_connected().await };
        let driver = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            chan.close();
        };
        let (got, ()) = tokio::join!(waiter, driver);
        assert!(matches!(got, Err(Error::Closed)));
    }

    #[test]
    fn close_is_monotonic() {
        let (_mq, chan) = make_channel(Phase::Connected);
        assert!(chan.close());
        assert!(!chan.close());
        // A close wins over a late reply.
        chan.set_connected(9);
        assert_eq!(chan.phase(), Phase::Closed);
    }
}
