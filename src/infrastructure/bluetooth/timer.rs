//! One-shot timers that report expiry through the link's event channel.
//!
//! Each arm gets a fresh [`TimerToken`]. Cancelling aborts the sleeping task and
//! retires the token, so an expiry that was already queued when the timer was
//! cancelled is recognised as stale by [`LinkTimer::fire`] and dropped.

use super::transport::{LinkEvent, LinkEventSender};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Outstanding write acknowledgement
    Response,
    /// Delay before a reconnection attempt
    Backoff,
}

impl TimerKind {
    fn event(self, token: TimerToken) -> LinkEvent {
        match self {
            Self::Response => LinkEvent::ResponseTimeout(token),
            Self::Backoff => LinkEvent::ReconnectDue(token),
        }
    }
}

pub struct LinkTimer {
    kind: TimerKind,
    window: Duration,
    sender: LinkEventSender,
    generation: u64,
    armed: Option<(TimerToken, Option<JoinHandle<()>>)>,
}

impl LinkTimer {
    pub fn new(kind: TimerKind, window: Duration, sender: LinkEventSender) -> Self {
        Self {
            kind,
            window,
            sender,
            generation: 0,
            armed: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Start the timer, replacing any armed one.
    pub fn arm(&mut self) -> TimerToken {
        self.cancel();
        self.generation += 1;
        let token = TimerToken(self.generation);

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let sender = self.sender.clone();
                let event = self.kind.event(token);
                let window = self.window;
                Some(runtime.spawn(async move {
                    tokio::time::sleep(window).await;
                    let _ = sender.send(event);
                }))
            }
            Err(_) => {
                warn!("{:?} timer armed outside a tokio runtime; it will not fire", self.kind);
                None
            }
        };

        trace!("{:?} timer armed ({:?}, {:?})", self.kind, token, self.window);
        self.armed = Some((token, handle));
        token
    }

    /// Cancel the armed timer. Returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some((token, handle)) => {
                if let Some(handle) = handle {
                    handle.abort();
                }
                // Retire the token even if its expiry is already queued
                self.generation += 1;
                trace!("{:?} timer cancelled ({:?})", self.kind, token);
                true
            }
            None => false,
        }
    }

    /// Accept an expiry event. Only the token of the currently armed timer counts;
    /// anything else is stale and returns `false`.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        match self.armed {
            Some((armed, _)) if armed == token => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for LinkTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
