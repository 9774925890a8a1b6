//! Event channel: bridges callback-driven producers to a pull-based consumer.
//!
//! The per-turn agent reports progress through callbacks; the caller of
//! `RunOrchestrator::send` reads a stream. Each attempt gets one channel:
//! producers `push` values and eventually `close` or `fail` it, and the single
//! consumer pulls values in production order.
//!
//! Terminal states are sticky: after `close` or `fail`, further
//! `push`/`close`/`fail` calls are no-ops, and the consumer observes the
//! terminal state exactly once (after draining buffered values).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Why a channel ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Failed(String),
}

enum Terminal {
    Closed,
    Failed(ChannelError),
}

struct State<T> {
    buffer: VecDeque<T>,
    terminal: Option<Terminal>,
    terminal_delivered: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        {
            let mut state = self.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(terminal);
        }
        self.notify.notify_one();
        true
    }
}

/// Create a new channel, returning the producer handle and the consumer.
pub fn event_channel<T>() -> (EventSender<T>, EventReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::new(),
            terminal: None,
            terminal_delivered: false,
        }),
        notify: Notify::new(),
    });
    (
        EventSender {
            shared: Arc::clone(&shared),
        },
        EventReceiver { shared },
    )
}

/// Producer side. Cheap to clone; every clone feeds the same consumer.
pub struct EventSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> EventSender<T> {
    /// Enqueue a value. Returns `false` (and drops the value) if the channel
    /// is already closed or failed.
    pub fn push(&self, value: T) -> bool {
        {
            let mut state = self.shared.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.buffer.push_back(value);
        }
        self.shared.notify.notify_one();
        true
    }

    /// End the channel gracefully. Returns `false` if it was already terminal.
    pub fn close(&self) -> bool {
        self.shared.terminate(Terminal::Closed)
    }

    /// End the channel abnormally. Returns `false` if it was already terminal.
    pub fn fail(&self, error: ChannelError) -> bool {
        self.shared.terminate(Terminal::Failed(error))
    }

    pub fn is_terminal(&self) -> bool {
        self.shared.lock().terminal.is_some()
    }
}

/// Consumer side. Pulling requires `&mut self`, so only one read can be
/// outstanding at a time.
pub struct EventReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> EventReceiver<T> {
    /// Wait for the next value.
    ///
    /// Yields `Some(Ok(value))` for each pushed value, then `Some(Err(_))`
    /// once if the channel failed, then `None` forever.
    pub async fn recv(&mut self) -> Option<Result<T, ChannelError>> {
        loop {
            let notified = {
                let mut state = self.shared.lock();
                if let Some(value) = state.buffer.pop_front() {
                    return Some(Ok(value));
                }
                if state.terminal.is_some() {
                    if state.terminal_delivered {
                        return None;
                    }
                    state.terminal_delivered = true;
                    return match &state.terminal {
                        Some(Terminal::Failed(err)) => Some(Err(err.clone())),
                        _ => None,
                    };
                }
                self.shared.notify.notified()
            };
            notified.await;
        }
    }
}

impl<T> Drop for EventReceiver<T> {
    fn drop(&mut self) {
        // Nobody is listening any more: stop buffering.
        let mut state = self.shared.lock();
        state.buffer.clear();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Closed);
        }
    }
}
