//! Progress reporting and cancellation for page loops.
//!
//! The flasher reports progress synchronously through a callback. To keep a
//! slow consumer (a terminal redraw, a GUI event queue) from stalling page
//! transfers, wrap the consumer in a [`ProgressForwarder`]: events are queued
//! on a channel and delivered in order on a dedicated thread.

use {
    log::debug,
    std::{
        fmt,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
            mpsc::{self, Sender},
        },
        thread::{self, JoinHandle},
    },
};

/// Which page loop an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Reading flash.
    Read,
    /// Programming flash.
    Write,
    /// Reading back programmed pages.
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "Reading",
            Self::Write => "Writing",
            Self::Verify => "Verifying",
        })
    }
}

/// One progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A loop starts; progress is at zero of `total` pages.
    Begin {
        /// Loop.
        phase: Phase,
        /// Pages in the loop.
        total: usize,
    },
    /// Page `current` (1-based) of `total` completed.
    Advance {
        /// Loop.
        phase: Phase,
        /// Pages done.
        current: usize,
        /// Pages in the loop.
        total: usize,
    },
    /// The loop aborted; progress returns to zero.
    Reset {
        /// Loop.
        phase: Phase,
    },
}

impl ProgressEvent {
    /// Loop the event belongs to.
    pub fn phase(&self) -> Phase {
        match *self {
            Self::Begin { phase, .. } | Self::Advance { phase, .. } | Self::Reset { phase } => {
                phase
            },
        }
    }
}

/// Callback receiving progress events.
pub type ProgressFn<'a> = dyn FnMut(ProgressEvent) + 'a;

/// Shared flag asking a page loop to stop at the next page boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Delivers progress events to a sink on its own thread.
///
/// Events arrive in the order they were sent. Dropping the forwarder waits
/// for every queued event to be delivered.
pub struct ProgressForwarder {
    tx: Option<Sender<ProgressEvent>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressForwarder {
    /// Start the delivery thread.
    pub fn spawn<F>(mut sink: F) -> std::io::Result<Self>
    where
        F: FnMut(ProgressEvent) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        let handle = thread::Builder::new()
            .name("pageboot-progress".into())
            .spawn(move || {
                for event in rx {
                    sink(event);
                }
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue an event. Never blocks.
    pub fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("Progress sink has stopped; dropping {event:?}");
            }
        }
    }

    /// Callback for the flasher that queues every event.
    pub fn callback(&self) -> impl FnMut(ProgressEvent) + '_ {
        move |event| self.send(event)
    }

    /// Deliver everything queued and stop the thread.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Progress sink panicked");
            }
        }
    }
}

impl Drop for ProgressForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_forwarder_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let forwarder = ProgressForwarder::spawn(move |event| {
            // Slow sink must not reorder anything.
            thread::sleep(Duration::from_millis(1));
            sink_seen.lock().unwrap().push(event);
        })
        .unwrap();

        forwarder.send(ProgressEvent::Begin {
            phase: Phase::Write,
            total: 20,
        });
        for current in 1..=20 {
            forwarder.send(ProgressEvent::Advance {
                phase: Phase::Write,
                current,
                total: 20,
            });
        }
        forwarder.finish();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 21);
        assert_eq!(
            seen[0],
            ProgressEvent::Begin {
                phase: Phase::Write,
                total: 20
            }
        );
        for (i, event) in seen.iter().skip(1).enumerate() {
            assert!(matches!(event, ProgressEvent::Advance { current, .. } if *current == i + 1));
        }
    }

    #[test]
    fn test_callback_feeds_forwarder() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let forwarder =
            ProgressForwarder::spawn(move |event| sink_seen.lock().unwrap().push(event)).unwrap();
        {
            let mut callback = forwarder.callback();
            callback(ProgressEvent::Reset { phase: Phase::Read });
        }
        drop(forwarder);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProgressEvent::Reset { phase: Phase::Read }]
        );
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Verify.to_string(), "Verifying");
        assert_eq!(
            ProgressEvent::Advance {
                phase: Phase::Read,
                current: 1,
                total: 2
            }
            .phase(),
            Phase::Read
        );
    }
}
