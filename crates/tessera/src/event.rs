//! The session's event thread.
//!
//! Tracker and peer-manager state is only mutated from this thread. Other
//! threads post closures to it through a bounded channel, while code that
//! already runs on the event thread executes them inline, so a callback
//! that re-enters a torrent transition cannot deadlock on itself.
//!
//! Posting blocks when the channel is full, so these functions must not be
//! called from inside an async runtime.
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::Error;

/// How many tasks can wait for the event thread before posters block.
pub const EVENT_QUEUE_SIZE: usize = 1024;

type Task = Box<dyn FnOnce() + Send>;

enum EventMsg {
    Run(Task),
    Quit,
}

/// Cheap, clonable way to reach the event thread.
#[derive(Clone)]
pub struct EventHandle {
    tx: mpsc::Sender<EventMsg>,
    thread: ThreadId,
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle").field("thread", &self.thread).finish()
    }
}

impl EventHandle {
    pub fn is_event_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Run `f` on the event thread without waiting for it.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_event_thread() {
            f();
        } else if self.tx.blocking_send(EventMsg::Run(Box::new(f))).is_err() {
            warn!("the event thread is gone, dropping task");
        }
    }

    /// Run `f` on the event thread and wait for its result.
    pub fn call<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_event_thread() {
            return Ok(f());
        }
        let (tx, rx) = oneshot::channel();
        let task = move || {
            let _ = tx.send(f());
        };
        self.tx
            .blocking_send(EventMsg::Run(Box::new(task)))
            .map_err(|_| Error::EventThreadClosed)?;
        rx.blocking_recv().map_err(|_| Error::EventThreadClosed)
    }

    /// Wait until every task posted before this call has run.
    pub fn flush(&self) -> Result<(), Error> {
        self.call(|| ())
    }
}

#[derive(Debug)]
pub struct EventLoop {
    handle: EventHandle,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn spawn() -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let join = thread::Builder::new()
            .name("tessera-events".into())
            .spawn(move || run(rx))?;
        let handle = EventHandle { tx, thread: join.thread().id() };
        Ok(Self { handle, join: Mutex::new(Some(join)) })
    }

    pub fn handle(&self) -> &EventHandle {
        &self.handle
    }

    /// Let the queued tasks run, then stop the thread.
    pub fn shutdown(&self) {
        let Some(join) = self.join.lock().take() else { return };
        if self.handle.is_event_thread() {
            warn!("the event thread cannot join itself");
            return;
        }
        let _ = self.handle.tx.blocking_send(EventMsg::Quit);
        if join.join().is_err() {
            warn!("the event thread panicked");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[tracing::instrument(skip(rx), name = "event::run")]
fn run(mut rx: mpsc::Receiver<EventMsg>) {
    debug!("event thread started");
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            EventMsg::Run(task) => task(),
            EventMsg::Quit => break,
        }
    }
    debug!("event thread exiting");
}
