//! Async-block coordination for a single render.
//!
//! A render is complete when every async block it spawned has finished.
//! [`AsyncState`] is the handle threaded through compiled code: spawning a
//! block increments a counter, block completion decrements it, and the
//! counter reaching zero closes the task channel so the driver's
//! `for_each_concurrent` drains and returns.
//!
//! All futures are `!Send` and run interleaved on the driver; there are no
//! OS threads here.

use futures::channel::mpsc;
use futures::future::{FutureExt, LocalBoxFuture};
use futures::StreamExt;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// AsyncState
// ---------------------------------------------------------------------------

/// Spawn counter and task injector for one render.
pub struct AsyncState {
    active: Cell<usize>,
    completed: Cell<usize>,
    tx: RefCell<Option<mpsc::UnboundedSender<LocalBoxFuture<'static, ()>>>>,
}

impl AsyncState {
    /// Create a state together with the task receiver the driver drains.
    pub fn new() -> (Rc<Self>, TaskQueue) {
        let (tx, rx) = mpsc::unbounded();
        (
            Rc::new(Self {
                active: Cell::new(0),
                completed: Cell::new(0),
                tx: RefCell::new(Some(tx)),
            }),
            TaskQueue { rx },
        )
    }

    /// Spawn an async block.  The block runs concurrently with everything
    /// else on the driver; its completion is what eventually lets the
    /// render finish.
    ///
    /// Spawning after the render has completed is a no-op — the block's
    /// effects would have nowhere to land.
    pub fn spawn(self: &Rc<Self>, fut: impl Future<Output = ()> + 'static) {
        let tx = self.tx.borrow();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        self.active.set(self.active.get() + 1);
        let this = Rc::clone(self);
        let wrapped = async move {
            fut.await;
            this.finish_one();
        }
        .boxed_local();
        let _ = tx.unbounded_send(wrapped);
    }

    /// Number of blocks currently in flight.
    pub fn active(&self) -> usize {
        self.active.get()
    }

    /// Number of blocks that have completed since the render started.
    pub fn completed(&self) -> usize {
        self.completed.get()
    }

    fn finish_one(&self) {
        self.active.set(self.active.get() - 1);
        self.completed.set(self.completed.get() + 1);
        if self.active.get() == 0 {
            // Last block out closes the channel; the driver drains and the
            // render moves on to buffer flattening.
            self.tx.borrow_mut().take();
        }
    }
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// The receive side of the task channel.  [`TaskQueue::drive`] runs every
/// spawned block to completion, with unlimited interleaving, and returns
/// once the paired [`AsyncState`] counter has hit zero.
pub struct TaskQueue {
    rx: mpsc::UnboundedReceiver<LocalBoxFuture<'static, ()>>,
}

impl TaskQueue {
    pub async fn drive(self) {
        self.rx.for_each_concurrent(None, |task| task).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
