//! Module `thread` implement a shut-down friendly daemon thread.
//!
//! A [Thread] owns a worker and the sending half of its message
//! channel. The worker's main loop reads the receiving half; when the
//! last sender is gone the channel reports disconnection, which is the
//! loop's signal to wind down. Dropping the [Thread] therefore drops the
//! sender first and then joins the worker, so no loop is ever left
//! dangling.

use std::{sync::mpsc, thread};

use crate::{Error, Result};

/// Handle to a daemon thread fed by a message channel of `Q` values,
/// returning `T` when its loop winds down.
pub struct Thread<Q, T = ()> {
    name: String,
    tx: Option<mpsc::Sender<Q>>,
    handle: Option<thread::JoinHandle<T>>,
}

impl<Q, T> Thread<Q, T> {
    /// Spawn `main_loop` over the receiving half of a fresh channel.
    /// `main_loop` is called with the receiver and returns the closure
    /// that shall run on the new thread.
    pub fn new<F, N>(name: &str, main_loop: F) -> Thread<Q, T>
    where
        F: 'static + Send + FnOnce(mpsc::Receiver<Q>) -> N,
        N: 'static + Send + FnOnce() -> T,
        T: 'static + Send,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(main_loop(rx));

        Thread {
            name: name.to_string(),
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Post a message to the loop, without waiting on it.
    pub fn post(&self, msg: Q) -> Result<()> {
        match &self.tx {
            Some(tx) => err_at!(IPCFail, tx.send(msg), "thread {}", self.name),
            None => err_at!(IPCFail, msg: "thread {} is down", self.name),
        }
    }

    /// Disconnect the channel and wait for the loop to wind down.
    pub fn close_wait(mut self) -> Result<T> {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(val) => Ok(val),
                Err(err) => err_at!(ThreadFail, msg: "thread {} panicked {:?}", self.name, err),
            },
            None => err_at!(ThreadFail, msg: "thread {} already joined", self.name),
        }
    }
}

impl<Q, T> Drop for Thread<Q, T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

#[cfg(test)]
#[path = "thread_test.rs"]
mod thread_test;
