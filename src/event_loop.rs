// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Background Event Loop
//!
//! One [`EventLoop`] owns one dedicated background thread running a
//! current-thread runtime. Submitted pipelines execute strictly in
//! submission order and never concurrently with each other, so everything
//! scheduled against one connection runs on one thread.
//!
//! Stopping the loop is an explicit action, separate from closing a
//! connection, and ordered after it: [`EventLoop::stop`] first lets every
//! already-submitted pipeline finish, then joins the thread. A pipeline that
//! closes a connection therefore always completes its close before the loop
//! goes away.

use crate::errors::AmqpError;
use std::{
    future::Future,
    pin::Pin,
    sync::mpsc::{channel as std_channel, Receiver},
    thread,
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, error, warn};

type Pipeline = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to a background event-loop thread.
pub struct EventLoop {
    tasks: Option<UnboundedSender<Pipeline>>,
    done: Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Starts the background thread and its runtime.
    pub fn start(name: &str) -> Result<EventLoop, AmqpError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to build loop runtime");
                AmqpError::InternalError
            })?;

        let (task_tx, mut task_rx) = unbounded_channel::<Pipeline>();
        let (done_tx, done_rx) = std_channel();

        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(pipeline) = task_rx.recv().await {
                        pipeline.await;
                    }
                });
                let _ = done_tx.send(());
            })
            .map_err(|err| {
                error!(error = err.to_string(), "failure to spawn loop thread");
                AmqpError::InternalError
            })?;

        debug!(name, "event loop started");

        Ok(EventLoop {
            tasks: Some(task_tx),
            done: done_rx,
            thread: Some(thread),
        })
    }

    /// Queues a pipeline for execution on the loop thread.
    ///
    /// Pipelines run in submission order; this call never blocks on them.
    pub fn submit<F>(&self, pipeline: F) -> Result<(), AmqpError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = self.tasks.as_ref().ok_or(AmqpError::InternalError)?;
        tasks
            .send(Box::pin(pipeline))
            .map_err(|_| AmqpError::InternalError)
    }

    /// Stops the loop: drains every submitted pipeline, then joins the
    /// thread, waiting at most `timeout` for the drain.
    pub fn stop(mut self, timeout: Duration) -> Result<(), AmqpError> {
        self.tasks.take();

        match self.done.recv_timeout(timeout) {
            Ok(()) => {
                if let Some(thread) = self.thread.take() {
                    thread.join().map_err(|_| AmqpError::InternalError)?;
                }
                debug!("event loop stopped");
                Ok(())
            }
            Err(err) => {
                warn!(error = err.to_string(), "event loop did not drain in time");
                // Detach instead of joining again in Drop; the thread keeps
                // draining in the background.
                self.thread.take();
                Err(AmqpError::InternalError)
            }
        }
    }
}

impl Drop for EventLoop {
    /// Dropping without [`EventLoop::stop`] still drains and joins, but
    /// without a bound on the wait; prefer the explicit stop.
    fn drop(&mut self) {
        self.tasks.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn pipelines_run_in_submission_order_before_stop_returns() {
        let event_loop = EventLoop::start("loop-test").unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for index in 0..3 {
            let order = order.clone();
            event_loop
                .submit(async move {
                    order.lock().unwrap().push(index);
                })
                .unwrap();
        }

        event_loop.stop(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn stop_waits_for_pending_pipelines() {
        let event_loop = EventLoop::start("loop-drain").unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        let counter = finished.clone();
        event_loop
            .submit(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        event_loop.stop(Duration::from_secs(5)).unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
