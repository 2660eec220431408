//! Background Workers
//!
//! Two threads per store:
//!
//! - **spool**: takes [`SpoolTask`]s off the queue and writes them to disk
//! - **expiry**: sweeps expired elements out of both tiers on a fixed tick
//!
//! Both select on a shared shutdown channel. Dropping its sender is the
//! stop signal; the spool worker then drains whatever is still queued.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};
use tracing::{debug, error, instrument};

use super::coordinator::StoreInner;
use super::StoreKey;
use crate::element::Element;
use crate::error::Result;

/// One element waiting to be written to the disk tier
pub(crate) struct SpoolTask<K> {
    pub key: K,
    pub element: Arc<Element<K>>,
    /// Heap bytes charged to the spool queue
    pub bytes: u64,
}

/// Handles to a store's running worker threads
pub(crate) struct Workers {
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Start the expiry worker, and the spool worker when `tasks` is given
    pub(crate) fn start<K: StoreKey>(
        inner: &Arc<StoreInner<K>>,
        tasks: Option<Receiver<SpoolTask<K>>>,
        expiry_interval: Duration,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let mut handles = Vec::with_capacity(2);

        if let Some(tasks) = tasks {
            let inner = Arc::clone(inner);
            let shutdown = shutdown_rx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("{}-spool", inner.name()))
                    .spawn(move || run_spool_worker(inner, tasks, shutdown))?,
            );
        }

        let worker_inner = Arc::clone(inner);
        handles.push(
            thread::Builder::new()
                .name(format!("{}-expiry", inner.name()))
                .spawn(move || run_expiry_worker(worker_inner, expiry_interval, shutdown_rx))?,
        );

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handles,
        })
    }

    /// Signal shutdown and wait for every worker to finish
    pub(crate) fn stop(mut self) {
        self.shutdown.take();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(worker = %name, "worker thread panicked");
            }
        }
    }
}

#[instrument(name = "spool_worker", skip_all, fields(store = %inner.name()))]
fn run_spool_worker<K: StoreKey>(
    inner: Arc<StoreInner<K>>,
    tasks: Receiver<SpoolTask<K>>,
    shutdown: Receiver<()>,
) {
    debug!("spool worker started");
    loop {
        select! {
            recv(tasks) -> task => match task {
                Ok(task) => inner.spool(task),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                let mut drained = 0usize;
                while let Ok(task) = tasks.try_recv() {
                    if inner.is_persistent() {
                        inner.spool(task);
                    } else {
                        inner.discard_spool(task);
                    }
                    drained += 1;
                }
                debug!(drained, "spool queue drained");
                break;
            }
        }
    }
    debug!("spool worker stopped");
}

#[instrument(name = "expiry_worker", skip_all, fields(store = %inner.name()))]
fn run_expiry_worker<K: StoreKey>(
    inner: Arc<StoreInner<K>>,
    interval: Duration,
    shutdown: Receiver<()>,
) {
    debug!(interval_secs = interval.as_secs(), "expiry worker started");
    let ticker = channel::tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                inner.expire_elements();
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("expiry worker stopped");
}
