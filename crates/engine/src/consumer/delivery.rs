//! Push delivery: a shared worker pool plus per-consumer dispatchers
//!
//! Every push subscription spawns one dispatcher task that pulls
//! deliverable messages off the consumer and hands each one to the
//! engine-wide worker pool over a bounded channel. The bound is the
//! backpressure seam: slow handlers stall their dispatcher, never the
//! append path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::types::Delivery;

use super::Consumer;

/// Messages handed to the pool per dispatcher pass
const DISPATCH_BATCH: usize = 16;

type DeliveryJob = BoxFuture<'static, ()>;

/// Application callback invoked for each pushed message
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Process one delivery; acking is the handler's responsibility
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) {
        self(delivery).await;
    }
}

/// Engine-wide pool of push-delivery workers
pub struct DeliveryPool {
    sender: parking_lot::Mutex<Option<flume::Sender<DeliveryJob>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryPool {
    pub(crate) fn new(size: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = flume::bounded::<DeliveryJob>(queue_depth);

        let workers = (0..size)
            .map(|worker_id| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    debug!(worker_id, "delivery worker started");
                    while let Ok(job) = receiver.recv_async().await {
                        job.await;
                    }
                    debug!(worker_id, "delivery worker stopped");
                })
            })
            .collect();

        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            workers: parking_lot::Mutex::new(workers),
        }
    }

    /// Queue a job, waiting when the pool is saturated
    async fn submit(&self, job: DeliveryJob) -> std::result::Result<(), ()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender.send_async(job).await.map_err(|_| ()),
            None => Err(()),
        }
    }

    /// Close the queue and wait for workers to drain what was accepted
    pub(crate) async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = %err, "delivery worker panicked");
            }
        }
    }
}

struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Handle to an active push subscription
///
/// Dropping the handle cancels the dispatcher without waiting; use
/// [`drain`](Self::drain) for a clean hand-off.
pub struct DeliveryHandle {
    consumer: Arc<Consumer>,
    /// Stops the dispatcher from collecting further deliveries
    cancel: CancellationToken,
    /// Additionally discards jobs queued but not yet started; only a
    /// hard stop fires this, so drain lets submitted handlers run
    discard: CancellationToken,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<InFlight>,
    closed: AtomicBool,
}

impl Consumer {
    /// Start pushing deliverable messages to `handler`
    ///
    /// Redelivery and ack semantics are identical to fetch; only the
    /// hand-off differs.
    pub fn consume<H: DeliveryHandler>(self: &Arc<Self>, handler: H) -> DeliveryHandle {
        let handler: Arc<dyn DeliveryHandler> = Arc::new(handler);
        let cancel = self.cancel.child_token();
        let discard = CancellationToken::new();
        let in_flight = Arc::new(InFlight {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        });

        self.active_handles.fetch_add(1, Ordering::SeqCst);
        let dispatcher = tokio::spawn(dispatch(
            self.clone(),
            handler,
            cancel.clone(),
            discard.clone(),
            in_flight.clone(),
        ));

        DeliveryHandle {
            consumer: self.clone(),
            cancel,
            discard,
            dispatcher: parking_lot::Mutex::new(Some(dispatcher)),
            in_flight,
            closed: AtomicBool::new(false),
        }
    }
}

async fn dispatch(
    consumer: Arc<Consumer>,
    handler: Arc<dyn DeliveryHandler>,
    cancel: CancellationToken,
    discard: CancellationToken,
    in_flight: Arc<InFlight>,
) {
    let Ok(stream) = consumer.stream() else {
        return;
    };
    let mut notified = stream.notified();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let deliveries = match consumer.collect(&stream, DISPATCH_BATCH).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                warn!(
                    consumer = %consumer.name(),
                    error = %err,
                    "push dispatch stopped"
                );
                return;
            }
        };

        for delivery in deliveries {
            in_flight.start();
            let handler = handler.clone();
            let job_discard = discard.clone();
            let job_in_flight = in_flight.clone();
            let job = async move {
                // A stopped handle discards queued work; the pending
                // entry stays in flight and redelivers after ack_wait.
                // Drain does not fire this, so submitted jobs still run.
                if !job_discard.is_cancelled() {
                    handler.handle(delivery).await;
                }
                job_in_flight.finish();
            }
            .boxed();

            if consumer.context.pool.submit(job).await.is_err() {
                in_flight.finish();
                return;
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            changed = notified.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            // Wake for ack_wait expiries even without new appends
            () = tokio::time::sleep(consumer.context.sweep_interval) => {}
        }
    }
}

impl DeliveryHandle {
    /// The consumer this handle delivers for
    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    /// Stop dispatching and wait for already-submitted handlers to run
    pub async fn drain(&self) {
        self.cancel.cancel();
        self.join_dispatcher().await;
        self.in_flight.wait().await;
        self.close();
    }

    /// Stop dispatching without waiting for in-flight handlers
    ///
    /// Jobs queued in the pool but not yet started are discarded;
    /// their pending entries stay outstanding and redeliver.
    pub async fn stop(&self) {
        self.discard.cancel();
        self.cancel.cancel();
        self.join_dispatcher().await;
        self.close();
    }

    async fn join_dispatcher(&self) {
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher
            && let Err(err) = dispatcher.await
        {
            error!(error = %err, "delivery dispatcher panicked");
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.consumer.active_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        self.discard.cancel();
        self.cancel.cancel();
        self.close();
    }
}
