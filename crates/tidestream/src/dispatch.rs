//! Event dispatcher
//!
//! A bounded single-consumer task queue. Every handler runs on the
//! dispatcher task, which is what gives the pipeline its per-slot
//! ordering guarantee: producers serialise through the queue, and a full
//! queue back-pressures the replication reader.
//!
//! Handlers MUST NOT block on operations that themselves post to the
//! dispatcher; nested work from an already-serialised context goes
//! through [`Dispatcher::run`] instead.

use crate::error::{Result, StreamerError};
use crate::event::{ChangeEvent, MessageEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

/// Queue capacity; producers block when the consumer falls behind.
pub const DISPATCH_QUEUE_SIZE: usize = 1024;

/// Grace period for the consumer to drain on stop.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Events flowing through the dispatcher.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A resolved row change (stream or snapshot)
    Change(ChangeEvent),
    /// A decoded logical message
    Message(MessageEvent),
    /// A hypertable newly matched the include filter
    HypertableIncluded { hypertable_id: i32 },
    /// A hypertable was dropped; the mirror entry is removed by the
    /// handler after publication cleanup
    HypertableDropped { hypertable_id: i32 },
    /// A chunk was created for an included hypertable
    ChunkCreated { hypertable_id: i32, chunk_id: i32 },
    /// A chunk was dropped
    ChunkDropped { hypertable_id: i32, chunk_id: i32 },
    /// A hypertable's compression state flipped
    CompressionChanged {
        hypertable_id: i32,
        compressed: bool,
    },
}

/// Handler capability for row changes and logical messages.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn on_change(&self, event: &ChangeEvent) -> Result<()>;

    async fn on_message(&self, event: &MessageEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }
}

/// Handler capability for catalog lifecycle transitions.
#[async_trait]
pub trait CatalogHandler: Send + Sync {
    async fn on_hypertable_included(&self, hypertable_id: i32) -> Result<()> {
        let _ = hypertable_id;
        Ok(())
    }

    async fn on_hypertable_dropped(&self, hypertable_id: i32) -> Result<()> {
        let _ = hypertable_id;
        Ok(())
    }

    async fn on_chunk_created(&self, hypertable_id: i32, chunk_id: i32) -> Result<()> {
        let _ = (hypertable_id, chunk_id);
        Ok(())
    }

    async fn on_chunk_dropped(&self, hypertable_id: i32, chunk_id: i32) -> Result<()> {
        let _ = (hypertable_id, chunk_id);
        Ok(())
    }

    async fn on_compression_changed(&self, hypertable_id: i32, compressed: bool) -> Result<()> {
        let _ = (hypertable_id, compressed);
        Ok(())
    }
}

#[derive(Default)]
struct HandlerRegistry {
    record_handlers: Vec<Arc<dyn RecordHandler>>,
    catalog_handlers: Vec<Arc<dyn CatalogHandler>>,
}

impl HandlerRegistry {
    async fn dispatch(&self, event: &StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Change(change) => {
                for handler in &self.record_handlers {
                    handler.on_change(change).await?;
                }
            }
            StreamEvent::Message(message) => {
                for handler in &self.record_handlers {
                    handler.on_message(message).await?;
                }
            }
            StreamEvent::HypertableIncluded { hypertable_id } => {
                for handler in &self.catalog_handlers {
                    handler.on_hypertable_included(*hypertable_id).await?;
                }
            }
            StreamEvent::HypertableDropped { hypertable_id } => {
                for handler in &self.catalog_handlers {
                    handler.on_hypertable_dropped(*hypertable_id).await?;
                }
            }
            StreamEvent::ChunkCreated {
                hypertable_id,
                chunk_id,
            } => {
                for handler in &self.catalog_handlers {
                    handler.on_chunk_created(*hypertable_id, *chunk_id).await?;
                }
            }
            StreamEvent::ChunkDropped {
                hypertable_id,
                chunk_id,
            } => {
                for handler in &self.catalog_handlers {
                    handler.on_chunk_dropped(*hypertable_id, *chunk_id).await?;
                }
            }
            StreamEvent::CompressionChanged {
                hypertable_id,
                compressed,
            } => {
                for handler in &self.catalog_handlers {
                    handler
                        .on_compression_changed(*hypertable_id, *compressed)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

struct Job {
    event: StreamEvent,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// The dispatcher.
pub struct Dispatcher {
    handlers: Arc<RwLock<HandlerRegistry>>,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    rx: Mutex<Option<mpsc::Receiver<Job>>>,
    consumer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_SIZE);
        Self {
            handlers: Arc::new(RwLock::new(HandlerRegistry::default())),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            consumer: Mutex::new(None),
        }
    }

    pub async fn register_record_handler(&self, handler: Arc<dyn RecordHandler>) {
        self.handlers.write().await.record_handlers.push(handler);
    }

    pub async fn register_catalog_handler(&self, handler: Arc<dyn CatalogHandler>) {
        self.handlers.write().await.catalog_handlers.push(handler);
    }

    /// Start the consumer task.
    pub fn start(&self) {
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => return, // already started
        };
        let handlers = self.handlers.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = handlers.read().await.dispatch(&job.event).await;
                if let Err(err) = &result {
                    warn!("dispatch failed: {err}");
                }
                if let Some(done) = job.done {
                    // the submitter may have given up waiting
                    let _ = done.send(result);
                }
            }
            debug!("dispatcher drained");
        });

        *self.consumer.lock() = Some(handle);
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        self.tx
            .lock()
            .clone()
            .ok_or(StreamerError::DispatcherClosed)
    }

    /// Fire-and-forget submission. Blocks when the queue is full.
    pub async fn enqueue(&self, event: StreamEvent) -> Result<()> {
        self.sender()?
            .send(Job { event, done: None })
            .await
            .map_err(|_| StreamerError::DispatcherClosed)
    }

    /// Submission that completes when the handler returns, propagating
    /// the handler's result. This is what change emission uses, so events
    /// cannot reorder across producers.
    pub async fn enqueue_and_wait(&self, event: StreamEvent) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.sender()?
            .send(Job {
                event,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| StreamerError::DispatcherClosed)?;
        done_rx.await.map_err(|_| StreamerError::DispatcherClosed)?
    }

    /// Run the handlers inline on the caller, bypassing the queue. Only
    /// valid from an already-serialised context (i.e. inside a handler).
    pub async fn run(&self, event: StreamEvent) -> Result<()> {
        self.handlers.read().await.dispatch(&event).await
    }

    /// Drain pending tasks, then close. Further submissions fail with
    /// [`StreamerError::DispatcherClosed`]. Idempotent.
    pub async fn stop(&self) {
        drop(self.tx.lock().take());

        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("dispatcher did not drain within {STOP_GRACE:?}, abandoning queue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Op, SourceInfo};
    use crate::pgtypes::Lsn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn change(seq: u32) -> StreamEvent {
        StreamEvent::Change(ChangeEvent {
            relation_schema: "public".into(),
            relation_table: "metrics".into(),
            op: Op::Create,
            before: None,
            after: None,
            source: SourceInfo {
                system: "sys".into(),
                database: "db".into(),
                schema: "public".into(),
                table: "metrics".into(),
                ts_ms: 0,
                lsn: Lsn(seq as u64),
                tx_id: Some(seq),
                slot: "slot".into(),
                snapshot: false,
            },
            transaction: None,
        })
    }

    struct Collector {
        seen: Mutex<Vec<u64>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecordHandler for Collector {
        async fn on_change(&self, event: &ChangeEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(event.source.lsn.0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submission_order_preserved() {
        let dispatcher = Dispatcher::new();
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        dispatcher.register_record_handler(collector.clone()).await;
        dispatcher.start();

        for i in 0..100u32 {
            dispatcher.enqueue(change(i)).await.unwrap();
        }
        dispatcher.stop().await;

        let seen = collector.seen.lock().clone();
        assert_eq!(seen, (0..100u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_enqueue_and_wait_completes_after_handler() {
        let dispatcher = Dispatcher::new();
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        dispatcher.register_record_handler(collector.clone()).await;
        dispatcher.start();

        dispatcher.enqueue_and_wait(change(1)).await.unwrap();
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_and_wait_propagates_handler_error() {
        struct Failing;

        #[async_trait]
        impl RecordHandler for Failing {
            async fn on_change(&self, _event: &ChangeEvent) -> Result<()> {
                Err(StreamerError::sink("permanent failure"))
            }
        }

        let dispatcher = Dispatcher::new();
        dispatcher.register_record_handler(Arc::new(Failing)).await;
        dispatcher.start();

        let err = dispatcher.enqueue_and_wait(change(1)).await.unwrap_err();
        assert!(matches!(err, StreamerError::Sink(_)));

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_then_rejects() {
        let dispatcher = Dispatcher::new();
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        dispatcher.register_record_handler(collector.clone()).await;
        dispatcher.start();

        for i in 0..10u32 {
            dispatcher.enqueue(change(i)).await.unwrap();
        }
        dispatcher.stop().await;

        // everything queued before stop was delivered
        assert_eq!(collector.calls.load(Ordering::SeqCst), 10);

        // post-stop submissions fail
        let err = dispatcher.enqueue(change(11)).await.unwrap_err();
        assert!(matches!(err, StreamerError::DispatcherClosed));
        let err = dispatcher.enqueue_and_wait(change(12)).await.unwrap_err();
        assert!(matches!(err, StreamerError::DispatcherClosed));
    }

    #[tokio::test]
    async fn test_run_bypasses_queue() {
        let dispatcher = Dispatcher::new();
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        dispatcher.register_record_handler(collector.clone()).await;
        // never started; run still dispatches inline
        dispatcher.run(change(5)).await.unwrap();
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_catalog_handler_capability() {
        struct Catalog {
            included: AtomicUsize,
        }

        #[async_trait]
        impl CatalogHandler for Catalog {
            async fn on_hypertable_included(&self, _hypertable_id: i32) -> Result<()> {
                self.included.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dispatcher = Dispatcher::new();
        let catalog = Arc::new(Catalog {
            included: AtomicUsize::new(0),
        });
        dispatcher.register_catalog_handler(catalog.clone()).await;
        dispatcher.start();

        dispatcher
            .enqueue_and_wait(StreamEvent::HypertableIncluded { hypertable_id: 3 })
            .await
            .unwrap();
        assert_eq!(catalog.included.load(Ordering::SeqCst), 1);

        dispatcher.stop().await;
    }
}
