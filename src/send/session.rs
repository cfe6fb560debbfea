//! Producer/consumer session.
//!
//! The traversal runs on a blocking thread and delivers whole output buffers
//! through a one-slot channel. It then waits for the consumer to ask for more
//! before touching the tree again, so at most one buffer is ever in flight and
//! the tree is never locked while the consumer is slow.

use crate::config::SendConfig;
use crate::error::{Result, SendError};
use crate::send::traversal::{begin_stream, check_sendable, SendStats, StreamSink, Traversal};
use crate::tree::SubvolumeTree;
use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Buffers in flight between producer and consumer.
pub const STREAM_CHANNEL_SIZE: usize = 1;

// =============================================================================
// Events
// =============================================================================

/// Message from the producer thread to the consumer.
#[derive(Debug)]
pub enum StreamEvent {
    /// A run of whole commands
    Data(Bytes),

    /// The end command has been delivered
    End(SendStats),

    /// The send stopped early
    Failed(SendError),
}

/// Producer side of the channel pair.
struct ChannelSink {
    ready: mpsc::Sender<StreamEvent>,
    drained: mpsc::Receiver<()>,
}

impl StreamSink for ChannelSink {
    fn deliver(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.ready
            .blocking_send(StreamEvent::Data(data))
            .map_err(|_| SendError::Aborted)?;
        self.drained.blocking_recv().ok_or(SendError::Aborted)
    }
}

// =============================================================================
// Session
// =============================================================================

/// Allows one send at a time.
#[derive(Debug, Default, Clone)]
pub struct SendSession {
    running: Arc<AtomicBool>,
}

/// Clears the running flag when the producer is done, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SendSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Validate the subvolume and start producing its stream.
    ///
    /// Must be called from within a Tokio runtime. Fails with `AlreadyRunning`
    /// while another stream from this session is still being produced.
    pub fn start<T>(&self, tree: Arc<T>, config: SendConfig) -> Result<SendStream>
    where
        T: SubvolumeTree + Send + Sync + 'static,
    {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SendError::Io(std::io::Error::other(e)))?;
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SendError::AlreadyRunning);
        }
        let guard = RunningGuard(self.running.clone());

        check_sendable(tree.as_ref(), &config)?;
        let encoder = begin_stream(tree.as_ref(), &config)?;

        let (ready_tx, ready_rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let (drained_tx, drained_rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let sink = ChannelSink {
            ready: ready_tx.clone(),
            drained: drained_rx,
        };

        info!(subvolume = %tree.info().name, high_water = config.high_water, "starting send");
        let producer = runtime.spawn_blocking(move || {
            let result = Traversal::new(tree.as_ref(), &config, encoder, sink).run();
            drop(guard);
            let event = match result {
                Ok(stats) => StreamEvent::End(stats),
                Err(e) => StreamEvent::Failed(e),
            };
            // Nobody is listening after a cancel.
            let _ = ready_tx.blocking_send(event);
        });

        Ok(SendStream {
            ready: ready_rx,
            drained: Some(drained_tx),
            current: Bytes::new(),
            pending_ack: false,
            stats: None,
            producer: Some(producer),
        })
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Consumer end of a running send.
pub struct SendStream {
    ready: mpsc::Receiver<StreamEvent>,
    drained: Option<mpsc::Sender<()>>,
    /// Unread part of the last buffer.
    current: Bytes,
    /// The producer is waiting for us to finish the last buffer.
    pending_ack: bool,
    stats: Option<SendStats>,
    producer: Option<JoinHandle<()>>,
}

impl SendStream {
    /// Final statistics, once the end of the stream has been reached.
    pub fn stats(&self) -> Option<&SendStats> {
        self.stats.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.stats.is_some()
    }

    async fn ack(&mut self) {
        if !std::mem::take(&mut self.pending_ack) {
            return;
        }
        if let Some(drained) = &self.drained {
            // A producer that already failed reports it through `ready`.
            let _ = drained.send(()).await;
        }
    }

    async fn join_producer(&mut self) {
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.await {
                debug!("producer task ended abnormally: {}", e);
            }
        }
    }

    /// Next buffer of stream bytes, or `None` after the end command.
    ///
    /// Asking for the next buffer releases the producer from the previous one.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.current.is_empty() {
            return Ok(Some(std::mem::take(&mut self.current)));
        }
        if self.stats.is_some() {
            return Ok(None);
        }
        self.ack().await;
        match self.ready.recv().await {
            Some(StreamEvent::Data(data)) => {
                self.pending_ack = true;
                Ok(Some(data))
            }
            Some(StreamEvent::End(stats)) => {
                self.join_producer().await;
                self.stats = Some(stats);
                Ok(None)
            }
            Some(StreamEvent::Failed(e)) => {
                self.join_producer().await;
                Err(e)
            }
            None => Err(SendError::Aborted),
        }
    }

    /// Copy up to `buf.len()` stream bytes. Returns 0 at the end of the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_empty() {
            match self.next_chunk().await? {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }

    /// Drain the whole stream into `writer`.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<SendStats> {
        while let Some(chunk) = self.next_chunk().await? {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        self.stats.clone().ok_or(SendError::Aborted)
    }

    /// Stop the producer and wait for it to release the tree.
    pub async fn cancel(mut self) {
        self.ready.close();
        self.drained = None;
        self.join_producer().await;
        debug!("send cancelled");
    }
}
