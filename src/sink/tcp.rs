//! TCP sample sinks: dialing a remote and serving inbound readers.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{ParallelSampleHandler, PipelineConfig};
use crate::error::PipelineError;
use crate::event::{EventCallback, PipelineEvent};
use crate::marshal::Marshaller;
use crate::processor::{BaseProcessor, Processor};
use crate::sample::{HeaderRef, Sample};
use crate::stream::SampleWriter;
use crate::task::StopChan;

use super::OutputSlot;

/// Dials a remote endpoint and writes marshalled samples to it.
pub struct TcpSink {
    base: BaseProcessor,
    remote: String,
    dial_timeout: std::time::Duration,
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
    output: OutputSlot,
}

impl TcpSink {
    /// Creates a sink dialing the given remote, configured from `config`.
    pub fn new(
        remote: impl Into<String>,
        marshaller: Arc<dyn Marshaller>,
        config: &PipelineConfig,
    ) -> Self {
        let remote = remote.into();
        Self {
            base: BaseProcessor::new(format!("tcp://{remote}")),
            remote,
            dial_timeout: config.tcp_dial_timeout,
            marshaller,
            handler: config.parallel.clone(),
            output: OutputSlot::new(),
        }
    }
}

#[async_trait]
impl Processor for TcpSink {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.remote))
            .await
            .map_err(|_| PipelineError::endpoint(self.name(), "dial timed out"))?
            .map_err(|err| PipelineError::endpoint(self.name(), err))?;
        let writer = SampleWriter::new(self.marshaller.clone(), self.handler.clone());
        self.output.install(writer.open(stream)).await;
        Ok(self.base.stop_chan())
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        self.output.write(&sample, &header, &self.name()).await?;
        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        if let Err(err) = self.output.close().await {
            self.base.error(err);
        }
        self.base.close_sink().await;
    }
}

/// A reader connection of a [`TcpListenerSink`].
struct ConnHandle {
    peer: String,
    tx: mpsc::Sender<Arc<Vec<u8>>>,
}

/// Binds an endpoint, accepts any number of reader connections and
/// multiplexes the sample stream to all of them.
///
/// Every reader gets a bounded buffer of marshalled frames. A reader whose
/// buffer overflows is disconnected (drop-slow): one stalled consumer must
/// not block the pipeline or the fast readers.
pub struct TcpListenerSink {
    base: BaseProcessor,
    bind_addr: String,
    buffered_samples: usize,
    marshaller: Arc<dyn Marshaller>,
    conns: Arc<parking_lot::Mutex<Vec<ConnHandle>>>,
    // Shared with the accept loop so late joiners get the header in force.
    current_header: Arc<parking_lot::Mutex<Option<HeaderRef>>>,
    accept_cancel: StopChan,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    event_callback: Option<EventCallback>,
}

impl TcpListenerSink {
    /// Creates a listening sink on the given bind address, configured from
    /// `config`.
    pub fn new(
        bind_addr: impl Into<String>,
        marshaller: Arc<dyn Marshaller>,
        config: &PipelineConfig,
    ) -> Self {
        let bind_addr = bind_addr.into();
        Self {
            base: BaseProcessor::new(format!("listen://{bind_addr}")),
            bind_addr,
            buffered_samples: config.listener_buffer,
            marshaller,
            conns: Arc::new(parking_lot::Mutex::new(Vec::new())),
            current_header: Arc::new(parking_lot::Mutex::new(None)),
            accept_cancel: StopChan::new(),
            accept_task: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            event_callback: None,
        }
    }

    /// Overrides the per-connection buffer size.
    pub fn with_buffered_samples(mut self, buffered_samples: usize) -> Self {
        self.buffered_samples = buffered_samples.max(1);
        self
    }

    /// Sets a callback receiving drop-slow disconnect events.
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// The actually bound address, available after `start`. Useful when
    /// binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Queues one marshalled frame to every connection, disconnecting
    /// readers whose buffer is full.
    fn broadcast(&self, bytes: Arc<Vec<u8>>) {
        let mut conns = self.conns.lock();
        conns.retain(|conn| match conn.tx.try_send(bytes.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer = %conn.peer, "disconnecting slow reader");
                if let Some(callback) = &self.event_callback {
                    callback(PipelineEvent::SlowReaderDisconnected {
                        peer: conn.peer.clone(),
                        buffered: self.buffered_samples,
                    });
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait]
impl Processor for TcpListenerSink {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|err| PipelineError::endpoint(self.name(), err))?;
        *self.local_addr.lock() = listener.local_addr().ok();

        let conns = self.conns.clone();
        let marshaller = self.marshaller.clone();
        let buffered = self.buffered_samples;
        let cancel = self.accept_cancel.clone();
        let shared_header = self.current_header.clone();

        let handle = tokio::spawn(async move {
            let mut writers: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                tracing::warn!(error = %err, "accept failed");
                                continue;
                            }
                        };
                        tracing::debug!(peer = %peer, "reader connected");
                        let (tx, mut rx) = mpsc::channel::<Arc<Vec<u8>>>(buffered);

                        // Late joiners first get the header in force.
                        if let Some(header) = shared_header.lock().clone() {
                            let mut bytes = Vec::new();
                            if marshaller.write_header(&header, &mut bytes).is_ok() {
                                let _ = tx.try_send(Arc::new(bytes));
                            }
                        }
                        conns.lock().push(ConnHandle {
                            peer: peer.to_string(),
                            tx,
                        });

                        writers.spawn(async move {
                            let mut stream = stream;
                            while let Some(bytes) = rx.recv().await {
                                if let Err(err) = stream.write_all(&bytes).await {
                                    tracing::debug!(peer = %peer, error = %err, "reader write failed");
                                    break;
                                }
                            }
                            let _ = stream.shutdown().await;
                        });
                    }
                    _ = cancel.wait() => break,
                }
            }
            while writers.join_next().await.is_some() {}
        });
        *self.accept_task.lock() = Some(handle);
        Ok(self.base.stop_chan())
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        // Announce header changes to all connected readers.
        let header_changed = {
            let mut current = self.current_header.lock();
            let changed = current
                .as_ref()
                .map_or(true, |h| h.as_ref() != header.as_ref());
            if changed {
                *current = Some(header.clone());
            }
            changed
        };
        if header_changed {
            let mut bytes = Vec::new();
            self.marshaller.write_header(&header, &mut bytes)?;
            self.broadcast(Arc::new(bytes));
        }

        let mut bytes = Vec::new();
        self.marshaller.write_sample(&sample, &header, &mut bytes)?;
        self.broadcast(Arc::new(bytes));

        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        self.accept_cancel.stop();
        // Dropping the senders lets each writer drain its buffer and hang
        // up; the accept task waits for them.
        self.conns.lock().clear();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.base.close_sink().await;
    }
}
