//! TCP sample sources: dialing remotes and accepting connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::config::{ParallelSampleHandler, PipelineConfig};
use crate::error::PipelineError;
use crate::event::{EventCallback, PipelineEvent};
use crate::marshal::Marshaller;
use crate::processor::Processor;
use crate::stream::SampleReader;
use crate::task::StopChan;

use super::{BaseSource, SampleSource};

/// Dials a list of remote endpoints in parallel and decodes the samples
/// each connection delivers.
///
/// Failed dials are retried after `retry_interval`. A finished or broken
/// connection is optionally re-dialed (`reconnect`); codec damage on one
/// connection is logged and does not stop the other remotes. The source
/// terminates when every remote loop has ended.
pub struct TcpSource {
    base: Arc<BaseSource>,
    remotes: Vec<String>,
    retry_interval: Duration,
    dial_timeout: Duration,
    reconnect: bool,
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
    event_callback: Option<EventCallback>,
}

impl TcpSource {
    /// Creates a source dialing the given remotes, configured from
    /// `config`.
    pub fn new(
        remotes: Vec<String>,
        marshaller: Arc<dyn Marshaller>,
        config: &PipelineConfig,
    ) -> Self {
        let name = match remotes.as_slice() {
            [single] => format!("tcp://{single}"),
            many => format!("tcp://[{} remotes]", many.len()),
        };
        Self {
            base: BaseSource::new(name),
            remotes,
            retry_interval: config.tcp_retry_interval,
            dial_timeout: config.tcp_dial_timeout,
            reconnect: config.tcp_reconnect,
            marshaller,
            handler: config.parallel.clone(),
            event_callback: None,
        }
    }

    /// Sets a callback receiving connect/disconnect events.
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    async fn remote_loop(
        remote: String,
        sink: Arc<dyn Processor>,
        marshaller: Arc<dyn Marshaller>,
        handler: ParallelSampleHandler,
        retry_interval: Duration,
        dial_timeout: Duration,
        reconnect: bool,
        cancel: StopChan,
        events: Option<EventCallback>,
    ) {
        let emit = |event: PipelineEvent| {
            if let Some(callback) = &events {
                callback(event);
            }
        };

        while !cancel.is_stopped() {
            let dialed = tokio::time::timeout(dial_timeout, TcpStream::connect(&remote)).await;
            let stream = match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    tracing::warn!(remote = %remote, error = %err, "dial failed, retrying");
                    if !sleep_or_cancel(retry_interval, &cancel).await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    tracing::warn!(remote = %remote, "dial timed out, retrying");
                    if !sleep_or_cancel(retry_interval, &cancel).await {
                        return;
                    }
                    continue;
                }
            };

            emit(PipelineEvent::SourceConnected {
                remote: remote.clone(),
            });
            let reader = SampleReader::new(marshaller.clone(), handler.clone());
            match reader.read_stream(stream, sink.clone(), cancel.clone()).await {
                Ok(count) => {
                    tracing::debug!(remote = %remote, samples = count, "connection finished");
                    emit(PipelineEvent::SourceDisconnected {
                        remote: remote.clone(),
                        reason: "end of stream".into(),
                    });
                }
                Err(err) => {
                    // Fatal for this connection only; other remotes keep
                    // flowing.
                    tracing::error!(remote = %remote, error = %err, "connection failed");
                    emit(PipelineEvent::SourceDisconnected {
                        remote: remote.clone(),
                        reason: err.to_string(),
                    });
                }
            }
            if !reconnect {
                return;
            }
        }
    }
}

/// Sleeps for `duration` unless the cancel channel fires first. Returns
/// `false` when cancelled.
async fn sleep_or_cancel(duration: Duration, cancel: &StopChan) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.wait() => false,
    }
}

#[async_trait]
impl SampleSource for TcpSource {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn set_sink(&self, sink: Arc<dyn Processor>) {
        self.base.set_sink(sink);
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let sink = self.base.sink()?;
        let mut loops = Vec::new();
        for remote in self.remotes.clone() {
            loops.push(Self::remote_loop(
                remote,
                sink.clone(),
                self.marshaller.clone(),
                self.handler.clone(),
                self.retry_interval,
                self.dial_timeout,
                self.reconnect,
                self.base.cancel_chan(),
                self.event_callback.clone(),
            ));
        }
        self.base.spawn_producer(async move {
            futures::future::join_all(loops).await;
            Ok(())
        });
        Ok(self.base.done())
    }

    fn stop(&self) {
        self.base.request_stop();
    }
}

/// Binds an endpoint and decodes samples from every inbound connection.
pub struct TcpListenerSource {
    base: Arc<BaseSource>,
    bind_addr: String,
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
}

impl TcpListenerSource {
    /// Creates a listening source on the given bind address.
    pub fn new(
        bind_addr: impl Into<String>,
        marshaller: Arc<dyn Marshaller>,
        config: &PipelineConfig,
    ) -> Self {
        let bind_addr = bind_addr.into();
        Self {
            base: BaseSource::new(format!("listen://{bind_addr}")),
            bind_addr,
            marshaller,
            handler: config.parallel.clone(),
        }
    }
}

#[async_trait]
impl SampleSource for TcpListenerSource {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn set_sink(&self, sink: Arc<dyn Processor>) {
        self.base.set_sink(sink);
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let sink = self.base.sink()?;
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|err| PipelineError::endpoint(self.name(), err))?;
        let marshaller = self.marshaller.clone();
        let handler = self.handler.clone();
        let cancel = self.base.cancel_chan();

        self.base.spawn_producer(async move {
            let mut connections: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!(peer = %peer, "reader connection accepted");
                                let sink = sink.clone();
                                let reader = SampleReader::new(marshaller.clone(), handler.clone());
                                let cancel = cancel.clone();
                                connections.spawn(async move {
                                    match reader.read_stream(stream, sink, cancel).await {
                                        Ok(count) => {
                                            tracing::debug!(peer = %peer, samples = count, "connection finished");
                                        }
                                        Err(err) => {
                                            // Per-connection failure; keep
                                            // serving the others.
                                            tracing::error!(peer = %peer, error = %err, "connection failed");
                                        }
                                    }
                                });
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "accept failed");
                            }
                        }
                    }
                    _ = cancel.wait() => break,
                }
            }
            while connections.join_next().await.is_some() {}
            Ok(())
        });
        Ok(self.base.done())
    }

    fn stop(&self) {
        self.base.request_stop();
    }
}
