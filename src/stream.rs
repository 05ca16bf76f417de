//! Parallel sample streams: ordered pipelines of marshal/unmarshal workers.
//!
//! Parsing and formatting samples is the expensive step of wire I/O. Both
//! directions spread that step across worker tasks while keeping the wire
//! order intact:
//!
//! - a single producer extracts frames (or accepts samples) and enqueues
//!   jobs, remembering submission order as a queue of one-shot results
//! - workers complete jobs in whatever order they finish
//! - a single consumer resolves the one-shot queue in FIFO order, so
//!   samples leave the stream exactly as they entered it
//!
//! Errors are sticky: the first failure tears the stream down, and every
//! later interaction reports it.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ParallelSampleHandler;
use crate::error::{MarshalError, PipelineError};
use crate::marshal::Marshaller;
use crate::processor::Processor;
use crate::sample::{HeaderRef, Sample};
use crate::task::StopChan;

const READ_CHUNK: usize = 8 * 1024;

/// One unit of work for the unmarshalling workers: a raw frame plus the
/// header it was read under.
struct ParseJob {
    data: Vec<u8>,
    header: HeaderRef,
    done: oneshot::Sender<Result<Sample, MarshalError>>,
}

/// Entries of the ordered queue between producer and consumer.
enum Pending {
    /// A sample being parsed by some worker.
    Sample {
        done: oneshot::Receiver<Result<Sample, MarshalError>>,
        header: HeaderRef,
    },
    /// An in-band header change; delivered strictly before any sample that
    /// was read under it.
    Header(HeaderRef),
}

/// Reads a framed byte stream and forwards the decoded samples, in input
/// order, to a processor.
pub struct SampleReader {
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
}

impl SampleReader {
    /// Creates a reader for the given wire format.
    pub fn new(marshaller: Arc<dyn Marshaller>, handler: ParallelSampleHandler) -> Self {
        Self {
            marshaller,
            handler,
        }
    }

    /// Drives `reader` to EOF, forwarding every decoded sample to `sink`.
    ///
    /// Returns the number of samples forwarded on clean EOF. Stops early
    /// without error when `stop` fires. Codec damage, schema violations and
    /// sink failures abort the stream.
    pub async fn read_stream<R>(
        &self,
        mut reader: R,
        sink: Arc<dyn Processor>,
        stop: StopChan,
    ) -> Result<u64, PipelineError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let buffered = self.handler.buffered_samples.max(1);
        let (job_tx, job_rx) = mpsc::channel::<ParseJob>(buffered);
        let (ordered_tx, ordered_rx) = mpsc::channel::<Pending>(buffered);

        let workers = spawn_parse_workers(self.marshaller.clone(), job_rx, self.handler.parallel_parsers);
        let consumer = spawn_ordered_consumer(ordered_rx, sink);

        let produced = self
            .produce_frames(&mut reader, &job_tx, &ordered_tx, &stop)
            .await;

        // Closing the channels drains the workers and the consumer.
        drop(job_tx);
        drop(ordered_tx);
        for worker in workers {
            let _ = worker.await;
        }
        let consumed = consumer
            .await
            .map_err(|err| PipelineError::Config(format!("consumer task panicked: {err}")))?;

        match produced {
            // A producer error beats the consumer count, except when the
            // producer only stopped because the consumer went away first.
            Err(ProduceError::ConsumerGone) | Ok(()) => consumed,
            Err(ProduceError::Failed(err)) => {
                consumed?;
                Err(err)
            }
        }
    }

    /// Extracts frames from the byte stream and schedules them. Headers are
    /// decoded inline (cheap), samples are dispatched to the workers.
    async fn produce_frames<R>(
        &self,
        reader: &mut R,
        job_tx: &mpsc::Sender<ParseJob>,
        ordered_tx: &mpsc::Sender<Pending>,
        stop: &StopChan,
    ) -> Result<(), ProduceError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut header: Option<HeaderRef> = None;
        let mut at_eof = false;

        loop {
            // Extract every complete frame currently buffered.
            loop {
                let frame_len = self
                    .marshaller
                    .scan_frame(&buf, header.as_deref(), at_eof)
                    .map_err(|err| ProduceError::Failed(err.into()))?;
                let Some(frame_len) = frame_len else { break };
                let frame: Vec<u8> = buf.drain(..frame_len).collect();

                let current = match header.clone() {
                    Some(current) if !self.marshaller.is_header_frame(&frame) => current,
                    _ => {
                        let parsed = self
                            .marshaller
                            .read_header(&frame)
                            .map_err(|err| ProduceError::Failed(err.into()))?;
                        let parsed = Arc::new(parsed);
                        header = Some(parsed.clone());
                        if ordered_tx.send(Pending::Header(parsed)).await.is_err() {
                            return Err(ProduceError::ConsumerGone);
                        }
                        continue;
                    }
                };

                let (done_tx, done_rx) = oneshot::channel();
                let job = ParseJob {
                    data: frame,
                    header: current.clone(),
                    done: done_tx,
                };
                let pending = Pending::Sample {
                    done: done_rx,
                    header: current,
                };
                if job_tx.send(job).await.is_err()
                    || ordered_tx.send(pending).await.is_err()
                {
                    return Err(ProduceError::ConsumerGone);
                }
            }
            if at_eof {
                return Ok(());
            }

            // Biased: drain readable bytes before honoring a stop request,
            // so a stream that is about to EOF is consumed completely.
            let read = tokio::select! {
                biased;
                read = reader.read(&mut chunk) => {
                    read.map_err(|err| ProduceError::Failed(err.into()))?
                }
                _ = stop.wait() => return Ok(()),
            };
            if read == 0 {
                at_eof = true;
            } else {
                buf.extend_from_slice(&chunk[..read]);
            }
        }
    }
}

enum ProduceError {
    /// The downstream consumer terminated; its own result carries the cause.
    ConsumerGone,
    Failed(PipelineError),
}

fn spawn_parse_workers(
    marshaller: Arc<dyn Marshaller>,
    job_rx: mpsc::Receiver<ParseJob>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
    (0..count.max(1))
        .map(|_| {
            let job_rx = job_rx.clone();
            let marshaller = marshaller.clone();
            tokio::spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let result = marshaller.read_sample(&job.header, &job.data);
                    // The consumer may already be gone; nothing to do then.
                    let _ = job.done.send(result);
                }
            })
        })
        .collect()
}

/// Resolves the ordered queue in FIFO order and forwards to the sink.
/// Worker completion order does not matter; this task re-serializes it.
fn spawn_ordered_consumer(
    mut ordered_rx: mpsc::Receiver<Pending>,
    sink: Arc<dyn Processor>,
) -> JoinHandle<Result<u64, PipelineError>> {
    tokio::spawn(async move {
        let mut count = 0u64;
        while let Some(pending) = ordered_rx.recv().await {
            match pending {
                Pending::Header(_header) => {
                    // Headers travel with each sample; the entry only pins
                    // the change into the delivery order.
                }
                Pending::Sample { done, header } => {
                    let sample = done
                        .await
                        .map_err(|_| PipelineError::Config("parse worker vanished".into()))?
                        .map_err(PipelineError::from)?;
                    header.check_sample(&sample).map_err(PipelineError::from)?;
                    sink.sample(sample, header).await?;
                    count += 1;
                }
            }
        }
        Ok(count)
    })
}

/// One unit of work for the marshalling workers.
struct FormatJob {
    sample: Sample,
    header: HeaderRef,
    done: oneshot::Sender<Result<Vec<u8>, MarshalError>>,
}

/// Marshals samples in parallel and writes the bytes, in submission order,
/// to an underlying byte stream.
pub struct SampleWriter {
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
}

impl SampleWriter {
    /// Creates a writer for the given wire format.
    pub fn new(marshaller: Arc<dyn Marshaller>, handler: ParallelSampleHandler) -> Self {
        Self {
            marshaller,
            handler,
        }
    }

    /// Opens a marshalling stream over `writer`.
    pub fn open<W>(&self, writer: W) -> SampleOutputStream
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let buffered = self.handler.buffered_samples.max(1);
        let (job_tx, job_rx) = mpsc::channel::<FormatJob>(buffered);
        let (ordered_tx, mut ordered_rx) =
            mpsc::channel::<oneshot::Receiver<Result<Vec<u8>, MarshalError>>>(buffered);

        let workers = spawn_format_workers(self.marshaller.clone(), job_rx, self.handler.parallel_parsers);

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(done) = ordered_rx.recv().await {
                let bytes = done
                    .await
                    .map_err(|_| PipelineError::Config("format worker vanished".into()))?
                    .map_err(PipelineError::from)?;
                writer.write_all(&bytes).await.map_err(PipelineError::from)?;
            }
            writer.flush().await.map_err(PipelineError::from)?;
            Ok(())
        });

        SampleOutputStream {
            marshaller: self.marshaller.clone(),
            job_tx: parking_lot::Mutex::new(Some(job_tx)),
            ordered_tx: parking_lot::Mutex::new(Some(ordered_tx)),
            last_header: parking_lot::Mutex::new(None),
            workers,
            writer_task: Some(writer_task),
        }
    }
}

fn spawn_format_workers(
    marshaller: Arc<dyn Marshaller>,
    job_rx: mpsc::Receiver<FormatJob>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
    (0..count.max(1))
        .map(|_| {
            let job_rx = job_rx.clone();
            let marshaller = marshaller.clone();
            tokio::spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let mut bytes = Vec::new();
                    let result = marshaller
                        .write_sample(&job.sample, &job.header, &mut bytes)
                        .map(|()| bytes);
                    let _ = job.done.send(result);
                }
            })
        })
        .collect()
}

/// Handle to a running marshalling stream created by [`SampleWriter::open`].
///
/// The header in force is tracked here: the first sample, and every sample
/// carrying a different header, writes a header frame before the sample.
pub struct SampleOutputStream {
    marshaller: Arc<dyn Marshaller>,
    job_tx: parking_lot::Mutex<Option<mpsc::Sender<FormatJob>>>,
    ordered_tx: parking_lot::Mutex<Option<mpsc::Sender<oneshot::Receiver<Result<Vec<u8>, MarshalError>>>>>,
    last_header: parking_lot::Mutex<Option<HeaderRef>>,
    workers: Vec<JoinHandle<()>>,
    writer_task: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl SampleOutputStream {
    /// Queues one sample for marshalling and writing.
    ///
    /// Writes a header frame first when the header changed. Fails once the
    /// underlying stream has failed; the root cause is reported by
    /// [`close`](SampleOutputStream::close).
    pub async fn sample(&self, sample: &Sample, header: &HeaderRef) -> Result<(), PipelineError> {
        let (job_tx, ordered_tx) = {
            let job = self.job_tx.lock().clone();
            let ordered = self.ordered_tx.lock().clone();
            match (job, ordered) {
                (Some(j), Some(o)) => (j, o),
                _ => return Err(Self::closed_error()),
            }
        };

        if self.header_changed(header) {
            let mut bytes = Vec::new();
            self.marshaller.write_header(header, &mut bytes)?;
            let (done_tx, done_rx) = oneshot::channel();
            let _ = done_tx.send(Ok(bytes));
            if ordered_tx.send(done_rx).await.is_err() {
                return Err(Self::closed_error());
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        let job = FormatJob {
            sample: sample.clone(),
            header: header.clone(),
            done: done_tx,
        };
        if job_tx.send(job).await.is_err() || ordered_tx.send(done_rx).await.is_err() {
            return Err(Self::closed_error());
        }
        Ok(())
    }

    fn header_changed(&self, header: &HeaderRef) -> bool {
        let mut last = self.last_header.lock();
        let changed = match last.as_ref() {
            Some(previous) => {
                !Arc::ptr_eq(previous, header) && previous.as_ref() != header.as_ref()
            }
            None => true,
        };
        if changed {
            *last = Some(header.clone());
        }
        changed
    }

    fn closed_error() -> PipelineError {
        PipelineError::Config("sample output stream is closed".into())
    }

    /// Flushes everything queued and shuts the stream down.
    ///
    /// Returns the first error the stream encountered, if any.
    pub async fn close(mut self) -> Result<(), PipelineError> {
        self.job_tx.lock().take();
        self.ordered_tx.lock().take();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        match self.writer_task.take() {
            Some(task) => task
                .await
                .map_err(|err| PipelineError::Config(format!("writer task panicked: {err}")))?,
            None => Ok(()),
        }
    }

    /// The header currently in force on this stream.
    pub fn current_header(&self) -> Option<HeaderRef> {
        self.last_header.lock().clone()
    }
}
