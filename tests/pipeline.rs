//! End-to-end pipeline tests: wire transport, forks, script building and
//! shutdown ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use bitflow::{
    event_callback, BaseProcessor, BaseSource, BinaryMarshaller, CsvMarshaller, EndpointFactory,
    Fork, Header, HeaderRef, Marshaller, MultiplexDistributor, PipelineConfig, PipelineError,
    PipelineEvent, PipelineTemplate, Processor, Registry, Sample, SamplePipeline, SampleSource,
    ScriptBuilder, StopChan, TagDistributor, TaskGroup, TcpListenerSink, TcpSource,
};

/// A source that emits a fixed list of samples, then closes its chain.
struct GeneratorSource {
    base: Arc<BaseSource>,
    samples: Mutex<Option<Vec<Sample>>>,
    header: HeaderRef,
    start_delay: Duration,
}

impl GeneratorSource {
    fn new(header: Header, samples: Vec<Sample>) -> Self {
        Self {
            base: BaseSource::new("generator"),
            samples: Mutex::new(Some(samples)),
            header: Arc::new(header),
            start_delay: Duration::ZERO,
        }
    }

    /// Delays the first sample, giving downstream consumers time to
    /// connect.
    fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }
}

#[async_trait]
impl SampleSource for GeneratorSource {
    fn name(&self) -> String {
        "generator".into()
    }

    fn set_sink(&self, sink: Arc<dyn Processor>) {
        self.base.set_sink(sink);
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let sink = self.base.sink()?;
        let header = self.header.clone();
        let samples = self.samples.lock().take().unwrap_or_default();
        let delay = self.start_delay;
        self.base.spawn_producer(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for sample in samples {
                sink.sample(sample, header.clone()).await?;
            }
            Ok(())
        });
        Ok(self.base.done())
    }

    fn stop(&self) {
        self.base.request_stop();
    }
}

/// A terminal sink collecting every received sample.
struct CollectSink {
    base: BaseProcessor,
    samples: Mutex<Vec<Sample>>,
    closes: AtomicUsize,
}

impl CollectSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            base: BaseProcessor::new("collect"),
            samples: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    fn len(&self) -> usize {
        self.samples.lock().len()
    }

    fn first_values(&self) -> Vec<f64> {
        self.samples.lock().iter().map(|s| s.values[0]).collect()
    }
}

#[async_trait]
impl Processor for CollectSink {
    fn name(&self) -> String {
        "collect".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        self.samples.lock().push(sample.clone());
        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.base.close_sink().await;
    }
}

/// Records the order in which `close()` reaches the probes of a chain.
struct CloseProbe {
    base: BaseProcessor,
    label: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl CloseProbe {
    fn new(label: &'static str, order: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            base: BaseProcessor::new(label),
            label,
            order,
        })
    }
}

#[async_trait]
impl Processor for CloseProbe {
    fn name(&self) -> String {
        self.label.into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        self.order.lock().push(self.label);
        self.base.close_sink().await;
    }
}

fn numbered_samples(n: usize) -> (Header, Vec<Sample>) {
    let header = Header::new(vec!["v".into()]);
    let samples = (0..n)
        .map(|i| {
            let time = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::milliseconds(i as i64);
            let mut sample = Sample::new(time, vec![i as f64]);
            sample.set_tag("seq", i.to_string());
            sample
        })
        .collect();
    (header, samples)
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        shutdown_timeout: Duration::from_secs(1),
        tcp_retry_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// CSV round-trip of a tagged sample through the public codec API.
#[test]
fn test_csv_round_trip() {
    let header = Header::new(vec!["a".into(), "b".into()]);
    let time = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
        + chrono::Duration::milliseconds(500);
    let mut sample = Sample::new(time, vec![1.5, 2.0]);
    sample.set_tag("host", "h1");

    let marshaller = CsvMarshaller;
    let mut bytes = Vec::new();
    marshaller.write_header(&header, &mut bytes).unwrap();
    let header_len = marshaller.scan_frame(&bytes, None, false).unwrap().unwrap();
    let read_header = marshaller.read_header(&bytes[..header_len]).unwrap();
    assert_eq!(read_header, header);

    let mut bytes = Vec::new();
    marshaller.write_sample(&sample, &header, &mut bytes).unwrap();
    let read_sample = marshaller.read_sample(&header, &bytes).unwrap();
    assert_eq!(read_sample, sample);
}

/// A TCP listener sink serving a TCP source: 10 samples arrive in order
/// and the task group exits without errors.
#[tokio::test]
async fn test_tcp_listener_to_source() {
    let config = test_config();
    let (header, samples) = numbered_samples(10);

    // Sender: generator -> listener sink on a fixed port.
    let listener = Arc::new(TcpListenerSink::new(
        "127.0.0.1:7878",
        Arc::new(BinaryMarshaller),
        &config,
    ));
    let mut sender = SamplePipeline::new();
    sender.add_source(Arc::new(
        GeneratorSource::new(header, samples).with_start_delay(Duration::from_millis(300)),
    ));
    sender.add(listener);

    // Receiver: tcp source -> collecting sink.
    let source = TcpSource::new(
        vec!["127.0.0.1:7878".into()],
        Arc::new(BinaryMarshaller),
        &config,
    );
    let collected = CollectSink::new();
    let mut receiver = SamplePipeline::new();
    receiver.add_source(Arc::new(source));
    receiver.add(collected.clone());

    let group = TaskGroup::new(config.shutdown_timeout);
    sender.construct(&group).unwrap();
    receiver.construct(&group).unwrap();

    let errors = tokio::time::timeout(Duration::from_secs(5), group.run())
        .await
        .expect("group did not finish");
    assert_eq!(errors.len(), 0, "task group errors: {errors}");

    let values = collected.first_values();
    assert_eq!(values, (0..10).map(|i| i as f64).collect::<Vec<_>>());
}

/// Fork by tag: 100 samples split 60/40 between two branches, the merger
/// forwards all 100 downstream.
#[tokio::test]
async fn test_fork_by_tag() {
    let config = test_config();
    let web = CollectSink::new();
    let db = CollectSink::new();

    let branch = |sink: Arc<CollectSink>, id: usize| {
        PipelineTemplate::new(
            id,
            Box::new(move || {
                let mut pipe = SamplePipeline::new();
                pipe.add(sink.clone());
                Ok(pipe)
            }),
        )
    };
    let fork = Fork::new(
        Box::new(TagDistributor::new(
            "role",
            vec![
                ("web".into(), branch(web.clone(), 0)),
                ("db".into(), branch(db.clone(), 1)),
            ],
        )),
        &config,
    );
    let merged = CollectSink::new();
    fork.base().set_sink(merged.clone());
    fork.start().await.unwrap();

    let header = Arc::new(Header::new(vec!["v".into()]));
    for i in 0..100 {
        let mut sample = Sample::new(Utc::now(), vec![i as f64]);
        sample.set_tag("role", if i % 5 < 3 { "web" } else { "db" });
        fork.sample(sample, header.clone()).await.unwrap();
    }

    assert_eq!(web.len(), 60);
    assert_eq!(db.len(), 40);
    assert_eq!(merged.len(), 100);

    fork.close().await;
    assert_eq!(web.closes.load(Ordering::SeqCst), 1);
    assert_eq!(db.closes.load(Ordering::SeqCst), 1);
    assert_eq!(merged.closes.load(Ordering::SeqCst), 1);
}

/// Multiplex lowering: `{ x(); y() }` becomes a fork over the implicit
/// multiplex distributor and every sample reaches both branches as an
/// independent clone.
#[tokio::test]
async fn test_multiplex_delivers_clones() {
    let config = test_config();
    let left = CollectSink::new();
    let right = CollectSink::new();

    let branch = |sink: Arc<CollectSink>, id: usize| {
        PipelineTemplate::new(
            id,
            Box::new(move || {
                let mut pipe = SamplePipeline::new();
                pipe.add(sink.clone());
                Ok(pipe)
            }),
        )
    };
    let fork = Fork::new(
        Box::new(MultiplexDistributor::new(vec![
            ("0".into(), branch(left.clone(), 0)),
            ("1".into(), branch(right.clone(), 1)),
        ])),
        &config,
    );
    let merged = CollectSink::new();
    fork.base().set_sink(merged.clone());
    fork.start().await.unwrap();

    let header = Arc::new(Header::new(vec!["v".into()]));
    let mut sample = Sample::new(Utc::now(), vec![1.0]);
    sample.set_tag("shared", "yes");
    fork.sample(sample, header).await.unwrap();

    assert_eq!(left.len(), 1);
    assert_eq!(right.len(), 1);
    assert_eq!(merged.len(), 2);

    // Mutating one branch's sample must not affect the other's.
    left.samples.lock()[0].values[0] = 99.0;
    left.samples.lock()[0].set_tag("shared", "mutated");
    assert_eq!(right.samples.lock()[0].values[0], 1.0);
    assert_eq!(right.samples.lock()[0].tag("shared"), "yes");

    fork.close().await;
}

/// Script-built end-to-end run: a CSV file through a multiplex group into
/// an output file; both branches contribute, so the output has twice the
/// input samples.
#[tokio::test]
async fn test_script_multiplex_file_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    let output = dir.path().join("out.csv");
    std::fs::write(
        &input,
        "time,tags,v\n2020-01-01 00:00:00,h=1,1\n2020-01-01 00:00:01,h=1,2\n",
    )
    .unwrap();

    let config = test_config();
    let builder = ScriptBuilder::new(
        Arc::new(Registry::with_builtins()),
        Arc::new(EndpointFactory::new(config.clone())),
    );
    let script = format!(
        "{} -> {{ noop(); noop() }} -> {}",
        input.display(),
        output.display()
    );
    let pipelines = builder.build_script(&script).unwrap();

    let errors = tokio::time::timeout(
        Duration::from_secs(5),
        bitflow::run_pipelines(pipelines, &config, false),
    )
    .await
    .expect("pipeline did not finish");
    assert_eq!(errors, 0);

    let text = std::fs::read_to_string(&output).unwrap();
    // Header line plus two samples per branch.
    assert_eq!(text.lines().count(), 5, "unexpected output:\n{text}");
    assert!(text.starts_with("time,tags,v\n"));
}

/// Drop-slow policy: a stalled reader is disconnected while the fast
/// reader receives the complete stream in order.
#[tokio::test]
async fn test_listener_sink_drops_slow_reader() {
    let config = test_config();
    let dropped = Arc::new(AtomicUsize::new(0));
    let dropped_probe = dropped.clone();

    let sink = TcpListenerSink::new("127.0.0.1:0", Arc::new(BinaryMarshaller), &config)
        .with_buffered_samples(2)
        .with_event_callback(event_callback(move |event| {
            if matches!(event, PipelineEvent::SlowReaderDisconnected { .. }) {
                dropped_probe.fetch_add(1, Ordering::SeqCst);
            }
        }));
    sink.start().await.unwrap();
    let addr = sink.local_addr().unwrap();

    // One reader drains constantly, one connects and never reads.
    let mut fast = tokio::net::TcpStream::connect(addr).await.unwrap();
    let stalled = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast_bytes = tokio::spawn(async move {
        let mut bytes = Vec::new();
        fast.read_to_end(&mut bytes).await.unwrap();
        bytes
    });

    // Large frames overflow the stalled reader's socket and sample
    // buffers quickly. The short sleeps let the per-connection writer
    // tasks drain the fast reader's queue.
    let header = Arc::new(Header::new(vec!["v".to_string(); 50_000]));
    for i in 0..30 {
        let mut sample = Sample::new(Utc::now(), vec![i as f64; 50_000]);
        sample.set_tag("seq", i.to_string());
        sink.sample(sample, header.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Unblock the stalled connection's writer so the sink can flush and
    // join it, then shut down.
    drop(stalled);
    sink.close().await;

    assert!(
        dropped.load(Ordering::SeqCst) >= 1,
        "stalled reader was not disconnected"
    );

    // The fast reader got the header and all 30 samples, in order.
    let bytes = fast_bytes.await.unwrap();
    let marshaller = BinaryMarshaller;
    let mut offset = 0;
    let header_len = marshaller
        .scan_frame(&bytes, None, true)
        .unwrap()
        .expect("missing header frame");
    let read_header = marshaller.read_header(&bytes[..header_len]).unwrap();
    offset += header_len;

    let mut count = 0u64;
    while offset < bytes.len() {
        let frame_len = marshaller
            .scan_frame(&bytes[offset..], Some(&read_header), true)
            .unwrap()
            .expect("truncated frame");
        let sample = marshaller
            .read_sample(&read_header, &bytes[offset..offset + frame_len])
            .unwrap();
        assert_eq!(sample.tag("seq"), count.to_string());
        offset += frame_len;
        count += 1;
    }
    assert_eq!(count, 30);
}

/// After the source signals EOF, every stage observes `close()` exactly
/// once, in downstream order.
#[tokio::test]
async fn test_graceful_close_order() {
    let config = test_config();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (header, samples) = numbered_samples(5);

    let mut pipeline = SamplePipeline::new();
    pipeline.add_source(Arc::new(GeneratorSource::new(header, samples)));
    pipeline.add(CloseProbe::new("first", order.clone()));
    pipeline.add(CloseProbe::new("second", order.clone()));
    let collected = CollectSink::new();
    pipeline.add(collected.clone());

    let group = TaskGroup::new(config.shutdown_timeout);
    pipeline.construct(&group).unwrap();
    let errors = group.run().await;

    assert_eq!(errors.len(), 0);
    assert_eq!(collected.len(), 5);
    assert_eq!(*order.lock(), vec!["first", "second"]);
    assert_eq!(collected.closes.load(Ordering::SeqCst), 1);
}

/// Parser errors carry the position of the offending token.
#[test]
fn test_parser_error_position() {
    let err = bitflow::script::parse_script("a(((").unwrap_err();
    assert_eq!(err.message, "Expected 'parameter name (string)'");
    assert_eq!(err.pos.start, 2);
    assert_eq!(err.to_string(), "Expected 'parameter name (string)' (at [2-3] '(')");
}

/// Canonical formatting round-trips through the parser.
#[test]
fn test_script_canonical_round_trip() {
    for script in [
        "in.csv -> noop() -> out.csv",
        "a -> fork_tags(tag=role){ web -> noop(); db -> drop() } -> b",
        "[in.csv] { noop(); drop() } [out.csv]",
    ] {
        let parsed = bitflow::script::parse_script(script).unwrap();
        let canonical = bitflow::script::format_script(&parsed);
        let reparsed = bitflow::script::parse_script(&canonical).unwrap();
        assert_eq!(
            canonical,
            bitflow::script::format_script(&reparsed),
            "canonical form of '{script}' is unstable"
        );
    }
}
