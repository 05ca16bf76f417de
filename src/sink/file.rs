//! File-based sample sink.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ParallelSampleHandler;
use crate::error::PipelineError;
use crate::marshal::Marshaller;
use crate::processor::{BaseProcessor, Processor};
use crate::sample::{HeaderRef, Sample};
use crate::stream::{SampleOutputStream, SampleWriter};

/// Writes marshalled samples to a file.
///
/// With [`split_by_tag`](FileSink::split_by_tag), one file is kept per
/// distinct value of the tag; the value becomes a filename suffix
/// (`out.csv` becomes `out-web.csv` for value `web`). Files are created
/// lazily on the first sample they receive.
pub struct FileSink {
    base: BaseProcessor,
    path: PathBuf,
    split_tag: Option<String>,
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
    streams: tokio::sync::Mutex<HashMap<String, SampleOutputStream>>,
}

impl FileSink {
    /// Creates a sink writing to the given file.
    pub fn new(
        path: impl Into<PathBuf>,
        marshaller: Arc<dyn Marshaller>,
        handler: ParallelSampleHandler,
    ) -> Self {
        let path = path.into();
        Self {
            base: BaseProcessor::new(format!("file://{}", path.display())),
            path,
            split_tag: None,
            marshaller,
            handler,
            streams: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Splits the output into one file per distinct value of this tag.
    pub fn split_by_tag(mut self, tag: impl Into<String>) -> Self {
        self.split_tag = Some(tag.into());
        self
    }

    fn path_for(&self, tag_value: &str) -> PathBuf {
        if tag_value.is_empty() {
            return self.path.clone();
        }
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut name = format!("{stem}-{tag_value}");
        if let Some(ext) = self.path.extension() {
            name.push('.');
            name.push_str(&ext.to_string_lossy());
        }
        self.path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(name)
    }
}

#[async_trait]
impl Processor for FileSink {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        let key = match &self.split_tag {
            Some(tag) => sample.tag(tag).to_string(),
            None => String::new(),
        };

        {
            let mut streams = self.streams.lock().await;
            if !streams.contains_key(&key) {
                let path = self.path_for(&key);
                let file = tokio::fs::File::create(&path).await.map_err(|err| {
                    PipelineError::endpoint(path.display().to_string(), err)
                })?;
                let writer = SampleWriter::new(self.marshaller.clone(), self.handler.clone());
                streams.insert(key.clone(), writer.open(tokio::io::BufWriter::new(file)));
            }
            if let Some(stream) = streams.get(&key) {
                stream.sample(&sample, &header).await?;
            }
        }

        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        let streams = std::mem::take(&mut *self.streams.lock().await);
        for (_, stream) in streams {
            if let Err(err) = stream.close().await {
                self.base.error(err);
            }
        }
        self.base.close_sink().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::CsvMarshaller;
    use chrono::{TimeZone, Utc};

    fn make_sink(path: &Path) -> FileSink {
        FileSink::new(
            path,
            Arc::new(CsvMarshaller),
            ParallelSampleHandler::default(),
        )
    }

    fn tagged_sample(role: &str, value: f64) -> (Sample, HeaderRef) {
        let header = Arc::new(crate::sample::Header::new(vec!["v".into()]));
        let time = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut sample = Sample::new(time, vec![value]);
        sample.set_tag("role", role);
        (sample, header)
    }

    #[tokio::test]
    async fn test_file_sink_writes_header_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sink = make_sink(&path);

        let (sample, header) = tagged_sample("web", 1.5);
        sink.sample(sample, header).await.unwrap();
        sink.close().await;

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "time,tags,v\n2020-01-01 00:00:00,role=web,1.5\n");
    }

    #[tokio::test]
    async fn test_file_sink_splits_by_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sink = make_sink(&path).split_by_tag("role");

        for (role, value) in [("web", 1.0), ("db", 2.0), ("web", 3.0)] {
            let (sample, header) = tagged_sample(role, value);
            sink.sample(sample, header).await.unwrap();
        }
        sink.close().await;

        let web = std::fs::read_to_string(dir.path().join("out-web.csv")).unwrap();
        assert_eq!(web.lines().count(), 3); // header + two samples
        let db = std::fs::read_to_string(dir.path().join("out-db.csv")).unwrap();
        assert_eq!(db.lines().count(), 2);
    }

    #[test]
    fn test_path_for_suffix() {
        let sink = make_sink(Path::new("/tmp/data/out.csv"));
        assert_eq!(
            sink.path_for("web"),
            PathBuf::from("/tmp/data/out-web.csv")
        );
        assert_eq!(sink.path_for(""), PathBuf::from("/tmp/data/out.csv"));
    }
}
