//! Batch processing: buffer samples and transform them as one vector.
//!
//! A [`BatchStep`] sees the whole buffered batch at a flush boundary and
//! re-emits a transformed vector, possibly under a new header. Used by
//! steps that need the full window to compute anything (scalers, sorters).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::sample::{HeaderRef, Sample};

use super::{BaseProcessor, Processor};

/// Transforms a full batch of samples at a flush boundary.
pub trait BatchStep: Send + Sync {
    /// Name of this step for logging.
    fn name(&self) -> String;

    /// Consumes the buffered batch and returns the replacement batch plus
    /// the header it conforms to.
    fn process_batch(
        &self,
        header: HeaderRef,
        samples: Vec<Sample>,
    ) -> Result<(HeaderRef, Vec<Sample>), PipelineError>;
}

/// When a [`BatchProcessor`] flushes its buffer.
///
/// A header change and the end of the stream always flush, regardless of
/// the configured trigger.
#[derive(Debug, Clone)]
pub enum BatchTrigger {
    /// Flush when the value of this tag differs from the buffered batch.
    TagChange(String),
    /// Flush when a sample's timestamp is this far past the batch start.
    Window(Duration),
    /// Flush only on header change or end of stream.
    EndOfStream,
}

#[derive(Default)]
struct BatchState {
    header: Option<HeaderRef>,
    samples: Vec<Sample>,
    tag_value: Option<String>,
}

/// Hosts a [`BatchStep`], buffering samples until the trigger fires.
pub struct BatchProcessor {
    base: BaseProcessor,
    step: Box<dyn BatchStep>,
    trigger: BatchTrigger,
    state: parking_lot::Mutex<BatchState>,
}

impl BatchProcessor {
    /// Creates a batching stage around the given step.
    pub fn new(step: Box<dyn BatchStep>, trigger: BatchTrigger) -> Self {
        Self {
            base: BaseProcessor::new("batch"),
            step,
            trigger,
            state: parking_lot::Mutex::new(BatchState::default()),
        }
    }

    fn should_flush(&self, state: &BatchState, sample: &Sample, header: &HeaderRef) -> bool {
        if state.samples.is_empty() {
            return false;
        }
        if let Some(buffered) = &state.header {
            if buffered.as_ref() != header.as_ref() {
                return true;
            }
        }
        match &self.trigger {
            BatchTrigger::TagChange(key) => {
                state.tag_value.as_deref() != Some(sample.tag(key))
            }
            BatchTrigger::Window(window) => {
                let start = state.samples[0].time;
                (sample.time - start).to_std().map_or(false, |age| age >= *window)
            }
            BatchTrigger::EndOfStream => false,
        }
    }

    fn take_batch(state: &mut BatchState) -> Option<(HeaderRef, Vec<Sample>)> {
        let header = state.header.clone()?;
        if state.samples.is_empty() {
            return None;
        }
        Some((header, std::mem::take(&mut state.samples)))
    }

    async fn flush(&self, header: HeaderRef, samples: Vec<Sample>) -> Result<(), PipelineError> {
        let (out_header, out_samples) = self.step.process_batch(header, samples)?;
        for sample in out_samples {
            self.base.forward(sample, out_header.clone()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for BatchProcessor {
    fn name(&self) -> String {
        format!("batch({})", self.step.name())
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        let flushed = {
            let mut state = self.state.lock();
            if self.should_flush(&state, &sample, &header) {
                Self::take_batch(&mut state)
            } else {
                None
            }
        };
        if let Some((batch_header, batch)) = flushed {
            self.flush(batch_header, batch).await?;
        }

        let mut state = self.state.lock();
        if let BatchTrigger::TagChange(key) = &self.trigger {
            state.tag_value = Some(sample.tag(key).to_string());
        }
        state.header = Some(header);
        state.samples.push(sample);
        Ok(())
    }

    async fn close(&self) {
        let remaining = {
            let mut state = self.state.lock();
            Self::take_batch(&mut state)
        };
        if let Some((header, batch)) = remaining {
            if let Err(err) = self.flush(header, batch).await {
                self.base.error(err);
            }
        }
        self.base.close_sink().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testutil::{make_sample, CollectingSink};
    use crate::sample::Header;
    use std::sync::Arc;

    /// Reverses the order of the batch.
    struct Reverse;

    impl BatchStep for Reverse {
        fn name(&self) -> String {
            "reverse".into()
        }

        fn process_batch(
            &self,
            header: HeaderRef,
            mut samples: Vec<Sample>,
        ) -> Result<(HeaderRef, Vec<Sample>), PipelineError> {
            samples.reverse();
            Ok((header, samples))
        }
    }

    #[tokio::test]
    async fn test_batch_flushes_on_close() {
        let batch = BatchProcessor::new(Box::new(Reverse), BatchTrigger::EndOfStream);
        let sink = CollectingSink::new();
        batch.base().set_sink(sink.clone());

        for i in 0..3 {
            let (sample, header) = make_sample(i as f64);
            batch.sample(sample, header).await.unwrap();
        }
        assert_eq!(sink.len(), 0);

        batch.close().await;
        assert_eq!(sink.values(), vec![vec![2.0], vec![1.0], vec![0.0]]);
        assert!(sink.was_closed());
    }

    #[tokio::test]
    async fn test_batch_flushes_on_tag_change() {
        let batch =
            BatchProcessor::new(Box::new(Reverse), BatchTrigger::TagChange("group".into()));
        let sink = CollectingSink::new();
        batch.base().set_sink(sink.clone());

        let header = Arc::new(Header::new(vec!["v".into()]));
        for (value, group) in [(1.0, "a"), (2.0, "a"), (3.0, "b")] {
            let mut sample = Sample::new(chrono::Utc::now(), vec![value]);
            sample.set_tag("group", group);
            batch.sample(sample, header.clone()).await.unwrap();
        }

        // The "a" batch flushed when "b" arrived; "b" is still buffered.
        assert_eq!(sink.values(), vec![vec![2.0], vec![1.0]]);

        batch.close().await;
        assert_eq!(sink.values(), vec![vec![2.0], vec![1.0], vec![3.0]]);
    }

    #[tokio::test]
    async fn test_batch_flushes_on_header_change() {
        let batch = BatchProcessor::new(Box::new(Reverse), BatchTrigger::EndOfStream);
        let sink = CollectingSink::new();
        batch.base().set_sink(sink.clone());

        let (sample, header) = make_sample(1.0);
        batch.sample(sample, header).await.unwrap();

        let new_header = Arc::new(Header::new(vec!["w".into()]));
        let sample = Sample::new(chrono::Utc::now(), vec![9.0]);
        batch.sample(sample, new_header).await.unwrap();

        assert_eq!(sink.values(), vec![vec![1.0]]);
    }
}
