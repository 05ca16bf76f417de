//! Distributor policies: which sub-pipelines of a fork receive a sample.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::sample::{Header, Sample};

use super::{ForkTarget, PipelineTemplate};

/// Selects the sub-pipelines of a fork that receive a given sample.
pub trait Distributor: Send + Sync {
    /// Policy name for logging and pipeline printing.
    fn name(&self) -> String;

    /// Returns the keyed templates this sample is delivered to.
    fn distribute(
        &self,
        sample: &Sample,
        header: &Header,
    ) -> Result<Vec<ForkTarget>, PipelineError>;
}

/// Broadcasts every sample to all sub-pipelines.
pub struct MultiplexDistributor {
    targets: Vec<(String, Arc<PipelineTemplate>)>,
}

impl MultiplexDistributor {
    /// Creates a broadcast distributor over keyed templates.
    pub fn new(targets: Vec<(String, Arc<PipelineTemplate>)>) -> Self {
        Self { targets }
    }
}

impl Distributor for MultiplexDistributor {
    fn name(&self) -> String {
        format!("multiplex({})", self.targets.len())
    }

    fn distribute(
        &self,
        _sample: &Sample,
        _header: &Header,
    ) -> Result<Vec<ForkTarget>, PipelineError> {
        Ok(self
            .targets
            .iter()
            .map(|(key, template)| ForkTarget {
                key: key.clone(),
                template: template.clone(),
            })
            .collect())
    }
}

/// Cycles samples across the sub-pipelines, one at a time.
pub struct RoundRobinDistributor {
    targets: Vec<(String, Arc<PipelineTemplate>)>,
    next: AtomicUsize,
}

impl RoundRobinDistributor {
    /// Creates a cycling distributor over keyed templates.
    pub fn new(targets: Vec<(String, Arc<PipelineTemplate>)>) -> Self {
        Self {
            targets,
            next: AtomicUsize::new(0),
        }
    }
}

impl Distributor for RoundRobinDistributor {
    fn name(&self) -> String {
        format!("round_robin({})", self.targets.len())
    }

    fn distribute(
        &self,
        _sample: &Sample,
        _header: &Header,
    ) -> Result<Vec<ForkTarget>, PipelineError> {
        if self.targets.is_empty() {
            return Ok(Vec::new());
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        let (key, template) = &self.targets[idx];
        Ok(vec![ForkTarget {
            key: key.clone(),
            template: template.clone(),
        }])
    }
}

/// Routes samples by the value of a tag.
///
/// The tag value (optionally split into several keys) is matched against
/// the configured patterns; `*` is the fallback. Values without a matching
/// pattern are dropped from the fork with a debug log.
pub struct TagDistributor {
    tag: String,
    split: Option<String>,
    mapping: Vec<(String, Arc<PipelineTemplate>)>,
}

impl TagDistributor {
    /// Creates a tag-routing distributor with a pattern-to-template map.
    pub fn new(tag: impl Into<String>, mapping: Vec<(String, Arc<PipelineTemplate>)>) -> Self {
        Self {
            tag: tag.into(),
            split: None,
            mapping,
        }
    }

    /// Splits the tag value on this separator, delivering the sample once
    /// per resulting key.
    pub fn with_split(mut self, separator: impl Into<String>) -> Self {
        self.split = Some(separator.into());
        self
    }

    fn template_for(&self, key: &str) -> Option<&Arc<PipelineTemplate>> {
        self.mapping
            .iter()
            .find(|(pattern, _)| pattern == key)
            .or_else(|| self.mapping.iter().find(|(pattern, _)| pattern == "*"))
            .map(|(_, template)| template)
    }
}

impl Distributor for TagDistributor {
    fn name(&self) -> String {
        format!("fork_tags(tag={})", self.tag)
    }

    fn distribute(
        &self,
        sample: &Sample,
        _header: &Header,
    ) -> Result<Vec<ForkTarget>, PipelineError> {
        let value = sample.tag(&self.tag);
        let keys: Vec<&str> = match &self.split {
            Some(separator) => value.split(separator.as_str()).collect(),
            None => vec![value],
        };

        let mut targets = Vec::with_capacity(keys.len());
        for key in keys {
            match self.template_for(key) {
                Some(template) => targets.push(ForkTarget {
                    key: key.to_string(),
                    template: template.clone(),
                }),
                None => {
                    tracing::debug!(tag = %self.tag, key = %key, "no sub-pipeline for tag value");
                }
            }
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SamplePipeline;
    use chrono::Utc;

    fn template(id: usize) -> Arc<PipelineTemplate> {
        PipelineTemplate::new(id, Box::new(|| Ok(SamplePipeline::new())))
    }

    fn tagged(role: &str) -> (Sample, Header) {
        let mut sample = Sample::new(Utc::now(), vec![]);
        sample.set_tag("role", role);
        (sample, Header::new(vec![]))
    }

    #[test]
    fn test_multiplex_returns_all() {
        let dist =
            MultiplexDistributor::new(vec![("0".into(), template(0)), ("1".into(), template(1))]);
        let (sample, header) = tagged("x");
        let targets = dist.distribute(&sample, &header).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].key, "0");
        assert_eq!(targets[1].key, "1");
    }

    #[test]
    fn test_round_robin_cycles() {
        let dist =
            RoundRobinDistributor::new(vec![("a".into(), template(0)), ("b".into(), template(1))]);
        let (sample, header) = tagged("x");
        let keys: Vec<String> = (0..4)
            .map(|_| dist.distribute(&sample, &header).unwrap()[0].key.clone())
            .collect();
        assert_eq!(keys, ["a", "b", "a", "b"]);
    }

    #[test]
    fn test_tag_distributor_exact_match() {
        let dist = TagDistributor::new(
            "role",
            vec![("web".into(), template(0)), ("db".into(), template(1))],
        );
        let (sample, header) = tagged("db");
        let targets = dist.distribute(&sample, &header).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].key, "db");
        assert_eq!(targets[0].template.id(), 1);
    }

    #[test]
    fn test_tag_distributor_wildcard_fallback() {
        let dist = TagDistributor::new(
            "role",
            vec![("web".into(), template(0)), ("*".into(), template(9))],
        );
        let (sample, header) = tagged("cache");
        let targets = dist.distribute(&sample, &header).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].key, "cache");
        assert_eq!(targets[0].template.id(), 9);
    }

    #[test]
    fn test_tag_distributor_unmatched_drops() {
        let dist = TagDistributor::new("role", vec![("web".into(), template(0))]);
        let (sample, header) = tagged("db");
        assert!(dist.distribute(&sample, &header).unwrap().is_empty());
    }

    #[test]
    fn test_tag_distributor_split_values() {
        let dist = TagDistributor::new("role", vec![("*".into(), template(0))]).with_split("|");
        let (sample, header) = tagged("web|db");
        let targets = dist.distribute(&sample, &header).unwrap();
        let keys: Vec<&str> = targets.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, ["web", "db"]);
    }
}
