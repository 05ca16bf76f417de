//! Sample and header model.
//!
//! A [`Sample`] is a timestamped vector of `f64` values plus free-form
//! string tags. A [`Header`] declares the field names the values map to.
//! Headers are immutable once shared: a processor that changes the schema
//! announces a new header alongside the first affected sample.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::MarshalError;

/// Reserved name of the timestamp column on the wire.
pub const TIME_COLUMN: &str = "time";
/// Reserved name of the tag column on the wire.
pub const TAGS_COLUMN: &str = "tags";

/// Separator between tag pairs in the serialized tag string.
pub const TAG_PAIR_SEPARATOR: char = ' ';
/// Separator between key and value within one tag pair.
pub const TAG_EQUALS: char = '=';

/// Timestamp layout used by the CSV wire format, nanosecond precision.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// The schema of a stream of samples: ordered field names plus a flag
/// telling whether samples carry tags on the wire.
///
/// Two headers are equal iff the flag and the full name sequence match.
/// Headers are shared by reference ([`Arc`]) along a pipeline and replaced,
/// never mutated, on schema changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    fields: Vec<String>,
    has_tags: bool,
}

impl Header {
    /// Creates a header with the given field names, with tags enabled.
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            has_tags: true,
        }
    }

    /// Creates a header without a tag column.
    pub fn without_tags(fields: Vec<String>) -> Self {
        Self {
            fields,
            has_tags: false,
        }
    }

    /// The declared field names, in order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of declared fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Whether samples of this schema carry tags on the wire.
    pub fn has_tags(&self) -> bool {
        self.has_tags
    }

    /// Returns a new header with different field names, keeping the tag flag.
    pub fn with_fields(&self, fields: Vec<String>) -> Self {
        Self {
            fields,
            has_tags: self.has_tags,
        }
    }

    /// Checks that a sample's value count matches this header.
    pub fn check_sample(&self, sample: &Sample) -> Result<(), MarshalError> {
        if sample.values.len() != self.fields.len() {
            return Err(MarshalError::SchemaMismatch {
                expected: self.fields.len(),
                actual: sample.values.len(),
            });
        }
        Ok(())
    }
}

/// Ordered string-to-string tag map.
///
/// Iteration follows first-insertion order, so serializing and re-parsing a
/// tag string is deterministic. Updating an existing key keeps its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap {
    pairs: Vec<(String, String)>,
}

impl TagMap {
    /// Creates an empty tag map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a tag value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a tag. An existing key is updated in place, a new key is
    /// appended at the end of the iteration order.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    /// Removes a tag, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(idx).1)
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns `true` if no tags are set.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for TagMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = TagMap::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}

/// One record of a sample stream: a wall-clock timestamp, an ordered vector
/// of values whose arity matches the header in force, and tags.
///
/// Samples are owned by exactly one processor at a time. `Clone` copies the
/// value vector and the tag map, so a cloned sample can be mutated freely
/// without affecting the original; fork fan-out relies on this.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Wall-clock timestamp, nanosecond precision.
    pub time: DateTime<Utc>,
    /// Field values, in header field order.
    pub values: Vec<f64>,
    /// Tag metadata.
    pub tags: TagMap,
}

impl Sample {
    /// Creates a sample with the given timestamp and values, no tags.
    pub fn new(time: DateTime<Utc>, values: Vec<f64>) -> Self {
        Self {
            time,
            values,
            tags: TagMap::new(),
        }
    }

    /// Looks up a tag value, empty string if unset.
    pub fn tag(&self, key: &str) -> &str {
        self.tags.get(key).unwrap_or("")
    }

    /// Returns `true` if the tag is set.
    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.get(key).is_some()
    }

    /// Sets a tag on this sample.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.set(key, value);
    }

    /// Serializes the tags as `k1=v1 k2=v2`, keys in first-insertion order.
    pub fn tag_string(&self) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                out.push(TAG_PAIR_SEPARATOR);
            }
            out.push_str(key);
            out.push(TAG_EQUALS);
            out.push_str(value);
        }
        out
    }

    /// Replaces this sample's tags by parsing a serialized tag string.
    ///
    /// Fails with [`MarshalError::MalformedTag`] when a pair lacks `=` or a
    /// key repeats.
    pub fn parse_tag_string(&mut self, raw: &str) -> Result<(), MarshalError> {
        self.tags = parse_tags(raw)?;
        Ok(())
    }
}

/// Parses a `k1=v1 k2=v2` tag string into a [`TagMap`].
pub fn parse_tags(raw: &str) -> Result<TagMap, MarshalError> {
    let mut map = TagMap::new();
    for pair in raw.split(TAG_PAIR_SEPARATOR) {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once(TAG_EQUALS).ok_or_else(|| {
            MarshalError::MalformedTag {
                reason: format!("pair '{pair}' has no '{TAG_EQUALS}'"),
            }
        })?;
        if key.is_empty() {
            return Err(MarshalError::MalformedTag {
                reason: format!("pair '{pair}' has an empty key"),
            });
        }
        if map.get(key).is_some() {
            return Err(MarshalError::MalformedTag {
                reason: format!("key '{key}' repeats"),
            });
        }
        map.set(key, value);
    }
    Ok(map)
}

/// Parses a wire timestamp in the CSV layout.
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>, MarshalError> {
    let naive = NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
        .map_err(|err| MarshalError::bad_frame(format!("invalid timestamp '{raw}': {err}")))?;
    Ok(naive.and_utc())
}

/// Formats a timestamp in the CSV wire layout.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Shared, immutable header handle as passed along a pipeline.
pub type HeaderRef = Arc<Header>;
