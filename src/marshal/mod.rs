//! Marshaller trait and wire format implementations.
//!
//! A [`Marshaller`] is a bidirectional byte/record codec with header
//! framing. Two formats are built in:
//!
//! - [`CsvMarshaller`]: line-oriented, human-readable
//! - [`BinaryMarshaller`]: length-prefixed, network byte order
//!
//! Marshallers are pure byte-level codecs; the parallel sample stream in
//! [`crate::stream`] owns buffering, frame extraction and ordering.

mod binary;
mod csv;

pub use binary::BinaryMarshaller;
pub use csv::CsvMarshaller;

use std::sync::Arc;

use crate::error::MarshalError;
use crate::sample::{Header, Sample};

/// A bidirectional sample/byte codec with header framing.
///
/// For every sample whose tag values avoid the reserved separator
/// characters, `read(write(x)) == x`.
pub trait Marshaller: Send + Sync {
    /// Short format name for logging.
    fn name(&self) -> &'static str;

    /// Appends the wire encoding of a header to `out`.
    fn write_header(&self, header: &Header, out: &mut Vec<u8>) -> Result<(), MarshalError>;

    /// Appends the wire encoding of one sample to `out`.
    ///
    /// Fails with [`MarshalError::SchemaMismatch`] when the sample's value
    /// count disagrees with the header.
    fn write_sample(
        &self,
        sample: &Sample,
        header: &Header,
        out: &mut Vec<u8>,
    ) -> Result<(), MarshalError>;

    /// Decodes a header from one complete frame.
    fn read_header(&self, frame: &[u8]) -> Result<Header, MarshalError>;

    /// Decodes one sample from one complete frame, under the given header.
    fn read_sample(&self, header: &Header, frame: &[u8]) -> Result<Sample, MarshalError>;

    /// Whether a complete frame announces a header rather than a sample.
    /// Header changes are signalled in-band on both formats.
    fn is_header_frame(&self, frame: &[u8]) -> bool;

    /// Scans `buf` for one complete frame starting at offset 0.
    ///
    /// Returns `Ok(Some(len))` when `buf[..len]` is a complete frame,
    /// `Ok(None)` when more bytes are needed. `header` is the schema
    /// currently in force (the binary format needs it to size sample
    /// frames). With `at_eof` set, a non-empty partial frame is a framing
    /// error instead of a request for more bytes.
    fn scan_frame(
        &self,
        buf: &[u8],
        header: Option<&Header>,
        at_eof: bool,
    ) -> Result<Option<usize>, MarshalError>;
}

/// Wire formats understood by the endpoint layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Comma-separated text lines.
    Csv,
    /// Length-prefixed binary frames.
    Binary,
}

impl Format {
    /// Creates the marshaller for this format.
    pub fn marshaller(self) -> Arc<dyn Marshaller> {
        match self {
            Format::Csv => Arc::new(CsvMarshaller),
            Format::Binary => Arc::new(BinaryMarshaller),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use chrono::{TimeZone, Utc};

    /// A tagged two-field header and a matching sample, shared by the
    /// codec tests.
    pub fn sample_fixture() -> (Header, Sample) {
        let header = Header::new(vec!["a".into(), "b".into()]);
        let time = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(500);
        let mut sample = Sample::new(time, vec![1.5, 2.0]);
        sample.set_tag("host", "h1");
        (header, sample)
    }

    /// Round-trips a sample through the given marshaller and asserts
    /// equality.
    pub fn assert_round_trip(m: &dyn Marshaller, header: &Header, sample: &Sample) {
        let mut buf = Vec::new();
        m.write_header(header, &mut buf).unwrap();
        let header_len = m
            .scan_frame(&buf, None, false)
            .unwrap()
            .expect("header frame incomplete");
        let parsed_header = m.read_header(&buf[..header_len]).unwrap();
        assert_eq!(&parsed_header, header);

        let mut buf = Vec::new();
        m.write_sample(sample, header, &mut buf).unwrap();
        let len = m
            .scan_frame(&buf, Some(header), true)
            .unwrap()
            .expect("sample frame incomplete");
        assert_eq!(len, buf.len());
        assert!(!m.is_header_frame(&buf[..len]));
        let parsed = m.read_sample(header, &buf[..len]).unwrap();
        assert_eq!(&parsed, sample);
    }
}
