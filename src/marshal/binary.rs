//! Binary wire format.
//!
//! Length-prefixed frames in network byte order. Every frame begins with a
//! marker byte: `H` opens a textual header frame (comma-separated column
//! names, `\n`-terminated), `S` opens a sample frame. A sample frame is the
//! 8-byte big-endian Unix-nanosecond timestamp, an optional length-prefixed
//! tag string, then one big-endian IEEE-754 f64 per field. An `H` frame
//! mid-stream announces a header change in-band.

use chrono::{DateTime, Utc};

use crate::error::MarshalError;
use crate::sample::{Header, Sample, TAGS_COLUMN, TIME_COLUMN};

use super::Marshaller;

const HEADER_MARKER: u8 = b'H';
const SAMPLE_MARKER: u8 = b'S';
const NEWLINE: u8 = b'\n';
const SEPARATOR: u8 = b',';

/// The binary sample codec.
pub struct BinaryMarshaller;

impl BinaryMarshaller {
    fn sample_frame_len(buf: &[u8], header: &Header) -> Result<Option<usize>, MarshalError> {
        // marker + timestamp
        let mut len = 1 + 8;
        if header.has_tags() {
            if buf.len() < len + 4 {
                return Ok(None);
            }
            let tag_len =
                u32::from_be_bytes([buf[len], buf[len + 1], buf[len + 2], buf[len + 3]]) as usize;
            len += 4 + tag_len;
        }
        len += 8 * header.num_fields();
        Ok(Some(len))
    }
}

impl Marshaller for BinaryMarshaller {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn write_header(&self, header: &Header, out: &mut Vec<u8>) -> Result<(), MarshalError> {
        out.push(HEADER_MARKER);
        out.extend_from_slice(TIME_COLUMN.as_bytes());
        if header.has_tags() {
            out.push(SEPARATOR);
            out.extend_from_slice(TAGS_COLUMN.as_bytes());
        }
        for name in header.fields() {
            out.push(SEPARATOR);
            out.extend_from_slice(name.as_bytes());
        }
        out.push(NEWLINE);
        Ok(())
    }

    fn write_sample(
        &self,
        sample: &Sample,
        header: &Header,
        out: &mut Vec<u8>,
    ) -> Result<(), MarshalError> {
        header.check_sample(sample)?;
        let nanos = sample
            .time
            .timestamp_nanos_opt()
            .ok_or_else(|| MarshalError::bad_frame("timestamp outside nanosecond range"))?;
        out.push(SAMPLE_MARKER);
        out.extend_from_slice(&nanos.to_be_bytes());
        if header.has_tags() {
            let tags = sample.tag_string();
            out.extend_from_slice(&(tags.len() as u32).to_be_bytes());
            out.extend_from_slice(tags.as_bytes());
        }
        for value in &sample.values {
            out.extend_from_slice(&value.to_be_bytes());
        }
        Ok(())
    }

    fn read_header(&self, frame: &[u8]) -> Result<Header, MarshalError> {
        let body = frame
            .strip_prefix(&[HEADER_MARKER])
            .ok_or_else(|| MarshalError::bad_frame("missing header marker"))?;
        let line = std::str::from_utf8(body)
            .map_err(|_| MarshalError::bad_frame("header is not valid UTF-8"))?;
        let line = line.strip_suffix('\n').unwrap_or(line);
        let mut columns = line.split(SEPARATOR as char);
        if columns.next() != Some(TIME_COLUMN) {
            return Err(MarshalError::bad_frame(format!(
                "first column must be '{TIME_COLUMN}'"
            )));
        }
        let columns: Vec<&str> = columns.collect();
        let has_tags = columns.first().copied() == Some(TAGS_COLUMN);
        let start = if has_tags { 1 } else { 0 };
        let fields = columns[start..].iter().map(|s| s.to_string()).collect();
        Ok(if has_tags {
            Header::new(fields)
        } else {
            Header::without_tags(fields)
        })
    }

    fn read_sample(&self, header: &Header, frame: &[u8]) -> Result<Sample, MarshalError> {
        let expected = Self::sample_frame_len(frame, header)?
            .ok_or_else(|| MarshalError::bad_frame("truncated sample frame"))?;
        if frame.len() != expected || frame.first() != Some(&SAMPLE_MARKER) {
            return Err(MarshalError::bad_frame("damaged sample frame"));
        }

        let nanos = i64::from_be_bytes(frame[1..9].try_into().unwrap());
        let time: DateTime<Utc> = DateTime::from_timestamp(
            nanos.div_euclid(1_000_000_000),
            nanos.rem_euclid(1_000_000_000) as u32,
        )
        .ok_or_else(|| MarshalError::bad_frame("timestamp out of range"))?;
        let mut sample = Sample::new(time, Vec::with_capacity(header.num_fields()));

        let mut offset = 9;
        if header.has_tags() {
            let tag_len =
                u32::from_be_bytes(frame[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            let tags = std::str::from_utf8(&frame[offset..offset + tag_len])
                .map_err(|_| MarshalError::bad_frame("tag string is not valid UTF-8"))?;
            sample.parse_tag_string(tags)?;
            offset += tag_len;
        }

        for chunk in frame[offset..].chunks_exact(8) {
            sample
                .values
                .push(f64::from_be_bytes(chunk.try_into().unwrap()));
        }
        Ok(sample)
    }

    fn is_header_frame(&self, frame: &[u8]) -> bool {
        frame.first() == Some(&HEADER_MARKER)
    }

    fn scan_frame(
        &self,
        buf: &[u8],
        header: Option<&Header>,
        at_eof: bool,
    ) -> Result<Option<usize>, MarshalError> {
        let incomplete = |frame: &str| -> Result<Option<usize>, MarshalError> {
            if at_eof {
                Err(MarshalError::bad_frame(format!(
                    "stream ended inside a {frame} frame"
                )))
            } else {
                Ok(None)
            }
        };

        match buf.first() {
            None => Ok(None),
            Some(&HEADER_MARKER) => match buf.iter().position(|&b| b == NEWLINE) {
                Some(idx) => Ok(Some(idx + 1)),
                None => incomplete("header"),
            },
            Some(&SAMPLE_MARKER) => {
                let header = header.ok_or_else(|| {
                    MarshalError::bad_frame("sample frame before any header")
                })?;
                match Self::sample_frame_len(buf, header)? {
                    Some(len) if buf.len() >= len => Ok(Some(len)),
                    _ => incomplete("sample"),
                }
            }
            Some(&other) => Err(MarshalError::bad_frame(format!(
                "unknown frame marker 0x{other:02x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::testutil::{assert_round_trip, sample_fixture};

    #[test]
    fn test_binary_round_trip() {
        let (header, sample) = sample_fixture();
        assert_round_trip(&BinaryMarshaller, &header, &sample);
    }

    #[test]
    fn test_binary_round_trip_without_tags() {
        let (header, mut sample) = sample_fixture();
        let header = Header::without_tags(header.fields().to_vec());
        sample.tags = Default::default();
        assert_round_trip(&BinaryMarshaller, &header, &sample);
    }

    #[test]
    fn test_binary_header_frame_layout() {
        let header = Header::new(vec!["a".into(), "b".into()]);
        let mut buf = Vec::new();
        BinaryMarshaller.write_header(&header, &mut buf).unwrap();
        assert_eq!(buf, b"Htime,tags,a,b\n");
    }

    #[test]
    fn test_binary_sample_frame_length() {
        let (header, sample) = sample_fixture();
        let mut buf = Vec::new();
        BinaryMarshaller
            .write_sample(&sample, &header, &mut buf)
            .unwrap();
        // marker + time + tag length + "host=h1" + two values
        assert_eq!(buf.len(), 1 + 8 + 4 + 7 + 16);
        assert_eq!(buf[0], b'S');
    }

    #[test]
    fn test_binary_scan_needs_header_for_samples() {
        let err = BinaryMarshaller
            .scan_frame(b"S\x00\x00", None, false)
            .unwrap_err();
        assert!(err.to_string().contains("before any header"));
    }

    #[test]
    fn test_binary_scan_partial_frames() {
        let (header, sample) = sample_fixture();
        let mut buf = Vec::new();
        BinaryMarshaller
            .write_sample(&sample, &header, &mut buf)
            .unwrap();

        for end in 1..buf.len() {
            assert_eq!(
                BinaryMarshaller
                    .scan_frame(&buf[..end], Some(&header), false)
                    .unwrap(),
                None,
                "frame should be incomplete at {end} bytes"
            );
        }
        assert_eq!(
            BinaryMarshaller
                .scan_frame(&buf, Some(&header), false)
                .unwrap(),
            Some(buf.len())
        );
    }

    #[test]
    fn test_binary_truncated_at_eof_is_framing_error() {
        let (header, sample) = sample_fixture();
        let mut buf = Vec::new();
        BinaryMarshaller
            .write_sample(&sample, &header, &mut buf)
            .unwrap();
        let err = BinaryMarshaller
            .scan_frame(&buf[..buf.len() - 1], Some(&header), true)
            .unwrap_err();
        assert!(matches!(err, MarshalError::BadFrame { .. }));
    }

    #[test]
    fn test_binary_unknown_marker() {
        let err = BinaryMarshaller.scan_frame(b"Xyz", None, false).unwrap_err();
        assert!(err.to_string().contains("unknown frame marker"));
    }

    #[test]
    fn test_binary_schema_mismatch_on_write() {
        let (header, mut sample) = sample_fixture();
        sample.values.pop();
        let err = BinaryMarshaller
            .write_sample(&sample, &header, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, MarshalError::SchemaMismatch { .. }));
    }
}
