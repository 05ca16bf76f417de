//! CSV wire format.
//!
//! Line-oriented, comma-separated, `\n`-terminated. The first column is the
//! timestamp, the second the tag string iff the header declares tags, then
//! one column per field. A header line starts with the reserved `time`
//! column name, which no timestamp can collide with.

use crate::error::MarshalError;
use crate::sample::{
    format_time, parse_time, Header, Sample, TAGS_COLUMN, TIME_COLUMN,
};

use super::Marshaller;

const SEPARATOR: u8 = b',';
const NEWLINE: u8 = b'\n';

/// The CSV sample codec.
pub struct CsvMarshaller;

impl CsvMarshaller {
    fn split_line(frame: &[u8]) -> Result<Vec<&str>, MarshalError> {
        let line = std::str::from_utf8(frame)
            .map_err(|_| MarshalError::bad_frame("line is not valid UTF-8"))?;
        let line = line.strip_suffix('\n').unwrap_or(line);
        Ok(line.split(SEPARATOR as char).collect())
    }
}

impl Marshaller for CsvMarshaller {
    fn name(&self) -> &'static str {
        "CSV"
    }

    fn write_header(&self, header: &Header, out: &mut Vec<u8>) -> Result<(), MarshalError> {
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
        out.extend_from_slice(format_time(&sample.time).as_bytes());
        if header.has_tags() {
            out.push(SEPARATOR);
            out.extend_from_slice(sample.tag_string().as_bytes());
        }
        for value in &sample.values {
            out.push(SEPARATOR);
            out.extend_from_slice(value.to_string().as_bytes());
        }
        out.push(NEWLINE);
        Ok(())
    }

    fn read_header(&self, frame: &[u8]) -> Result<Header, MarshalError> {
        let cells = Self::split_line(frame)?;
        if cells.first().copied() != Some(TIME_COLUMN) {
            return Err(MarshalError::bad_frame(format!(
                "first column must be '{TIME_COLUMN}'"
            )));
        }
        let has_tags = cells.get(1).copied() == Some(TAGS_COLUMN);
        let start = if has_tags { 2 } else { 1 };
        let fields = cells[start..].iter().map(|s| s.to_string()).collect();
        Ok(if has_tags {
            Header::new(fields)
        } else {
            Header::without_tags(fields)
        })
    }

    fn read_sample(&self, header: &Header, frame: &[u8]) -> Result<Sample, MarshalError> {
        let cells = Self::split_line(frame)?;
        let time = parse_time(cells.first().copied().unwrap_or_default())?;
        let mut sample = Sample::new(time, Vec::with_capacity(header.num_fields()));

        let mut start = 1;
        if header.has_tags() {
            let tags = cells
                .get(1)
                .copied()
                .ok_or_else(|| MarshalError::bad_frame("sample line too short for tags"))?;
            sample.parse_tag_string(tags)?;
            start = 2;
        }

        for cell in &cells[start.min(cells.len())..] {
            let value: f64 = cell
                .parse()
                .map_err(|_| MarshalError::bad_frame(format!("invalid value '{cell}'")))?;
            sample.values.push(value);
        }
        header.check_sample(&sample)?;
        Ok(sample)
    }

    fn is_header_frame(&self, frame: &[u8]) -> bool {
        let prefix = TIME_COLUMN.as_bytes();
        frame.starts_with(prefix)
            && matches!(frame.get(prefix.len()), None | Some(&NEWLINE) | Some(&SEPARATOR))
    }

    fn scan_frame(
        &self,
        buf: &[u8],
        _header: Option<&Header>,
        at_eof: bool,
    ) -> Result<Option<usize>, MarshalError> {
        match buf.iter().position(|&b| b == NEWLINE) {
            Some(idx) => Ok(Some(idx + 1)),
            None if buf.is_empty() => Ok(None),
            None if at_eof => Err(MarshalError::bad_frame("stream ended mid-line")),
            None => Ok(None),
        }
    }
}
