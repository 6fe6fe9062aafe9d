use std::io::{self, BufRead, Write};

/// One input line with its terminator stripped.
///
/// Equality and ordering are plain byte comparisons, so two lines that differ only in
/// invisible characters stay distinct. No encoding validation is done.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Line(Box<[u8]>);

impl Line {
    /// Builds a line from a raw input record, dropping a trailing `\n` together with any
    /// `\r` bytes right before it. A record without a terminator (last line of a file)
    /// only loses trailing `\r` bytes.
    pub fn normalize(raw: &[u8]) -> Self {
        Self(strip_terminator(raw).into())
    }

    /// Builds a line from a record this codec wrote itself: exactly one `\n` is removed.
    pub fn from_serialized(record: &[u8]) -> Self {
        let body = record.strip_suffix(b"\n").unwrap_or(record);
        Self(body.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Size of the line once written, terminator included.
    pub fn serialized_len(&self) -> usize {
        self.0.len() + 1
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_len());
        bytes.extend_from_slice(&self.0);
        bytes.push(b'\n');
        bytes
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.0)?;
        writer.write_all(b"\n")
    }
}

impl From<&str> for Line {
    fn from(text: &str) -> Self {
        Self::normalize(text.as_bytes())
    }
}

fn strip_terminator(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    while end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    &raw[..end]
}

/// Reads one `\n`-delimited record (terminator included) into `buf`, returning the number
/// of raw bytes consumed. Zero means end of input.
pub fn read_record<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize> {
    buf.clear();
    reader.read_until(b'\n', buf)
}
