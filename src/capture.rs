use std::io::{self, Write};

use tracing::{warn, Span};

/// Default cap for diagnostic output kept in memory per job.
pub const DEFAULT_OUTPUT_LIMIT: usize = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
#[error("output buffer overflow: write of {attempted} bytes exceeds remaining capacity of {remaining} bytes")]
pub struct CaptureOverflow {
    pub attempted: usize,
    pub remaining: usize,
}

/// A writer that refuses any write which would take it past its limit.
///
/// A refused write writes nothing; later writes that still fit are accepted.
pub struct LimitedWriter<W: Write> {
    inner: W,
    remaining: usize,
}

impl<W: Write> LimitedWriter<W> {
    pub const fn new(inner: W, limit: usize) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.remaining {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                CaptureOverflow {
                    attempted: buf.len(),
                    remaining: self.remaining,
                },
            ));
        }

        let written = self.inner.write(buf)?;
        self.remaining -= written;

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Sends encoder diagnostics to a file and to a bounded in-memory buffer.
///
/// Only failures of the file side are reported to the caller. Once the buffer
/// overflows it stops receiving data and the capture is marked as truncated.
pub struct OutputTee<F: Write> {
    file: F,
    buffer: LimitedWriter<Vec<u8>>,
    truncated: bool,
    span: Span,
}

impl<F: Write> OutputTee<F> {
    pub fn new(file: F, limit: usize, span: Span) -> Self {
        Self {
            file,
            buffer: LimitedWriter::new(Vec::new(), limit),
            truncated: false,
            span,
        }
    }

    #[must_use]
    pub const fn truncated(&self) -> bool {
        self.truncated
    }

    /// Returns the captured output and whether it was truncated. The file side
    /// is dropped, so flush first to observe write errors.
    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.buffer.into_inner(), self.truncated)
    }
}

impl<F: Write> Write for OutputTee<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;

        if !self.truncated {
            if let Err(err) = self.buffer.write_all(buf) {
                warn!(parent: &self.span, "Encoder output capture truncated: {err}");
                self.truncated = true;
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_within_limit_pass_through() {
        let mut writer = LimitedWriter::new(Vec::new(), 8);

        assert_eq!(writer.write(b"1234").unwrap(), 4);
        assert_eq!(writer.write(b"5678").unwrap(), 4);
        assert_eq!(writer.into_inner(), b"12345678");
    }

    #[test]
    fn write_past_limit_overflows() {
        let mut writer = LimitedWriter::new(Vec::new(), 4);
        writer.write_all(b"abc").unwrap();

        let err = writer.write(b"de").unwrap_err();
        let overflow = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<CaptureOverflow>())
            .unwrap();

        assert_eq!(overflow.attempted, 2);
        assert_eq!(overflow.remaining, 1);

        // A write that still fits is accepted afterwards.
        assert_eq!(writer.write(b"f").unwrap(), 1);
        assert_eq!(writer.into_inner(), b"abcf");
    }

    #[test]
    fn empty_write_to_exhausted_writer_succeeds() {
        let mut writer = LimitedWriter::new(Vec::new(), 0);
        assert_eq!(writer.write(b"").unwrap(), 0);
        assert!(writer.write(b"x").is_err());
    }

    #[test]
    fn tee_keeps_writing_the_file_after_overflow() {
        let mut file = Vec::new();
        let mut tee = OutputTee::new(&mut file, 5, Span::none());

        tee.write_all(b"hello").unwrap();
        assert!(!tee.truncated());
        tee.write_all(b" world").unwrap();
        assert!(tee.truncated());
        tee.write_all(b"!").unwrap();

        tee.flush().unwrap();
        let (captured, truncated) = tee.into_parts();
        assert_eq!(captured, b"hello");
        assert!(truncated);
        assert_eq!(file, b"hello world!");
    }

    proptest::proptest! {
        #[test]
        fn accepted_bytes_never_exceed_limit(
            chunks in proptest::collection::vec(proptest::collection::vec(proptest::num::u8::ANY, 0..64), 0..16),
            limit in 0_usize..256,
        ) {
            let mut writer = LimitedWriter::new(Vec::new(), limit);
            let mut expected = Vec::new();

            for chunk in &chunks {
                if writer.write(chunk).is_ok() {
                    expected.extend_from_slice(chunk);
                }
            }

            let written = writer.into_inner();
            proptest::prop_assert!(written.len() <= limit);
            proptest::prop_assert_eq!(written, expected);
        }
    }
}
