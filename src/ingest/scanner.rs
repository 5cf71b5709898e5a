use std::io;

/// A forward-only, peekable cursor over a byte slice.
///
/// All of the token-level primitives the record parsers need live here:
/// whitespace skipping, delimiter scans, and numeric reads. The cursor only
/// ever moves forward, except through `seek`, which may rewind to a position
/// previously obtained from `pos` (the parsers use this to re-parse the
/// detail text of scheduler records).
pub(crate) struct ByteScanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteScanner<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        ByteScanner { buf, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    /// Rewinds (or advances) to a position previously observed via `pos`.
    pub(crate) fn seek(&mut self, pos: usize) {
        debug_assert!(pos <= self.buf.len());
        self.pos = pos;
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub(crate) fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Skips spaces and tabs, staying on the current line.
    pub(crate) fn skip_spaces(&mut self) {
        while let Some(b' ') | Some(b'\t') = self.peek() {
            self.pos += 1;
        }
    }

    /// Skips spaces, tabs, and line breaks. Does not consume NUL bytes;
    /// a NUL is a truncation marker, not inter-record padding.
    pub(crate) fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                _ => break,
            }
        }
    }

    /// Consumes bytes while `keep` holds, returning the consumed subslice.
    pub(crate) fn read_while<F>(&mut self, mut keep: F) -> &'a [u8]
    where
        F: FnMut(u8) -> bool,
    {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !keep(b) {
                break;
            }
            self.pos += 1;
        }
        &self.buf[start..self.pos]
    }

    /// Advances to the next occurrence of `target` on the current line.
    /// Fails if the line (or the input) ends first.
    pub(crate) fn skip_to(&mut self, target: u8) -> io::Result<()> {
        while let Some(b) = self.peek() {
            if b == target {
                return Ok(());
            }
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        invalid_data_error!("expected `{}` before end of line", target as char)
    }

    /// Consumes `expected` or fails with the byte actually found.
    pub(crate) fn expect(&mut self, expected: u8) -> io::Result<()> {
        match self.peek() {
            Some(b) if b == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => invalid_data_error!(
                "expected `{}` but found `{}`",
                expected as char,
                b as char
            ),
            None => invalid_data_error!("expected `{}` but found end of input", expected as char),
        }
    }

    /// Reads a decimal unsigned integer.
    pub(crate) fn read_uint(&mut self) -> io::Result<u64> {
        let digits = self.read_while(|b| b.is_ascii_digit());
        if digits.is_empty() {
            return invalid_data_error!("expected a decimal integer");
        }
        let mut value: u64 = 0;
        for &d in digits {
            value = match value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(d - b'0')))
            {
                Some(v) => v,
                None => {
                    return invalid_data_error!(
                        "integer `{}` is out of range",
                        String::from_utf8_lossy(digits)
                    )
                }
            };
        }
        Ok(value)
    }

    /// Reads a decimal number with an optional fractional part.
    pub(crate) fn read_float(&mut self) -> io::Result<f64> {
        let text = self.read_while(|b| b.is_ascii_digit() || b == b'.');
        if text.is_empty() {
            return invalid_data_error!("expected a number");
        }
        match std::str::from_utf8(text).ok().and_then(|t| t.parse().ok()) {
            Some(value) => Ok(value),
            None => invalid_data_error!("malformed number `{}`", String::from_utf8_lossy(text)),
        }
    }

    /// Consumes the rest of the current line, including its newline, and
    /// returns the line content without the line terminator.
    pub(crate) fn rest_of_line(&mut self) -> &'a [u8] {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        let mut end = self.pos;
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }
        if end > start && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        &self.buf[start..end]
    }

    /// Whether the cursor sits on a sample boundary: the end of the input,
    /// or (immediately after a consumed newline) another newline, a carriage
    /// return, or a NUL truncation marker.
    ///
    /// The final record of a file carries no trailing blank line; treating
    /// end-of-input as a boundary keeps it valid.
    pub(crate) fn at_end_of_sample(&self) -> bool {
        matches!(self.peek(), None | Some(b'\n') | Some(b'\r') | Some(0))
    }

    /// Consumes input up to (but not past) the next sample boundary. A
    /// cursor already sitting on a boundary does not move; a record with no
    /// stack lines ends at the line its header ended on.
    pub(crate) fn skip_to_end_of_sample(&mut self) {
        if self.at_end_of_sample() {
            return;
        }
        while let Some(b) = self.bump() {
            if b == b'\n' && self.at_end_of_sample() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn numeric_reads() {
        let mut s = ByteScanner::new(b"123/456 78.5: x");
        assert_eq!(s.read_uint().unwrap(), 123);
        s.expect(b'/').unwrap();
        assert_eq!(s.read_uint().unwrap(), 456);
        s.skip_spaces();
        assert_eq!(s.read_float().unwrap(), 78.5);
        s.expect(b':').unwrap();
    }

    #[test]
    fn numeric_reads_fail_without_digits() {
        let mut s = ByteScanner::new(b"abc");
        assert!(s.read_uint().is_err());
        assert!(s.read_float().is_err());
    }

    #[test]
    fn rest_of_line_strips_terminators() {
        let mut s = ByteScanner::new(b"first\r\nsecond");
        assert_eq!(s.rest_of_line(), b"first");
        assert_eq!(s.rest_of_line(), b"second");
        assert_eq!(s.rest_of_line(), b"");
    }

    #[test]
    fn end_of_sample_detection() {
        // A blank line, a carriage return, a NUL, and end of input all end
        // a sample; a regular line does not.
        for (input, expected) in [
            (&b"line\n\nnext"[..], true),
            (&b"line\n\rnext"[..], true),
            (&b"line\n\0"[..], true),
            (&b"line\n"[..], true),
            (&b"line\nnext"[..], false),
        ] {
            let mut s = ByteScanner::new(input);
            s.rest_of_line();
            assert_eq!(s.at_end_of_sample(), expected, "input {:?}", input);
        }
    }

    #[test]
    fn skip_to_end_of_sample_stops_at_boundary() {
        let mut s = ByteScanner::new(b"a\nb\nc\n\nnext 1");
        s.skip_to_end_of_sample();
        assert_eq!(s.peek(), Some(b'\n'));
        s.skip_whitespace();
        assert_eq!(s.peek(), Some(b'n'));
    }

    #[test]
    fn skip_to_end_of_sample_is_a_noop_on_a_boundary() {
        // After consuming the only line of a frameless record the cursor
        // already sits on the boundary; skipping must not eat into the
        // next record.
        let mut s = ByteScanner::new(b"header\n\nnext 1\n");
        s.rest_of_line();
        let boundary = s.pos();
        s.skip_to_end_of_sample();
        assert_eq!(s.pos(), boundary);
    }

    #[test]
    fn read_uint_rejects_out_of_range_values() {
        let mut s = ByteScanner::new(b"99999999999999999999999");
        assert!(s.read_uint().is_err());
    }

    #[test]
    fn skip_whitespace_leaves_nul_in_place() {
        let mut s = ByteScanner::new(b"  \n\0rest");
        s.skip_whitespace();
        assert_eq!(s.peek(), Some(0));
    }

    #[test]
    fn seek_rewinds_to_mark() {
        let mut s = ByteScanner::new(b"prev_comm=x\n");
        let mark = s.pos();
        s.rest_of_line();
        s.seek(mark);
        assert_eq!(s.read_while(|b| b != b'='), b"prev_comm");
    }
}
