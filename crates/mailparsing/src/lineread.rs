use std::io::Read;

const DEFAULT_PUSHBACK: usize = 1024;
const READ_CHUNK: usize = 4096;

/// Byte-oriented reader that yields one line at a time, where a line
/// ends at CRLF or bare LF. The terminator is included in the returned
/// bytes: callers need it to tell a blank header-end line from a folded
/// continuation. `unread` pushes bytes back so the boundary scanner can
/// peek at a closing boundary without losing it.
pub struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_PUSHBACK)
    }

    pub fn with_capacity(inner: R, pushback: usize) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(pushback.max(DEFAULT_PUSHBACK)),
            eof: false,
        }
    }

    /// The next line including its terminator, or None at EOF.
    /// A final line with no terminator is returned as-is.
    pub fn read_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(i) = memchr::memchr(b'\n', &self.buffer) {
                let line = self.buffer[..=i].to_vec();
                self.buffer.drain(..=i);
                return Ok(Some(line));
            }
            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buffer);
                return Ok(Some(line));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let size = self.inner.read(&mut chunk)?;
            if size == 0 {
                self.eof = true;
            } else {
                self.buffer.extend_from_slice(&chunk[..size]);
            }
        }
    }

    /// Push bytes back so the next read_line sees them first
    pub fn unread(&mut self, bytes: &[u8]) {
        self.buffer.splice(0..0, bytes.iter().copied());
    }

    /// Everything remaining in the stream, in one buffer
    pub fn read_to_end(&mut self) -> std::io::Result<Vec<u8>> {
        let mut remainder = std::mem::take(&mut self.buffer);
        if !self.eof {
            self.inner.read_to_end(&mut remainder)?;
            self.eof = true;
        }
        Ok(remainder)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn reader(data: &[u8]) -> LineReader<std::io::Cursor<Vec<u8>>> {
        LineReader::new(std::io::Cursor::new(data.to_vec()))
    }

    #[test]
    fn terminators_included() {
        let mut r = reader(b"one\r\ntwo\nthree");
        assert_equal!(r.read_line().unwrap().unwrap(), b"one\r\n".to_vec());
        assert_equal!(r.read_line().unwrap().unwrap(), b"two\n".to_vec());
        assert_equal!(r.read_line().unwrap().unwrap(), b"three".to_vec());
        assert_equal!(r.read_line().unwrap(), None);
    }

    #[test]
    fn pushback() {
        let mut r = reader(b"alpha\r\nbeta\r\n");
        let line = r.read_line().unwrap().unwrap();
        assert_equal!(line, b"alpha\r\n".to_vec());
        r.unread(&line);
        assert_equal!(r.read_line().unwrap().unwrap(), b"alpha\r\n".to_vec());
        assert_equal!(r.read_line().unwrap().unwrap(), b"beta\r\n".to_vec());
    }

    #[test]
    fn pushback_of_at_least_1024() {
        let big = vec![b'x'; 1024];
        let mut r = reader(b"tail\r\n");
        r.unread(&big);
        let mut line = r.read_line().unwrap().unwrap();
        assert_equal!(line.len(), 1024 + 6);
        line.truncate(4);
        assert_equal!(line, b"xxxx".to_vec());
    }

    #[test]
    fn read_to_end_drains_pushback_first() {
        let mut r = reader(b"body bytes");
        r.unread(b"pushed ");
        assert_equal!(r.read_to_end().unwrap(), b"pushed body bytes".to_vec());
        assert_equal!(r.read_line().unwrap(), None);
    }
}
