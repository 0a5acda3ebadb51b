use std::fmt;

use crate::error::ChannelError;
use crate::transport::Transport;

/// Size of the channel's staging buffer. Peeks are limited to this many bytes.
pub const IO_BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Read,
    Write,
}

/// Buffered, big-endian byte channel over a [`Transport`].
///
/// Writes never report failure directly: the first transport error is recorded as the sticky
/// [`Channel::error`] and every later write is dropped. Callers check the error once at the end of
/// a save (or at any convenient boundary). Reads return `Result` and also record their failure.
///
/// A channel is owned by exactly one save or load operation.
pub struct Channel {
    transport: Box<dyn Transport>,
    mode: ChannelMode,
    // Stream offset just past the bytes handed to (write) or received from (read) the transport.
    pos: u64,
    buf: Box<[u8]>,
    buf_index: usize,
    buf_size: usize,
    eof: bool,
    bytes_xfer: u64,
    xfer_limit: u64,
    last_error: Option<ChannelError>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("mode", &self.mode)
            .field("pos", &self.pos)
            .field("buf_index", &self.buf_index)
            .field("buf_size", &self.buf_size)
            .field("bytes_xfer", &self.bytes_xfer)
            .field("xfer_limit", &self.xfer_limit)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new_writer(transport: impl Transport + 'static) -> Self {
        Self::new(Box::new(transport), ChannelMode::Write)
    }

    pub fn new_reader(transport: impl Transport + 'static) -> Self {
        Self::new(Box::new(transport), ChannelMode::Read)
    }

    pub fn new(transport: Box<dyn Transport>, mode: ChannelMode) -> Self {
        Self {
            transport,
            mode,
            pos: 0,
            buf: vec![0u8; IO_BUF_SIZE].into_boxed_slice(),
            buf_index: 0,
            buf_size: 0,
            eof: false,
            bytes_xfer: 0,
            xfer_limit: 0,
            last_error: None,
        }
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn error(&self) -> Option<&ChannelError> {
        self.last_error.as_ref()
    }

    pub fn check_error(&self) -> Result<(), ChannelError> {
        match &self.last_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record `err` unless an earlier error is already recorded.
    pub fn set_error(&mut self, err: ChannelError) {
        if self.last_error.is_none() {
            tracing::debug!(%err, "channel error recorded");
            self.last_error = Some(err);
        }
    }

    /// Current logical stream offset.
    pub fn tell(&self) -> u64 {
        match self.mode {
            ChannelMode::Write => self.pos + self.buf_index as u64,
            ChannelMode::Read => self.pos - (self.buf_size - self.buf_index) as u64,
        }
    }

    pub fn set_rate_limit(&mut self, limit: u64) {
        self.xfer_limit = limit;
    }

    pub fn rate_limit(&self) -> u64 {
        self.xfer_limit
    }

    /// True once the bytes written since the last [`Channel::reset_rate_limit`] exceed the limit,
    /// or the channel has failed. A limit of zero never throttles.
    pub fn rate_limit_exceeded(&self) -> bool {
        if self.last_error.is_some() {
            return true;
        }
        self.xfer_limit > 0 && self.bytes_xfer > self.xfer_limit
    }

    pub fn reset_rate_limit(&mut self) {
        self.bytes_xfer = 0;
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_xfer
    }

    pub fn flush(&mut self) {
        if self.mode != ChannelMode::Write || self.buf_index == 0 {
            return;
        }
        if self.last_error.is_some() {
            self.buf_index = 0;
            return;
        }

        let mut offset = 0;
        while offset < self.buf_index {
            match self
                .transport
                .put_buffer(self.pos, &self.buf[offset..self.buf_index])
            {
                Ok(0) => {
                    self.set_error(ChannelError::Io {
                        kind: std::io::ErrorKind::WriteZero,
                        message: "transport accepted no bytes".to_string(),
                    });
                    break;
                }
                Ok(n) => {
                    offset += n;
                    self.pos += n as u64;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.set_error(err.into());
                    break;
                }
            }
        }
        self.buf_index = 0;
    }

    pub fn put_buffer(&mut self, mut data: &[u8]) {
        if self.last_error.is_some() {
            return;
        }
        if self.mode != ChannelMode::Write {
            self.set_error(ChannelError::WrongMode("writing"));
            return;
        }

        self.bytes_xfer += data.len() as u64;
        while !data.is_empty() {
            let n = data.len().min(IO_BUF_SIZE - self.buf_index);
            self.buf[self.buf_index..self.buf_index + n].copy_from_slice(&data[..n]);
            self.buf_index += n;
            data = &data[n..];
            if self.buf_index == IO_BUF_SIZE {
                self.flush();
                if self.last_error.is_some() {
                    return;
                }
            }
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.put_buffer(&[v]);
    }

    pub fn put_be16(&mut self, v: u16) {
        self.put_buffer(&v.to_be_bytes());
    }

    pub fn put_be32(&mut self, v: u32) {
        self.put_buffer(&v.to_be_bytes());
    }

    pub fn put_be64(&mut self, v: u64) {
        self.put_buffer(&v.to_be_bytes());
    }

    /// Write a 1-byte length prefix followed by the raw bytes of `s`.
    pub fn put_counted_string(&mut self, s: &str) {
        match u8::try_from(s.len()) {
            Ok(len) => {
                self.put_u8(len);
                self.put_buffer(s.as_bytes());
            }
            Err(_) => self.set_error(ChannelError::Failed(format!(
                "counted string of {} bytes does not fit a 1-byte length",
                s.len()
            ))),
        }
    }

    fn ensure_readable(&mut self) -> Result<(), ChannelError> {
        self.check_error()?;
        if self.mode != ChannelMode::Read {
            let err = ChannelError::WrongMode("reading");
            self.set_error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    // Shift the unconsumed tail to the front and top the buffer up from the transport.
    // Returns the number of new bytes.
    fn fill_buffer(&mut self) -> usize {
        if self.last_error.is_some() || self.eof {
            return 0;
        }

        let pending = self.buf_size - self.buf_index;
        if pending > 0 {
            self.buf.copy_within(self.buf_index..self.buf_size, 0);
        }
        self.buf_index = 0;
        self.buf_size = pending;
        if pending == IO_BUF_SIZE {
            return 0;
        }

        loop {
            match self.transport.get_buffer(self.pos, &mut self.buf[pending..]) {
                Ok(0) => {
                    self.eof = true;
                    return 0;
                }
                Ok(n) => {
                    self.buf_size += n;
                    self.pos += n as u64;
                    return n;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.set_error(err.into());
                    return 0;
                }
            }
        }
    }

    fn unexpected_eof(&mut self) -> ChannelError {
        if let Some(err) = &self.last_error {
            return err.clone();
        }
        self.set_error(ChannelError::UnexpectedEof);
        ChannelError::UnexpectedEof
    }

    /// Look at up to `len` bytes starting `offset` bytes past the read cursor without consuming
    /// them. The returned slice is shorter than `len` only at end of stream.
    pub fn peek_buffer(&mut self, len: usize, offset: usize) -> Result<&[u8], ChannelError> {
        self.ensure_readable()?;
        if offset
            .checked_add(len)
            .map_or(true, |end| end > IO_BUF_SIZE)
        {
            return Err(ChannelError::PeekTooLarge { len, offset });
        }

        while self.buf_index + offset + len > self.buf_size {
            if self.fill_buffer() == 0 {
                break;
            }
        }
        self.check_error()?;

        let start = (self.buf_index + offset).min(self.buf_size);
        let end = (self.buf_index + offset + len).min(self.buf_size);
        Ok(&self.buf[start..end])
    }

    /// Peek a single byte; `None` at end of stream or on error.
    pub fn peek_u8(&mut self, offset: usize) -> Option<u8> {
        self.peek_buffer(1, offset)
            .ok()
            .and_then(|bytes| bytes.first().copied())
    }

    pub fn get_buffer(&mut self, out: &mut [u8]) -> Result<(), ChannelError> {
        self.ensure_readable()?;

        let mut done = 0;
        while done < out.len() {
            if self.buf_index == self.buf_size && self.fill_buffer() == 0 {
                return Err(self.unexpected_eof());
            }
            let n = (out.len() - done).min(self.buf_size - self.buf_index);
            out[done..done + n].copy_from_slice(&self.buf[self.buf_index..self.buf_index + n]);
            self.buf_index += n;
            done += n;
        }
        Ok(())
    }

    /// Consume `len` bytes without looking at them.
    pub fn skip(&mut self, mut len: usize) -> Result<(), ChannelError> {
        self.ensure_readable()?;

        while len > 0 {
            if self.buf_index == self.buf_size && self.fill_buffer() == 0 {
                return Err(self.unexpected_eof());
            }
            let n = len.min(self.buf_size - self.buf_index);
            self.buf_index += n;
            len -= n;
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, ChannelError> {
        let mut buf = [0u8; 1];
        self.get_buffer(&mut buf)?;
        Ok(buf[0])
    }

    pub fn get_be16(&mut self) -> Result<u16, ChannelError> {
        let mut buf = [0u8; 2];
        self.get_buffer(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn get_be32(&mut self) -> Result<u32, ChannelError> {
        let mut buf = [0u8; 4];
        self.get_buffer(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn get_be64(&mut self) -> Result<u64, ChannelError> {
        let mut buf = [0u8; 8];
        self.get_buffer(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Read a 1-byte length prefix and that many bytes. Invalid UTF-8 is replaced rather than
    /// rejected; the caller decides whether the name is meaningful.
    pub fn get_counted_string(&mut self) -> Result<String, ChannelError> {
        let len = self.get_u8()? as usize;
        let mut bytes = vec![0u8; len];
        self.get_buffer(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Flush, close the transport and report the sticky error in preference to the transport's
    /// own close result.
    pub fn close(mut self) -> Result<(), ChannelError> {
        self.flush();
        let close_result = self.transport.close();
        if let Some(err) = self.last_error.take() {
            return Err(err);
        }
        close_result.map_err(ChannelError::from)
    }
}
