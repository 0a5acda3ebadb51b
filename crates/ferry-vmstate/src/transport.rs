//! Byte-stream backends that a [`crate::Channel`] buffers over.
//!
//! A transport only has to move bytes; buffering, error stickiness and rate limiting all live in
//! the channel. Backends that can only move bytes in one direction keep the default
//! implementation for the other one.

use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

pub trait Transport {
    /// Read up to `buf.len()` bytes starting at stream offset `pos`.
    ///
    /// Returning `Ok(0)` signals end of stream.
    fn get_buffer(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let _ = (pos, buf);
        Ok(0)
    }

    /// Write `buf` at stream offset `pos`, returning the number of bytes accepted.
    fn put_buffer(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        let _ = pos;
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory transport.
///
/// Clones share the same backing buffer, which lets a caller keep a handle to the bytes while a
/// channel owns the other clone. Writes always append; reads honour the stream offset.
#[derive(Debug, Clone, Default)]
pub struct MemTransport {
    data: Rc<RefCell<Vec<u8>>>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Rc::new(RefCell::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    /// Remove and return everything written so far.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.borrow_mut())
    }
}

impl Transport for MemTransport {
    fn get_buffer(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.borrow();
        let start = match usize::try_from(pos) {
            Ok(start) if start < data.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn put_buffer(&mut self, _pos: u64, buf: &[u8]) -> io::Result<usize> {
        self.data.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Read-only transport over a sequential stream (pipe, socket, file opened for reading).
#[derive(Debug)]
pub struct ReaderTransport<R> {
    inner: R,
}

impl<R: Read> ReaderTransport<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Transport for ReaderTransport<R> {
    fn get_buffer(&mut self, _pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Write-only transport over a sequential stream.
#[derive(Debug)]
pub struct WriterTransport<W: Write> {
    inner: W,
}

impl<W: Write> WriterTransport<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Transport for WriterTransport<W> {
    fn put_buffer(&mut self, _pos: u64, buf: &[u8]) -> io::Result<usize> {
        // `write_all` already retries `Interrupted`.
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Random-access transport embedding the stream at a fixed offset inside a larger image, e.g.
/// the VM state area of a disk image.
#[derive(Debug)]
pub struct SeekTransport<F> {
    inner: F,
    base: u64,
}

impl<F: Read + Write + Seek> SeekTransport<F> {
    pub fn new(inner: F, base: u64) -> Self {
        Self { inner, base }
    }

    fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        let offset = self
            .base
            .checked_add(pos)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "offset overflow")
            })?;
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl<F: Read + Write + Seek> Transport for SeekTransport<F> {
    fn get_buffer(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek_to(pos)?;
        loop {
            match self.inner.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn put_buffer(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        self.seek_to(pos)?;
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
