//! Block framing over a byte transport.
//!
//! [`BlockReader`] strips block headers and ends every logical message with
//! a synthesized prompt line, so line-oriented code above it always sees a
//! terminator. [`BlockWriter`] cuts outgoing bytes into blocks and marks the
//! block emitted by `flush` as the last one of the message.

use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

use super::{BLOCK_SIZE, BlockHeader};

/// Reading half of a block stream.
#[derive(Debug)]
pub struct BlockReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(BLOCK_SIZE + BlockHeader::SIZE, inner),
            // Room for a full block plus "\n.\n".
            buf: Vec::with_capacity(BLOCK_SIZE + 3),
            pos: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }

    /// Replace the buffered block with the next one from the transport.
    fn read_block(&mut self) -> io::Result<()> {
        let mut header = [0u8; BlockHeader::SIZE];
        self.inner.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed while reading block header",
                )
            } else {
                e
            }
        })?;
        let header = BlockHeader::from_bytes(header);

        self.buf.clear();
        self.buf.resize(usize::from(header.length), 0);
        self.inner.read_exact(&mut self.buf)?;
        self.pos = 0;

        if header.last {
            if self.buf.last().is_some_and(|&b| b != b'\n') {
                self.buf.push(b'\n');
            }
            self.buf.extend_from_slice(b".\n");
        }
        tracing::trace!(length = header.length, last = header.last, "read block");
        Ok(())
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for BlockReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        // Empty intermediate blocks carry nothing; keep going.
        while self.pos >= self.buf.len() {
            self.read_block()?;
        }
        Ok(&self.buf[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.buf.len());
    }
}

impl<R> Seek for BlockReader<R> {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(unseekable())
    }
}

/// Writing half of a block stream.
#[derive(Debug)]
pub struct BlockWriter<W: Write> {
    inner: W,
    /// Two header bytes followed by the pending payload.
    buf: Vec<u8>,
    more_data: bool,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(inner: W) -> Self {
        let mut buf = Vec::with_capacity(BlockHeader::SIZE + BLOCK_SIZE);
        buf.extend_from_slice(&[0, 0]);
        Self {
            inner,
            buf,
            more_data: false,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Make the next `flush` emit a non-final block.
    ///
    /// The flag is consumed by that flush.
    pub fn set_more_data(&mut self, more: bool) {
        self.more_data = more;
    }

    pub fn more_data(&self) -> bool {
        self.more_data
    }

    fn pending(&self) -> usize {
        self.buf.len() - BlockHeader::SIZE
    }

    #[allow(clippy::cast_possible_truncation)]
    fn emit(&mut self, last: bool) -> io::Result<()> {
        let header = BlockHeader {
            length: self.pending() as u16,
            last,
        };
        self.buf[..BlockHeader::SIZE].copy_from_slice(&header.to_bytes());
        self.inner.write_all(&self.buf)?;
        tracing::trace!(length = header.length, last, "wrote block");
        self.buf.truncate(BlockHeader::SIZE);
        Ok(())
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = data.len().min(BLOCK_SIZE - self.pending());
        self.buf.extend_from_slice(&data[..n]);
        if self.pending() == BLOCK_SIZE {
            self.emit(false)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let last = !std::mem::take(&mut self.more_data);
        self.emit(last)?;
        self.inner.flush()
    }
}

impl<W: Write> Seek for BlockWriter<W> {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(unseekable())
    }
}

fn unseekable() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "seeking is not supported on a block stream",
    )
}
