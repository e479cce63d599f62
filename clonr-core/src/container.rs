//! The compressed image container format.
//!
//! ```text
//! +--------------------------+
//! | u64 BE logical size      |
//! +--------------------------+
//! | u32 BE record length     |  repeated until end of file
//! | record payload           |
//! +--------------------------+
//! ```
//!
//! A record payload is a big-endian `u32` holding the decompressed length,
//! followed by a zlib stream of the chunk's raw sectors. A record length of
//! `0xFFFF_FFFF` marks an empty record with no payload.
//!
//! Records carry no sector address and no checksum: the position of a chunk on
//! the device is the sum of the lengths of all chunks before it.
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

const EMPTY_RECORD: u32 = 0xFFFF_FFFF;
const SIZE_PREFIX: usize = 4;

/// Writes the container header and chunks to an underlying stream.
pub struct ContainerWriter<W: Write> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    pub fn write_header(&mut self, total_logical_size: u64) -> io::Result<()> {
        self.inner.write_all(&total_logical_size.to_be_bytes())?;
        self.bytes_written += 8;
        Ok(())
    }

    /// Compresses `raw` at maximum ratio and appends it as one record.
    pub fn write_chunk(&mut self, raw: &[u8]) -> io::Result<()> {
        let payload = compress(raw)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "chunk too large for a record")
        })?;
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(&payload)?;
        self.bytes_written += 4 + payload.len() as u64;
        Ok(())
    }

    /// Bytes emitted so far, header included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes and returns the underlying stream.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

fn compress(raw: &[u8]) -> io::Result<Vec<u8>> {
    let declared = u32::try_from(raw.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "chunk too large to compress")
    })?;
    let mut payload = declared.to_be_bytes().to_vec();
    if raw.is_empty() {
        return Ok(payload);
    }
    let mut encoder = ZlibEncoder::new(payload, Compression::best());
    encoder.write_all(raw)?;
    payload = encoder.finish()?;
    Ok(payload)
}

fn decompress(payload: &[u8], max_len: u64) -> io::Result<Vec<u8>> {
    if payload.len() < SIZE_PREFIX {
        return Ok(Vec::new());
    }
    let (prefix, stream) = payload.split_at(SIZE_PREFIX);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
    if declared > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("corrupt chunk: declares {declared} bytes, more than the {max_len} allowed"),
        ));
    }
    if declared == 0 {
        return Ok(Vec::new());
    }

    let mut raw = Vec::with_capacity(declared as usize);
    ZlibDecoder::new(stream)
        .take(declared + 1)
        .read_to_end(&mut raw)?;
    if raw.len() as u64 != declared {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "corrupt chunk: declares {declared} bytes but holds {}",
                raw.len()
            ),
        ));
    }
    Ok(raw)
}

/// Reads a container: the header first, then chunks in order.
pub struct ContainerReader<R: Read> {
    inner: R,
    consumed: u64,
    max_chunk_bytes: u64,
}

impl<R: Read> ContainerReader<R> {
    pub fn new(inner: R, max_chunk_bytes: u64) -> Self {
        Self {
            inner,
            consumed: 0,
            max_chunk_bytes,
        }
    }

    /// Bytes of the container consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn read_header(&mut self) -> io::Result<u64> {
        let mut header = [0u8; 8];
        self.inner.read_exact(&mut header)?;
        self.consumed += 8;
        Ok(u64::from_be_bytes(header))
    }

    /// Returns the next chunk's raw sectors, or `None` at the end of the
    /// stream. A stream that ends inside a record is an error.
    pub fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len = [0u8; 4];
        if !self.fill_or_eof(&mut len)? {
            return Ok(None);
        }
        self.consumed += 4;

        let len = u32::from_be_bytes(len);
        if len == EMPTY_RECORD {
            return Ok(Some(Vec::new()));
        }
        // The compressed form of a valid chunk is never much larger than the
        // chunk itself.
        if len as u64 > self.max_chunk_bytes + 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupt container: record of {len} bytes"),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload)?;
        self.consumed += len as u64;
        decompress(&payload, self.max_chunk_bytes).map(Some)
    }

    /// Consumes the reader into a forward-only iterator over its chunks.
    pub fn chunks(self) -> Chunks<R> {
        Chunks {
            reader: self,
            done: false,
        }
    }

    fn fill_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "container ends inside a record header",
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Iterator over the remaining chunks of a [`ContainerReader`]. Stops after
/// the first error.
pub struct Chunks<R: Read> {
    reader: ContainerReader<R>,
    done: bool,
}

impl<R: Read> Chunks<R> {
    pub fn consumed(&self) -> u64 {
        self.reader.consumed()
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A writer that computes the SHA-256 of everything passing through it.
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Returns the stream and the lowercase hex digest of the bytes written.
    pub fn finalize(self) -> (W, String) {
        let digest = self.hasher.finalize();
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect();
        (self.inner, hex)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
