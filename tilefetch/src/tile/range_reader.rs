//! Random access to a remote file over HTTP range requests.
//!
//! Reads are served from fixed-size blocks fetched on demand, so opening a
//! ZIP archive only transfers its tail (the central directory) and the
//! entries actually read.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::download::{ByteRange, RangeTransport};
use crate::error::{FetchError, FetchResult};

/// Default block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Blocks kept in memory before the oldest is evicted.
const MAX_CACHED_BLOCKS: usize = 32;

/// Seekable reader over a URL that supports `Range` requests.
pub struct HttpRangeReader {
    transport: Arc<dyn RangeTransport>,
    url: String,
    referer: String,
    length: u64,
    position: u64,
    block_size: u64,
    blocks: HashMap<u64, Vec<u8>>,
    order: VecDeque<u64>,
    bytes_fetched: u64,
}

impl HttpRangeReader {
    /// Size `url` with HEAD and prepare to read it.
    ///
    /// Subsequent range requests go to the URL reached after redirects.
    pub fn open(transport: Arc<dyn RangeTransport>, url: &str, referer: &str) -> FetchResult<Self> {
        let info = transport
            .head(url, referer)
            .map_err(|e| e.into_fetch_error("HEAD", url))?;

        let length = info
            .content_length
            .ok_or_else(|| FetchError::UnknownSize { url: url.to_string() })?;

        Ok(Self {
            transport,
            url: info.final_url,
            referer: referer.to_string(),
            length,
            position: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks: HashMap::new(),
            order: VecDeque::new(),
            bytes_fetched: 0,
        })
    }

    /// Use blocks of `block_size` bytes (minimum 1).
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self.blocks.clear();
        self.order.clear();
        self
    }

    /// Size of the remote file.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Body bytes transferred so far.
    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched
    }

    fn block(&mut self, index: u64) -> io::Result<&[u8]> {
        if !self.blocks.contains_key(&index) {
            let data = self.fetch_block(index)?;
            if self.order.len() >= MAX_CACHED_BLOCKS {
                if let Some(evicted) = self.order.pop_front() {
                    self.blocks.remove(&evicted);
                }
            }
            self.order.push_back(index);
            self.blocks.insert(index, data);
        }
        Ok(self.blocks.get(&index).map(Vec::as_slice).unwrap_or_default())
    }

    fn fetch_block(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let lower = index * self.block_size;
        let upper = (lower + self.block_size - 1).min(self.length - 1);
        let range = ByteRange::new(lower, upper);

        tracing::trace!(url = %self.url, range = %range, "fetching block");
        let mut body = self
            .transport
            .get_range(&self.url, range, &self.referer)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let mut data = Vec::with_capacity(range.len() as usize);
        body.by_ref().take(range.len()).read_to_end(&mut data)?;
        self.bytes_fetched += data.len() as u64;

        if data.len() as u64 != range.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {} returned {} bytes", range, data.len()),
            ));
        }
        Ok(data)
    }
}

impl Read for HttpRangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.length {
            return Ok(0);
        }

        let index = self.position / self.block_size;
        let offset = (self.position % self.block_size) as usize;
        let block = self.block(index)?;
        let available = &block[offset.min(block.len())..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);

        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for HttpRangeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{HeadInfo, RangeBody, TransportError};
    use parking_lot::Mutex;
    use std::io::Cursor;

    struct MemoryTransport {
        content: Vec<u8>,
        ranges: Mutex<Vec<ByteRange>>,
    }

    impl RangeTransport for MemoryTransport {
        fn head(&self, url: &str, _referer: &str) -> Result<HeadInfo, TransportError> {
            Ok(HeadInfo {
                content_length: Some(self.content.len() as u64),
                final_url: url.to_string(),
            })
        }

        fn get_range(&self, _url: &str, range: ByteRange, _referer: &str) -> Result<RangeBody, TransportError> {
            self.ranges.lock().push(range);
            Ok(Box::new(Cursor::new(
                self.content[range.lower as usize..=range.upper as usize].to_vec(),
            )))
        }
    }

    fn reader(content: Vec<u8>, block_size: u64) -> (HttpRangeReader, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport {
            content,
            ranges: Mutex::new(Vec::new()),
        });
        let reader = HttpRangeReader::open(transport.clone(), "http://cdn/tile", "")
            .unwrap()
            .with_block_size(block_size);
        (reader, transport)
    }

    #[test]
    fn test_reads_across_blocks() {
        let content: Vec<u8> = (0..100u8).collect();
        let (mut reader, _) = reader(content.clone(), 16);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, content);
        assert_eq!(reader.bytes_fetched(), 100);
    }

    #[test]
    fn test_tail_read_fetches_only_tail() {
        let content = vec![7u8; 10_000];
        let (mut reader, transport) = reader(content, 1000);

        reader.seek(SeekFrom::End(-10)).unwrap();
        let mut out = [0u8; 10];
        reader.read_exact(&mut out).unwrap();

        assert_eq!(reader.bytes_fetched(), 1000);
        assert_eq!(transport.ranges.lock().as_slice(), &[ByteRange::new(9000, 9999)]);
    }

    #[test]
    fn test_blocks_are_cached() {
        let (mut reader, transport) = reader(vec![1u8; 64], 32);
        let mut out = [0u8; 8];

        reader.read_exact(&mut out).unwrap();
        reader.seek(SeekFrom::Start(4)).unwrap();
        reader.read_exact(&mut out).unwrap();

        assert_eq!(transport.ranges.lock().len(), 1);
    }

    #[test]
    fn test_seek_before_start_fails() {
        let (mut reader, _) = reader(vec![0u8; 10], 4);
        assert!(reader.seek(SeekFrom::Current(-1)).is_err());
        assert_eq!(reader.seek(SeekFrom::End(0)).unwrap(), 10);
        assert_eq!(reader.read(&mut [0u8; 4]).unwrap(), 0);
    }
}
