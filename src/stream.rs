//! Chunked random-access media streams.
//!
//! Media files are fetched from CDNs in chunks of [`CHUNK_SIZE`] bytes with
//! HTTP range requests. A stream learns the file size by probing the first
//! byte and then behaves like any `Read + Seek` byte stream over
//! `[0, size]`. Reads that span chunks fetch every chunk they touch and
//! splice the pieces together.
//!
//! Fetched chunks are kept in a [`ChunkCache`] with least-recently-used
//! eviction. [`EncryptedChunkedStream`] decrypts each chunk with AES-CTR at
//! its absolute offset and keeps decrypted chunks in a cache of their own,
//! so repeated reads never decrypt twice.
//!
//! The download pipeline opens streams through the [`StreamOpener`] trait
//! and works on the object-safe [`MediaStream`] trait.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use reqwest::header::{CONTENT_RANGE, RANGE};
use url::Url;

use crate::{
    decrypt::Key,
    error::{Error, Result},
    http,
    track::ReplayGain,
};

/// Size of the chunks fetched from the CDN.
pub const CHUNK_SIZE: u64 = 128 * 1024;

/// Bytes of a range response with the total size of the resource.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Range {
    pub data: Vec<u8>,
    pub total: u64,
}

/// Fetches byte ranges of one remote resource.
pub trait RangeSource: Send {
    /// Fetches bytes `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be fetched or the response
    /// lacks the total size.
    fn fetch(&self, start: u64, end: u64) -> Result<Range>;
}

/// Range requests over HTTP.
pub struct HttpRangeSource {
    client: Arc<http::Client>,
    url: Url,
}

impl HttpRangeSource {
    #[must_use]
    pub fn new(client: Arc<http::Client>, url: Url) -> Self {
        Self { client, url }
    }

    /// Extracts the total from a `Content-Range: bytes 0-0/12345` value.
    fn total(content_range: &str) -> Option<u64> {
        content_range.rsplit_once('/')?.1.trim().parse().ok()
    }
}

impl RangeSource for HttpRangeSource {
    fn fetch(&self, start: u64, end: u64) -> Result<Range> {
        let mut request = self.client.get(self.url.clone());
        request
            .headers_mut()
            .insert(RANGE, format!("bytes={start}-{end}").parse()?);

        let response = self.client.execute_unlimited(request)?;
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(Self::total)
            .ok_or_else(|| {
                Error::failed_precondition(format!("{} has no content range", self.url))
            })?;

        let data = response.bytes()?.to_vec();
        trace!("fetched bytes {start}-{end} of {total} ({} bytes)", data.len());
        Ok(Range { data, total })
    }
}

/// Least-recently-used cache of chunks by index.
#[derive(Debug, Default)]
pub struct ChunkCache {
    max: usize,
    chunks: HashMap<u64, Arc<[u8]>>,

    /// Least recently used first.
    order: VecDeque<u64>,
}

impl ChunkCache {
    /// Creates a cache holding at most `max` chunks, or any number if `max`
    /// is zero.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max,
            ..Default::default()
        }
    }

    /// Returns a chunk and marks it most recently used.
    pub fn get(&mut self, index: u64) -> Option<Arc<[u8]>> {
        let chunk = self.chunks.get(&index).cloned()?;
        self.touch(index);
        Some(chunk)
    }

    /// Inserts a chunk, evicting the least recently used ones if full.
    pub fn insert(&mut self, index: u64, chunk: Arc<[u8]>) {
        if self.chunks.insert(index, chunk).is_some() {
            self.touch(index);
            return;
        }

        self.order.push_back(index);
        while self.max > 0 && self.order.len() > self.max {
            if let Some(evicted) = self.order.pop_front() {
                self.chunks.remove(&evicted);
            }
        }
    }

    #[must_use]
    pub fn contains(&self, index: u64) -> bool {
        self.chunks.contains_key(&index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.order.clear();
    }

    fn touch(&mut self, index: u64) {
        if let Some(pos) = self.order.iter().position(|&i| i == index) {
            self.order.remove(pos);
        }
        self.order.push_back(index);
    }
}

/// A stream of bytes addressed by chunk.
trait Chunked {
    fn size(&self) -> u64;
    fn chunk(&mut self, index: u64) -> Result<Arc<[u8]>>;
}

/// Fills `buf` from `position` on, splicing chunks. Returns the bytes read.
fn read_chunks<C: Chunked>(stream: &mut C, position: u64, buf: &mut [u8]) -> Result<usize> {
    let size = stream.size();
    let mut read = 0;

    while read < buf.len() {
        let offset = position + read as u64;
        if offset >= size {
            break;
        }

        let index = offset / CHUNK_SIZE;
        let chunk = stream.chunk(index)?;

        let start = usize::try_from(offset % CHUNK_SIZE)
            .map_err(|_| Error::out_of_range("chunk offset out of range"))?;
        let available = chunk.get(start..).unwrap_or_default();
        if available.is_empty() {
            return Err(Error::data_loss(format!("chunk {index} is short")));
        }

        let len = available.len().min(buf.len() - read);
        buf[read..read + len].copy_from_slice(&available[..len]);
        read += len;
    }

    Ok(read)
}

/// Computes a new position within `[0, size]`.
fn seek_within(size: u64, position: u64, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => i128::from(offset),
        SeekFrom::Current(delta) => i128::from(position) + i128::from(delta),
        SeekFrom::End(delta) => i128::from(size) + i128::from(delta),
    };

    if target < 0 || target > i128::from(size) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("seek to {target} outside of 0..={size}"),
        ));
    }

    u64::try_from(target).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Reads the replay gain header and restores the position.
///
/// # Errors
///
/// Returns an error if the stream is too short or cannot seek.
pub fn read_replay_gain<S: Read + Seek + ?Sized>(stream: &mut S) -> Result<ReplayGain> {
    let position = stream.stream_position()?;

    let mut bytes = [0; ReplayGain::LENGTH];
    let result = stream
        .seek(SeekFrom::Start(ReplayGain::OFFSET))
        .and_then(|_| stream.read_exact(&mut bytes));

    stream.seek(SeekFrom::Start(position))?;
    result?;

    Ok(ReplayGain::from_le_bytes(bytes))
}

/// Plain chunked stream over a [`RangeSource`].
pub struct ChunkedStream<R> {
    source: R,
    size: u64,
    total_chunks: u64,
    position: u64,
    cache: ChunkCache,
}

impl<R: RangeSource> ChunkedStream<R> {
    /// Opens a stream, probing the source for its size.
    ///
    /// `max_cached_chunks` bounds the chunk cache; `0` keeps every chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe fails.
    pub fn open(source: R, max_cached_chunks: usize) -> Result<Self> {
        let size = source.fetch(0, 0)?.total;
        let total_chunks = size.div_ceil(CHUNK_SIZE);
        debug!("opened stream of {size} bytes in {total_chunks} chunks");

        Ok(Self {
            source,
            size,
            total_chunks,
            position: 0,
            cache: ChunkCache::new(max_cached_chunks),
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Drops all cached chunks.
    pub fn close(&mut self) {
        self.cache.clear();
    }

    /// Returns chunk `index`, from cache or fetched.
    ///
    /// # Errors
    ///
    /// * `OutOfRange` if the index is past the last chunk
    /// * `DataLoss` if the source returns fewer bytes than requested
    pub fn chunk(&mut self, index: u64) -> Result<Arc<[u8]>> {
        if index >= self.total_chunks {
            return Err(Error::out_of_range(format!(
                "chunk {index} of {} chunks",
                self.total_chunks
            )));
        }

        if let Some(chunk) = self.cache.get(index) {
            return Ok(chunk);
        }

        let start = index * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(self.size) - 1;
        let range = self.source.fetch(start, end)?;

        let expected = end - start + 1;
        if range.data.len() as u64 != expected {
            return Err(Error::data_loss(format!(
                "chunk {index} has {} bytes instead of {expected}",
                range.data.len()
            )));
        }

        let chunk: Arc<[u8]> = range.data.into();
        self.cache.insert(index, Arc::clone(&chunk));
        Ok(chunk)
    }
}

impl<R: RangeSource> Chunked for ChunkedStream<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn chunk(&mut self, index: u64) -> Result<Arc<[u8]>> {
        ChunkedStream::chunk(self, index)
    }
}

impl<R: RangeSource> Read for ChunkedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let position = self.position;
        let read = read_chunks(self, position, buf)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<R: RangeSource> Seek for ChunkedStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = seek_within(self.size, self.position, pos)?;
        Ok(self.position)
    }
}

/// Chunked stream that decrypts with AES-CTR.
pub struct EncryptedChunkedStream<R> {
    inner: ChunkedStream<R>,
    key: Key,
    position: u64,
    decrypted: ChunkCache,
}

impl<R: RangeSource> EncryptedChunkedStream<R> {
    /// Opens a decrypting stream. Both the encrypted and the decrypted
    /// chunk caches are bounded by `max_cached_chunks`.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe fails.
    pub fn open(source: R, key: Key, max_cached_chunks: usize) -> Result<Self> {
        Ok(Self {
            inner: ChunkedStream::open(source, max_cached_chunks)?,
            key,
            position: 0,
            decrypted: ChunkCache::new(max_cached_chunks),
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn close(&mut self) {
        self.decrypted.clear();
        self.inner.close();
    }

    /// Returns decrypted chunk `index`.
    ///
    /// # Errors
    ///
    /// Same as [`ChunkedStream::chunk`].
    pub fn chunk(&mut self, index: u64) -> Result<Arc<[u8]>> {
        if let Some(chunk) = self.decrypted.get(index) {
            return Ok(chunk);
        }

        let mut data = self.inner.chunk(index)?.to_vec();
        self.key.apply_keystream(index * CHUNK_SIZE, &mut data);

        let chunk: Arc<[u8]> = data.into();
        self.decrypted.insert(index, Arc::clone(&chunk));
        Ok(chunk)
    }
}

impl<R: RangeSource> Chunked for EncryptedChunkedStream<R> {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn chunk(&mut self, index: u64) -> Result<Arc<[u8]>> {
        EncryptedChunkedStream::chunk(self, index)
    }
}

impl<R: RangeSource> Read for EncryptedChunkedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let position = self.position;
        let read = read_chunks(self, position, buf)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<R: RangeSource> Seek for EncryptedChunkedStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = seek_within(self.size(), self.position, pos)?;
        Ok(self.position)
    }
}

/// Object-safe view of an open stream.
pub trait MediaStream: Read + Seek + Send {
    fn size(&self) -> u64;

    fn position(&self) -> u64;

    /// Whether reads return decrypted bytes.
    fn is_decrypted(&self) -> bool;

    /// Releases cached chunks.
    fn close(&mut self);

    /// Reads the replay gain header without moving the position.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read.
    fn replay_gain(&mut self) -> Result<ReplayGain> {
        read_replay_gain(self)
    }
}

impl<R: RangeSource> MediaStream for ChunkedStream<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_decrypted(&self) -> bool {
        false
    }

    fn close(&mut self) {
        ChunkedStream::close(self);
    }
}

impl<R: RangeSource> MediaStream for EncryptedChunkedStream<R> {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_decrypted(&self) -> bool {
        true
    }

    fn close(&mut self) {
        EncryptedChunkedStream::close(self);
    }
}

/// Opens streams for CDN URLs.
pub trait StreamOpener: Send + Sync {
    /// Opens `url`, decrypting with `key` if one is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    fn open(&self, url: &Url, key: Option<Key>) -> Result<Box<dyn MediaStream>>;
}

/// Opens streams over HTTP.
pub struct HttpStreamOpener {
    client: Arc<http::Client>,
    max_cached_chunks: usize,
}

impl HttpStreamOpener {
    #[must_use]
    pub fn new(client: Arc<http::Client>, max_cached_chunks: usize) -> Self {
        Self {
            client,
            max_cached_chunks,
        }
    }
}

impl StreamOpener for HttpStreamOpener {
    fn open(&self, url: &Url, key: Option<Key>) -> Result<Box<dyn MediaStream>> {
        let source = HttpRangeSource::new(Arc::clone(&self.client), url.clone());
        Ok(match key {
            Some(key) => Box::new(EncryptedChunkedStream::open(
                source,
                key,
                self.max_cached_chunks,
            )?),
            None => Box::new(ChunkedStream::open(source, self.max_cached_chunks)?),
        })
    }
}

/// Opens the first of `urls` that works.
///
/// # Errors
///
/// Returns `Unavailable` if every URL fails.
pub fn open_first(
    opener: &dyn StreamOpener,
    urls: &[Url],
    key: Option<Key>,
) -> Result<Box<dyn MediaStream>> {
    for url in urls {
        match opener.open(url, key) {
            Ok(stream) => return Ok(stream),
            Err(e) => warn!("{}: {e}", url.host_str().unwrap_or("cdn")),
        }
    }

    Err(Error::unavailable(format!(
        "none of {} cdn urls could be opened",
        urls.len()
    )))
}
