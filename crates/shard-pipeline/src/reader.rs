//! Shard reader
//!
//! Walks a tar archive header by header and coalesces consecutive members
//! that share a key (`dir/stem` of `dir/stem.field`) into one [`Sample`].
//! The walk is lazy and one-pass, so it works over any byte stream: local
//! files, HTTP bodies, command pipes.
//!
//! The same walk without payloads builds a [`ShardIndex`] of member offsets,
//! which the indexed dataset uses to seek straight to one sample.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use shard_core::{log_open, Error, FieldValue, ReaderConfig, Result, Sample, ShardLocator};
use storage::{CacheLease, CacheManager, ShardOpener, ShardStream};
use tar::{EntryType, Header};
use tracing::{debug, warn};

/// Tar block size
const BLOCK: u64 = 512;

/// Largest payload buffer reserved up front; the header's size is not
/// trusted beyond this
const PREALLOC_LIMIT: u64 = 1 << 20;

/// Byte range of the checksum field in a tar header
const CKSUM_FIELD: std::ops::Range<usize> = 148..156;

/// Opens shards and turns them into sample iterators
#[derive(Clone)]
pub struct ShardReader {
    opener: Arc<dyn ShardOpener>,
    cache: Option<Arc<CacheManager>>,
    config: ReaderConfig,
}

impl std::fmt::Debug for ShardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReader")
            .field("opener", &self.opener.name())
            .field("cached", &self.cache.is_some())
            .field("policy", &self.config.policy)
            .finish()
    }
}

impl ShardReader {
    /// Reader that streams shards straight from `opener`
    pub fn new(opener: Arc<dyn ShardOpener>, config: ReaderConfig) -> Self {
        Self {
            opener,
            cache: None,
            config,
        }
    }

    /// Reader that goes through a local cache for remote shards
    pub fn with_cache(
        cache: Arc<CacheManager>,
        opener: Arc<dyn ShardOpener>,
        config: ReaderConfig,
    ) -> Self {
        Self {
            opener,
            cache: Some(cache),
            config,
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Open a shard as a lazy sequence of samples.
    ///
    /// Fails with `Open` (or `Download` when cached) if the shard cannot be
    /// reached. Errors after that point are yielded by the iterator.
    pub fn open(&self, locator: &ShardLocator) -> Result<SampleIter> {
        let url = locator.url.as_str();
        log_open!(self.config.log, %url, "Reading shard");

        let stream: ShardStream = match &self.cache {
            Some(cache) => {
                let lease = cache.resolve_local(locator)?;
                Box::new(LeasedFile::open(lease)?)
            }
            None => self.opener.open(url)?,
        };
        Ok(SampleIter::new(stream, url))
    }

    /// Read the archive at a local path
    pub fn open_path<P: AsRef<Path>>(&self, path: P, url: &str) -> Result<SampleIter> {
        let file = File::open(path.as_ref()).map_err(|e| Error::open(url, e))?;
        Ok(SampleIter::new(Box::new(BufReader::new(file)), url))
    }
}

/// A cached file kept pinned while it is read
struct LeasedFile {
    file: BufReader<File>,
    _lease: CacheLease,
}

impl LeasedFile {
    fn open(lease: CacheLease) -> Result<Self> {
        let file = lease.open()?;
        Ok(Self {
            file: BufReader::with_capacity(1 << 16, file),
            _lease: lease,
        })
    }
}

impl Read for LeasedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// One regular archive member
#[derive(Debug, Clone)]
struct Member {
    key: String,
    field: String,
    /// Byte offset of the member's data within the archive
    offset: u64,
    size: u64,
    data: Option<Bytes>,
}

/// Split `dir/stem.ext1.ext2` into (`dir/stem`, `ext1.ext2`)
pub fn split_member_name(name: &str) -> Option<(String, String)> {
    let (dir, file) = match name.rfind('/') {
        Some(pos) => name.split_at(pos + 1),
        None => ("", name),
    };
    let dot = file.find('.')?;
    if dot == 0 || dot + 1 == file.len() {
        return None;
    }
    let key = format!("{}{}", dir, &file[..dot]);
    Some((key, file[dot + 1..].to_ascii_lowercase()))
}

/// Header-by-header walk over a tar stream
struct ArchiveWalk {
    stream: ShardStream,
    url: String,
    offset: u64,
    keep_data: bool,
    done: bool,

    /// Key of the member being read when the stream was cut, if its
    /// header made it through
    cut_key: Option<String>,
}

impl ArchiveWalk {
    fn new(stream: ShardStream, url: &str, keep_data: bool) -> Self {
        Self {
            stream,
            url: url.to_string(),
            offset: 0,
            keep_data,
            done: false,
            cut_key: None,
        }
    }

    fn truncated(&mut self, offset: u64) -> Error {
        self.done = true;
        Error::TruncatedArchive {
            url: self.url.clone(),
            offset,
        }
    }

    fn corrupt_header(&mut self, offset: u64, reason: String) -> Error {
        self.done = true;
        warn!(url = %self.url, offset, %reason, "Corrupt tar header");
        Error::Decode {
            url: self.url.clone(),
            key: String::new(),
            field: "header".to_string(),
            reason: format!("{} at offset {}", reason, offset),
        }
    }

    fn stream_failed(&mut self, e: io::Error) -> Error {
        self.done = true;
        Error::open(self.url.as_str(), e)
    }

    /// Fill `buf`, returning how many bytes arrived before end of stream
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.offset += filled as u64;
        Ok(filled)
    }

    /// Read up to `len` payload bytes; fewer means the stream ended
    fn read_payload(&mut self, len: u64) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT) as usize);
        let read = (&mut self.stream).take(len).read_to_end(&mut buf)?;
        self.offset += read as u64;
        Ok(buf)
    }

    /// Consume `len` bytes, returning how many were available
    fn skip(&mut self, len: u64) -> io::Result<u64> {
        let skipped = io::copy(&mut (&mut self.stream).take(len), &mut io::sink())?;
        self.offset += skipped;
        Ok(skipped)
    }

    /// Read past the end-of-archive marker so a failing producer is noticed
    fn drain(&mut self) -> Result<()> {
        self.done = true;
        io::copy(&mut self.stream, &mut io::sink())
            .map(|_| ())
            .map_err(|e| Error::open(self.url.as_str(), e))
    }

    fn next_member(&mut self) -> Option<Result<Member>> {
        let mut long_name: Option<String> = None;

        while !self.done {
            self.cut_key = None;
            let header_offset = self.offset;
            let mut block = [0u8; BLOCK as usize];
            match self.read_full(&mut block) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) if n < block.len() => return Some(Err(self.truncated(header_offset))),
                Ok(_) => {}
                Err(e) => return Some(Err(self.stream_failed(e))),
            }

            if block.iter().all(|&b| b == 0) {
                return self.drain().err().map(Err);
            }

            let header = Header::from_byte_slice(&block);
            if !checksum_matches(header) {
                let reason = "header checksum mismatch".to_string();
                return Some(Err(self.corrupt_header(header_offset, reason)));
            }
            let size = match header.entry_size() {
                Ok(size) => size,
                Err(e) => {
                    let reason = format!("bad member size: {}", e);
                    return Some(Err(self.corrupt_header(header_offset, reason)));
                }
            };
            let padding = (BLOCK - size % BLOCK) % BLOCK;
            let data_offset = self.offset;
            let entry_type = header.entry_type();
            let is_meta = entry_type.is_gnu_longname() || entry_type.is_pax_local_extensions();
            let is_file = matches!(entry_type, EntryType::Regular | EntryType::Continuous);

            let name = if is_file {
                Some(match long_name.take() {
                    Some(name) => name,
                    None => String::from_utf8_lossy(&header.path_bytes()).into_owned(),
                })
            } else {
                None
            };
            self.cut_key = name
                .as_deref()
                .and_then(split_member_name)
                .map(|(key, _)| key);

            let data = if is_meta || (is_file && self.keep_data) {
                match self.read_payload(size) {
                    Ok(buf) if (buf.len() as u64) < size => {
                        return Some(Err(self.truncated(header_offset)))
                    }
                    Ok(buf) => Some(buf),
                    Err(e) => return Some(Err(self.stream_failed(e))),
                }
            } else {
                match self.skip(size) {
                    Ok(n) if n < size => return Some(Err(self.truncated(header_offset))),
                    Ok(_) => {}
                    Err(e) => return Some(Err(self.stream_failed(e))),
                }
                None
            };
            // A missing final pad is tolerated; the next header read decides.
            if let Err(e) = self.skip(padding) {
                return Some(Err(self.stream_failed(e)));
            }

            if entry_type.is_gnu_longname() {
                let raw = data.unwrap_or_default();
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                long_name = Some(String::from_utf8_lossy(&raw[..end]).into_owned());
                continue;
            }
            if entry_type.is_pax_local_extensions() {
                long_name = pax_path(&data.unwrap_or_default());
                continue;
            }
            let Some(name) = name else {
                continue;
            };
            let Some((key, field)) = split_member_name(&name) else {
                debug!(url = %self.url, member = %name, "Skipping member without extension");
                continue;
            };

            return Some(Ok(Member {
                key,
                field,
                offset: data_offset,
                size,
                data: data.map(Bytes::from),
            }));
        }
        None
    }
}

/// Unsigned byte sum with the checksum field read as spaces, as `tar` writes it
fn checksum_matches(header: &Header) -> bool {
    let bytes = header.as_bytes();
    let sum: u32 = bytes[..CKSUM_FIELD.start]
        .iter()
        .chain(&bytes[CKSUM_FIELD.end..])
        .map(|&b| u32::from(b))
        .sum::<u32>()
        + CKSUM_FIELD.len() as u32 * u32::from(b' ');
    header.cksum().is_ok_and(|stored| stored == sum)
}

/// `path` record of a PAX extended header
fn pax_path(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    text.lines().find_map(|record| {
        let (_, kv) = record.split_once(' ')?;
        let (key, value) = kv.split_once('=')?;
        (key == "path").then(|| value.to_string())
    })
}

/// Consecutive members grouped by key
struct Groups {
    walk: ArchiveWalk,
    pending: Option<Member>,
    pending_err: Option<Error>,
}

impl Groups {
    fn new(walk: ArchiveWalk) -> Self {
        Self {
            walk,
            pending: None,
            pending_err: None,
        }
    }

    fn url(&self) -> &str {
        &self.walk.url
    }

    /// Next complete group.
    ///
    /// A group is complete once a member with another key starts. When the
    /// stream is cut inside a member of a different key the group is still
    /// returned and the error follows; otherwise the group is dropped.
    fn next_group(&mut self) -> Option<Result<Vec<Member>>> {
        if let Some(e) = self.pending_err.take() {
            return Some(Err(e));
        }

        let first = match self.pending.take() {
            Some(member) => member,
            None => match self.walk.next_member()? {
                Ok(member) => member,
                Err(e) => return Some(Err(e)),
            },
        };

        let mut group = vec![first];
        loop {
            match self.walk.next_member() {
                Some(Ok(member)) if member.key == group[0].key => group.push(member),
                Some(Ok(member)) => {
                    self.pending = Some(member);
                    return Some(Ok(group));
                }
                Some(Err(e)) => {
                    let complete = matches!(e, Error::TruncatedArchive { .. })
                        && self
                            .walk
                            .cut_key
                            .as_ref()
                            .is_some_and(|key| *key != group[0].key);
                    if complete {
                        self.pending_err = Some(e);
                        return Some(Ok(group));
                    }
                    debug!(
                        url = %self.walk.url,
                        key = %group[0].key,
                        "Discarding sample interrupted by stream error"
                    );
                    return Some(Err(e));
                }
                None => return Some(Ok(group)),
            }
        }
    }
}

/// Lazy, one-pass sequence of samples from one shard.
///
/// Ends after the first truncation or stream error. Dropping it early
/// releases the underlying stream.
pub struct SampleIter {
    groups: Groups,
    failed: bool,
}

impl SampleIter {
    /// Read samples from any tar byte stream
    pub fn new(stream: ShardStream, url: &str) -> Self {
        Self {
            groups: Groups::new(ArchiveWalk::new(stream, url, true)),
            failed: false,
        }
    }

    /// URL of the shard being read
    pub fn url(&self) -> &str {
        self.groups.url()
    }

    fn build(&self, members: Vec<Member>) -> Result<Sample> {
        let url = self.groups.url();
        let mut sample = Sample::new(members[0].key.clone(), url);
        for member in members {
            if sample.fields.contains_key(&member.field) {
                return Err(Error::Decode {
                    url: url.to_string(),
                    key: member.key,
                    field: member.field,
                    reason: "duplicate field in sample".to_string(),
                });
            }
            let data = member.data.unwrap_or_default();
            sample.insert(member.field, FieldValue::Bytes(data));
        }
        Ok(sample)
    }
}

impl Iterator for SampleIter {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        if self.failed {
            return None;
        }
        match self.groups.next_group()? {
            Ok(members) => Some(self.build(members)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for SampleIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleIter")
            .field("url", &self.url())
            .field("offset", &self.groups.walk.offset)
            .finish()
    }
}

/// Location of one member's data within an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSpan {
    pub field: String,
    pub offset: u64,
    pub size: u64,
}

/// Members of one sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSpan {
    pub key: String,
    pub members: Vec<MemberSpan>,
}

/// Per-shard record index for random access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIndex {
    pub url: String,
    pub samples: Vec<SampleSpan>,
}

impl ShardIndex {
    /// Scan an archive once, recording where every sample's members live.
    ///
    /// Truncation is an error here: a partial index would silently shift
    /// every later global index.
    pub fn scan(stream: ShardStream, url: &str) -> Result<Self> {
        let mut groups = Groups::new(ArchiveWalk::new(stream, url, false));
        let mut samples = Vec::new();

        while let Some(group) = groups.next_group() {
            let members = group?;
            samples.push(SampleSpan {
                key: members[0].key.clone(),
                members: members
                    .into_iter()
                    .map(|m| MemberSpan {
                        field: m.field,
                        offset: m.offset,
                        size: m.size,
                    })
                    .collect(),
            });
        }

        debug!(%url, samples = samples.len(), "Indexed shard");
        Ok(Self {
            url: url.to_string(),
            samples,
        })
    }

    /// Scan a local archive file
    pub fn scan_path<P: AsRef<Path>>(path: P, url: &str) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| Error::open(url, e))?;
        Self::scan(Box::new(BufReader::new(file)), url)
    }

    /// Number of samples in the shard
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Read sample `offset` from the archive it was built from
    pub fn read_sample<R: Read + Seek>(&self, archive: &mut R, offset: usize) -> Result<Sample> {
        let span = self.samples.get(offset).ok_or(Error::IndexOutOfRange {
            index: offset as u64,
            total: self.samples.len() as u64,
        })?;

        let mut sample = Sample::new(span.key.clone(), self.url.clone());
        for member in &span.members {
            if sample.fields.contains_key(&member.field) {
                return Err(Error::Decode {
                    url: self.url.clone(),
                    key: span.key.clone(),
                    field: member.field.clone(),
                    reason: "duplicate field in sample".to_string(),
                });
            }

            let mut buf = Vec::with_capacity(member.size.min(PREALLOC_LIMIT) as usize);
            archive
                .seek(SeekFrom::Start(member.offset))
                .and_then(|_| (&mut *archive).take(member.size).read_to_end(&mut buf))
                .map_err(|e| Error::open(self.url.as_str(), e))?;
            if (buf.len() as u64) < member.size {
                return Err(Error::TruncatedArchive {
                    url: self.url.clone(),
                    offset: member.offset,
                });
            }
            sample.insert(member.field.clone(), FieldValue::Bytes(Bytes::from(buf)));
        }
        Ok(sample)
    }
}

/// Count the samples in a shard without keeping payloads
pub fn count_samples(stream: ShardStream, url: &str) -> Result<u64> {
    let index = ShardIndex::scan(stream, url)?;
    if index.is_empty() {
        warn!(%url, "Shard contains no samples");
    }
    Ok(index.len() as u64)
}
