//! Uncompressed trace container
//!
//! Layout:
//!
//! ```text
//! "RLYTRACE" | version: u32 LE | { len: u32 LE | msgpack record }*
//! ```
//!
//! Each record names its signature by id and carries the full signature the
//! first time that id appears. Bookmarks are byte offsets of a record's
//! length prefix, so seeking back is a cursor assignment on the mapping.

use crate::call::{Call, CallFlags, FunctionSig, Value};
use crate::error::{TraceError, TraceResult};
use crate::source::{Bookmark, CallSource};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const TRACE_MAGIC: &[u8; 8] = b"RLYTRACE";
pub const TRACE_VERSION: u32 = 1;
const HEADER_LEN: u64 = 12;

#[derive(Debug, Serialize, Deserialize)]
struct SigDef {
    name: String,
    arg_names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawCall {
    no: u64,
    thread_id: u32,
    sig_id: u32,
    sig: Option<SigDef>,
    args: Vec<Value>,
    ret: Option<Value>,
    flags: u32,
}

/// Memory-mapped reader implementing [`CallSource`]
#[derive(Default)]
pub struct TraceFile {
    path: PathBuf,
    mmap: Option<Mmap>,
    cursor: u64,
    next_call_no: u64,
    sigs: HashMap<u32, Arc<FunctionSig>>,
}

impl TraceFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` and return a ready reader
    pub fn open_path(path: impl AsRef<Path>) -> TraceResult<Self> {
        let mut file = Self::new();
        file.open(path.as_ref())?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data(&self) -> TraceResult<&[u8]> {
        self.mmap.as_deref().ok_or(TraceError::NotOpen)
    }

    fn decode_at(&mut self, offset: u64) -> TraceResult<Option<(Call, u64)>> {
        let data = self.data()?;
        let len = data.len() as u64;
        if offset >= len {
            return Ok(None);
        }
        if offset + 4 > len {
            return Err(TraceError::Truncated(offset));
        }
        let mut prefix = &data[offset as usize..offset as usize + 4];
        let record_len = prefix.read_u32::<LittleEndian>()? as u64;
        let start = offset + 4;
        let end = start + record_len;
        if end > len {
            return Err(TraceError::Truncated(offset));
        }
        let raw: RawCall = rmp_serde::from_slice(&data[start as usize..end as usize])
            .map_err(|e| TraceError::Decode {
                offset,
                message: e.to_string(),
            })?;

        if let Some(def) = raw.sig {
            self.sigs.entry(raw.sig_id).or_insert_with(|| {
                Arc::new(FunctionSig {
                    id: raw.sig_id,
                    name: def.name,
                    arg_names: def.arg_names,
                })
            });
        }
        let sig = self
            .sigs
            .get(&raw.sig_id)
            .cloned()
            .ok_or(TraceError::UnknownSignature {
                no: raw.no,
                sig_id: raw.sig_id,
            })?;

        let call = Call {
            no: raw.no,
            thread_id: raw.thread_id,
            sig,
            args: raw.args,
            ret: raw.ret,
            flags: CallFlags::from_bits_truncate(raw.flags),
            offset,
        };
        Ok(Some((call, end)))
    }
}

impl CallSource for TraceFile {
    fn open(&mut self, path: &Path) -> TraceResult<()> {
        let file = File::open(path).map_err(|source| TraceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let size = file.metadata()?.len();
        if size < HEADER_LEN {
            return Err(TraceError::InvalidHeader(path.to_path_buf()));
        }

        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| TraceError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        if &mmap[..8] != TRACE_MAGIC {
            return Err(TraceError::InvalidHeader(path.to_path_buf()));
        }
        let version = (&mmap[8..12]).read_u32::<LittleEndian>()?;
        if version != TRACE_VERSION {
            return Err(TraceError::UnsupportedVersion {
                expected: TRACE_VERSION,
                found: version,
            });
        }

        tracing::debug!(path = %path.display(), bytes = size, "opened trace");
        self.path = path.to_path_buf();
        self.mmap = Some(mmap);
        self.cursor = HEADER_LEN;
        self.next_call_no = 0;
        self.sigs.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.mmap = None;
        self.cursor = 0;
    }

    fn get_bookmark(&self) -> Bookmark {
        Bookmark {
            offset: self.cursor,
            next_call_no: self.next_call_no,
        }
    }

    fn set_bookmark(&mut self, bookmark: &Bookmark) -> TraceResult<()> {
        let len = self.data()?.len() as u64;
        if bookmark.offset < HEADER_LEN || bookmark.offset > len {
            return Err(TraceError::InvalidBookmark {
                offset: bookmark.offset,
            });
        }
        self.cursor = bookmark.offset;
        self.next_call_no = bookmark.next_call_no;
        Ok(())
    }

    fn parse_call(&mut self) -> TraceResult<Option<Call>> {
        match self.decode_at(self.cursor)? {
            Some((call, end)) => {
                self.cursor = end;
                self.next_call_no = call.no + 1;
                Ok(Some(call))
            }
            None => Ok(None),
        }
    }

    fn percent_read(&self) -> u8 {
        match self.mmap.as_deref() {
            Some(data) if !data.is_empty() => (self.cursor * 100 / data.len() as u64) as u8,
            _ => 100,
        }
    }
}

/// Streaming writer for the container read by [`TraceFile`]
pub struct TraceWriter<W: Write> {
    writer: W,
    defined: HashSet<u32>,
    written: u64,
}

impl TraceWriter<BufWriter<File>> {
    /// Create (truncate) a trace file at `path`
    pub fn create(path: impl AsRef<Path>) -> TraceResult<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| TraceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> TraceWriter<W> {
    pub fn new(mut writer: W) -> TraceResult<Self> {
        writer.write_all(TRACE_MAGIC)?;
        writer.write_u32::<LittleEndian>(TRACE_VERSION)?;
        Ok(Self {
            writer,
            defined: HashSet::new(),
            written: 0,
        })
    }

    pub fn write_call(&mut self, call: &Call) -> TraceResult<()> {
        let sig = if self.defined.insert(call.sig.id) {
            Some(SigDef {
                name: call.sig.name.clone(),
                arg_names: call.sig.arg_names.clone(),
            })
        } else {
            None
        };
        let raw = RawCall {
            no: call.no,
            thread_id: call.thread_id,
            sig_id: call.sig.id,
            sig,
            args: call.args.clone(),
            ret: call.ret.clone(),
            flags: call.flags.bits(),
        };
        let bytes = rmp_serde::to_vec(&raw).map_err(|e| TraceError::Encode {
            no: call.no,
            message: e.to_string(),
        })?;
        self.writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
        self.writer.write_all(&bytes)?;
        self.written += 1;
        Ok(())
    }

    /// Number of calls written so far
    pub fn calls_written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> TraceResult<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Copy every call of `source` into a new container at `dest`
///
/// Returns the number of calls written.
pub fn repack(source: &mut dyn CallSource, dest: impl AsRef<Path>) -> TraceResult<u64> {
    let mut writer = TraceWriter::create(dest)?;
    while let Some(call) = source.parse_call()? {
        writer.write_call(&call)?;
    }
    let written = writer.calls_written();
    writer.finish()?;
    Ok(written)
}

/// Reject traces the relay race could never finish
///
/// The fore runner (thread 0) is the only runner that may end a race, so a
/// trace without any thread-0 call is refused up front.
pub fn validate_trace(path: impl AsRef<Path>) -> TraceResult<u64> {
    let mut file = TraceFile::open_path(path)?;
    let mut calls = 0u64;
    let mut has_fore_leg = false;
    while let Some(call) = file.parse_call()? {
        calls += 1;
        has_fore_leg |= call.thread_id == 0;
    }
    if calls > 0 && !has_fore_leg {
        return Err(TraceError::NoForeRunnerLeg);
    }
    Ok(calls)
}
