//! Decoding of the raw kernel perf record stream produced by the capture
//! agent.
//!
//! The stream is a plain concatenation of records, each starting with the
//! fixed `perf_event_header` layout. Only `MMAP` and `SAMPLE` records carry
//! data we use; everything else is skipped by consuming its declared body
//! length. The capture agent enables only `PERF_SAMPLE_IP` and
//! `PERF_SAMPLE_CALLCHAIN`, so the sample body is just the instruction
//! pointer followed by the call chain.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Call-chain entries above this value are context markers, tagging the
/// privilege domain of the frames that follow.
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;
/// The marker that opens a user-space frame run.
pub const PERF_CONTEXT_USER: u64 = -512i64 as u64;

pub const PERF_MAX_STACK_DEPTH: u64 = 127;

pub const PERF_EVENT_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapEvent {
    pub pid: u32,
    pub tid: u32,
    pub address: u64,
    pub length: u64,
    pub page_offset: u64,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEvent {
    pub ip: u64,
    /// Frame count as declared by the record. The decoded `callchain` can be
    /// shorter when the record body was truncated; consumers treat that
    /// mismatch as a corrupt sample.
    pub callchain_size: u64,
    pub callchain: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Mmap(MmapEvent),
    Sample(SampleEvent),
    Other(EventHeader),
}

/// Reads one record from the stream. Returns `Ok(None)` on a clean
/// end-of-stream at a record boundary; any other short read or malformed
/// header surfaces as an error, which terminates decoding.
pub fn read_event<R: Read>(reader: &mut R) -> io::Result<Option<Event>> {
    let mut header_bytes = [0u8; PERF_EVENT_HEADER_SIZE];
    if !read_full(reader, &mut header_bytes)? {
        return Ok(None);
    }

    let mut cursor = &header_bytes[..];
    let header = EventHeader {
        kind: cursor.read_u32::<LittleEndian>()?,
        misc: cursor.read_u16::<LittleEndian>()?,
        size: cursor.read_u16::<LittleEndian>()?,
    };

    let body_len = (header.size as usize)
        .checked_sub(PERF_EVENT_HEADER_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record size {} is smaller than its header", header.size),
            )
        })?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body)?;

    let event = match header.kind {
        PERF_RECORD_MMAP => match parse_mmap_event(&body) {
            Some(event) => Event::Mmap(event),
            None => {
                debug!("truncated MMAP record with {} body bytes", body.len());
                Event::Other(header)
            }
        },
        PERF_RECORD_SAMPLE => Event::Sample(parse_sample_event(&body)),
        _ => Event::Other(header),
    };
    Ok(Some(event))
}

/// Fills `buf` from the reader. Returns `false` if the stream was already
/// exhausted; errors if it ends partway through.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a record header",
                ))
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn parse_mmap_event(body: &[u8]) -> Option<MmapEvent> {
    let mut cursor = body;
    let pid = cursor.read_u32::<LittleEndian>().ok()?;
    let tid = cursor.read_u32::<LittleEndian>().ok()?;
    let address = cursor.read_u64::<LittleEndian>().ok()?;
    let length = cursor.read_u64::<LittleEndian>().ok()?;
    let page_offset = cursor.read_u64::<LittleEndian>().ok()?;

    let name_len = cursor
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(cursor.len());
    let file_name = String::from_utf8_lossy(&cursor[..name_len]).into_owned();

    Some(MmapEvent {
        pid,
        tid,
        address,
        length,
        page_offset,
        file_name,
    })
}

fn parse_sample_event(body: &[u8]) -> SampleEvent {
    let mut cursor = body;
    let mut event = SampleEvent {
        ip: 0,
        callchain_size: 0,
        callchain: Vec::new(),
    };

    let (Ok(ip), Ok(callchain_size)) = (
        cursor.read_u64::<LittleEndian>(),
        cursor.read_u64::<LittleEndian>(),
    ) else {
        return event;
    };
    event.ip = ip;
    event.callchain_size = callchain_size;

    let frames = callchain_size
        .min(PERF_MAX_STACK_DEPTH)
        .min((cursor.len() / 8) as u64);
    event.callchain.reserve(frames as usize);
    for _ in 0..frames {
        match cursor.read_u64::<LittleEndian>() {
            Ok(frame) => event.callchain.push(frame),
            Err(_) => break,
        }
    }
    event
}
