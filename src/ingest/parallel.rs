//! Parallel ingestion of perf-script dumps.
//!
//! The input has no index, so sub-streams are carved out of the raw bytes
//! on demand: each worker locks the shared cursor, takes the next
//! boundary-aligned chunk, and parses it independently. Samples accumulate
//! in per-worker lists (no contention); only the cursor and the interning
//! tables are shared. After the join the lists are concatenated, sorted by
//! time, and normalized, which makes the result independent of how the
//! input happened to be split.

use std::borrow::Cow;
use std::io;
use std::sync::Mutex;

use crossbeam_utils::thread;

use crate::ingest::intern::Interner;
use crate::ingest::perf::{intern_event, EventParser};
use crate::ingest::symbols::SymbolArchive;
use crate::ingest::{sort_and_normalize, Options, Profile, StackSourceSample};

/// Fraction of the lookahead window where the boundary search starts.
const START_FRACTION: f64 = 0.75;

/// Window growth attempts before giving up on a clean boundary. Each
/// attempt doubles the window, so this tolerates single records up to a
/// thousand times the configured buffer size.
const MAX_GROW_ATTEMPTS: usize = 10;

/// Position just past the first sample boundary in `window`, if any.
///
/// The end of the window is not a boundary: the window is a peek into a
/// larger stream, and the bytes after it decide whether a record really
/// ended there.
fn sample_end(window: &[u8]) -> Option<usize> {
    let mut index = 0;
    while index + 1 < window.len() {
        if window[index] == b'\n' && matches!(window[index + 1], b'\n' | b'\r' | 0) {
            return Some(index + 1);
        }
        index += 1;
    }
    None
}

/// Finds a sample-boundary cut point in `buf`, searching forward from
/// `start_fraction` of its length and backing the start off by factors of
/// 0.8, down to half the original fraction.
///
/// The backoff bounds how much of the buffer a failed search rescans while
/// still preferring cut points near the end, which keeps chunks close to
/// the configured size.
pub(crate) fn find_boundary(buf: &[u8], start_fraction: f64) -> Option<usize> {
    let floor = start_fraction * 0.5;
    let mut fraction = start_fraction;
    while fraction >= floor {
        let start = (buf.len() as f64 * fraction) as usize;
        if let Some(end) = sample_end(&buf[start..]) {
            return Some(start + end);
        }
        fraction *= 0.8;
    }
    None
}

/// One carved sub-stream.
struct Chunk<'a> {
    data: Cow<'a, [u8]>,
    /// The chunk begins mid-record (the previous chunk was cut at an unsafe
    /// point); parsing must resume at the first boundary inside it.
    skip_partial_head: bool,
}

impl Chunk<'_> {
    /// The records to parse, with any partial leading record dropped.
    fn records(&self) -> &[u8] {
        if !self.skip_partial_head {
            return &self.data;
        }
        match sample_end(&self.data) {
            Some(end) => &self.data[end..],
            None => &[],
        }
    }
}

/// The shared cursor workers pull sub-streams from. All access happens
/// under one mutex; carving is a bounded scan, not a parse.
struct ChunkCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    buffer_size: usize,
    skip_partial_head: bool,
}

impl<'a> ChunkCursor<'a> {
    fn new(buf: &'a [u8], buffer_size: usize) -> Self {
        ChunkCursor {
            buf,
            pos: 0,
            buffer_size: buffer_size.max(2),
            skip_partial_head: false,
        }
    }

    fn next_chunk(&mut self) -> Option<Chunk<'a>> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let skip_partial_head = std::mem::take(&mut self.skip_partial_head);
        let remaining = &self.buf[self.pos..];

        // Look for a clean boundary, growing the window when one record is
        // larger than the whole lookahead. End of input is always a valid
        // boundary (the final record carries no trailing blank line).
        let mut size = self.buffer_size;
        for _ in 0..MAX_GROW_ATTEMPTS {
            if size >= remaining.len() {
                self.pos = self.buf.len();
                return Some(Chunk {
                    data: Cow::Borrowed(remaining),
                    skip_partial_head,
                });
            }
            if let Some(boundary) = find_boundary(&remaining[..size], START_FRACTION) {
                self.pos += boundary;
                return Some(Chunk {
                    data: Cow::Borrowed(&remaining[..boundary]),
                    skip_partial_head,
                });
            }
            size *= 2;
        }

        // Pathological input: no boundary within the grown window. Cut at
        // the last newline and append a truncation marker so the worker
        // discards the partial trailing record instead of mis-parsing it;
        // the next chunk skips forward to the first boundary it contains.
        let window = &remaining[..self.buffer_size.min(remaining.len())];
        let (cut, advance) = match window.iter().rposition(|&b| b == b'\n') {
            Some(newline) => (newline + 1, newline + 1),
            // A single line wider than the window: no prefix of it is a
            // complete line, so carve nothing and step over the window.
            None => (0, window.len()),
        };
        self.pos += advance;
        let mut data = window[..cut].to_vec();
        data.push(0);
        self.skip_partial_head = true;
        Some(Chunk {
            data: Cow::Owned(data),
            skip_partial_head,
        })
    }
}

/// Fans the perf-script parse out across `opt.nthreads` scoped workers and
/// merges their sample lists into one time-normalized profile.
pub(crate) fn ingest(
    buf: &[u8],
    opt: &Options,
    symbols: Option<&SymbolArchive>,
) -> io::Result<Profile> {
    let interner = Interner::new(opt.nthreads);
    let cursor = Mutex::new(ChunkCursor::new(buf, opt.buffer_size));
    let mut samples = Vec::new();

    thread::scope(|scope| -> io::Result<()> {
        let mut handles = Vec::with_capacity(opt.nthreads);
        for _ in 0..opt.nthreads {
            let mut interner = interner.handle();
            let cursor = &cursor;
            handles.push(scope.spawn(
                move |_| -> io::Result<Vec<StackSourceSample>> {
                    let mut local = Vec::new();
                    loop {
                        let chunk = {
                            let mut cursor = cursor.lock().expect("chunk cursor poisoned");
                            cursor.next_chunk()
                        };
                        let chunk = match chunk {
                            Some(chunk) => chunk,
                            None => break,
                        };
                        let parser = EventParser::new(
                            chunk.records(),
                            opt.event_filter.as_ref(),
                            symbols,
                            opt.max_samples,
                        );
                        for event in parser {
                            if let Some(event) = event? {
                                local.push(intern_event(&event, None, &mut interner));
                            }
                        }
                    }
                    Ok(local)
                },
            ));
        }
        for handle in handles {
            samples.extend(handle.join().expect("ingestion worker panicked")?);
        }
        Ok(())
    })
    .expect("ingestion worker panicked")?;

    sort_and_normalize(&mut samples, opt.max_samples);
    Ok(Profile {
        samples,
        stacks: interner.done_interning(),
        total_blocked_time: None,
    })
}
