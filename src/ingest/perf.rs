//! Ingestion of `perf script` output.
//!
//! The parser consumes one record at a time from a byte buffer. A record is
//! a header line followed by zero or more stack lines, terminated by a
//! blank line (or end of input, for the last record in a file):
//!
//! ```text
//! java 24636/25607 [000] 4794564.109216: cycles:
//!         ffffffff8103ce3b native_safe_halt ([kernel.kallsyms])
//!         ffffffff8101c6a3 default_idle ([kernel.kallsyms])
//!         7f533952bc77 _dl_check_map_versions+0x597 (/usr/lib/ld-2.28.so)
//! ```
//!
//! Header fields can be irregular. The command name may contain spaces
//! (`V8 WorkerThread 24636/25607 ...`), some record kinds carry an extra
//! integer between the timestamp and the event name
//! (`vote 913/913 [002] 72.176760: 257597 cycles:uppp:`), and scheduler
//! records put their payload in the detail text after the event name:
//!
//! ```text
//! swapper 0/0 [001] 5076.836336: sched:sched_switch: prev_comm=swapper/1 prev_pid=0 prev_prio=120 prev_state=R ==> next_comm=java next_pid=25607 next_prio=120
//! ```

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use regex::Regex;

use crate::ingest::event::{Event, EventKind, Frame, ScheduleSwitch, ThreadRunState};
use crate::ingest::intern::{CallStackIndex, Interner};
use crate::ingest::scanner::ByteScanner;
use crate::ingest::symbols::SymbolArchive;
use crate::ingest::thread_time::BlockedTimeAnalyzer;
use crate::ingest::{sort_and_normalize, Options, Profile, StackSourceSample, CAPACITY_READER};

/// A pull parser over one sub-stream of `perf script` text.
///
/// Yields `Ok(None)` placeholders for records rejected by the event filter
/// (their stack lines are skipped without being parsed) and for the partial
/// record preceding a truncation marker. Single pass; the underlying cursor
/// is consumed.
pub(crate) struct EventParser<'a> {
    scanner: ByteScanner<'a>,
    filter: Option<&'a Regex>,
    symbols: Option<&'a SymbolArchive>,
    /// Events still allowed to be emitted before the cap cuts the stream.
    remaining: usize,
    done: bool,
}

impl<'a> EventParser<'a> {
    pub(crate) fn new(
        buf: &'a [u8],
        filter: Option<&'a Regex>,
        symbols: Option<&'a SymbolArchive>,
        max_events: usize,
    ) -> Self {
        EventParser {
            scanner: ByteScanner::new(buf),
            filter,
            symbols,
            remaining: max_events,
            done: false,
        }
    }

    /// The command field is not fixed-width and may contain spaces, so it is
    /// read greedily: tokens accumulate until one begins with a digit, which
    /// must be the pid/tid field.
    fn read_comm(&mut self) -> io::Result<String> {
        let mut comm = String::new();
        loop {
            self.scanner.skip_spaces();
            match self.scanner.peek() {
                Some(b) if b.is_ascii_digit() => {
                    if comm.is_empty() {
                        return invalid_data_error!("event record has no command name");
                    }
                    return Ok(comm);
                }
                Some(b'\n') | None => {
                    return invalid_data_error!("event record header ended before pid/tid")
                }
                Some(_) => {
                    let token = self
                        .scanner
                        .read_while(|b| b != b' ' && b != b'\t' && b != b'\n');
                    if !comm.is_empty() {
                        comm.push(' ');
                    }
                    comm.push_str(&String::from_utf8_lossy(token));
                }
            }
        }
    }

    /// Advances past the next `=` and reads the value that follows.
    ///
    /// The switch detail separates its prev and next halves with a literal
    /// `==>`; any `=` followed by another `=` or a `>` belongs to that arrow
    /// and is stepped over.
    fn kv_value(&mut self) -> io::Result<&'a [u8]> {
        loop {
            self.scanner.skip_to(b'=')?;
            self.scanner.bump();
            match self.scanner.peek() {
                Some(b'=') | Some(b'>') => continue,
                _ => break,
            }
        }
        Ok(self
            .scanner
            .read_while(|b| b != b' ' && b != b'=' && b != b'\n'))
    }

    fn kv_text(&mut self) -> io::Result<String> {
        Ok(String::from_utf8_lossy(self.kv_value()?).into_owned())
    }

    fn kv_int(&mut self) -> io::Result<i32> {
        let value = self.kv_value()?;
        match std::str::from_utf8(value).ok().and_then(|v| v.parse().ok()) {
            Some(n) => Ok(n),
            None => invalid_data_error!(
                "malformed integer `{}` in sched_switch detail",
                String::from_utf8_lossy(value)
            ),
        }
    }

    fn kv_char(&mut self) -> io::Result<char> {
        let value = self.kv_value()?;
        match value.first() {
            Some(&b) => Ok(b as char),
            None => invalid_data_error!("empty run-state in sched_switch detail"),
        }
    }

    fn parse_switch(&mut self) -> io::Result<ScheduleSwitch> {
        let prev_comm = self.kv_text()?;
        let prev_tid = self.kv_int()?;
        let prev_prio = self.kv_int()?;
        let prev_state = self.kv_char()?;
        let next_comm = self.kv_text()?;
        let next_tid = self.kv_int()?;
        let next_prio = self.kv_int()?;
        Ok(ScheduleSwitch {
            prev_comm,
            prev_tid,
            prev_prio,
            prev_state,
            next_comm,
            next_tid,
            next_prio,
        })
    }

    /// Parses one stack line: a hex address, then the symbol, then the
    /// module in trailing parentheses.
    fn parse_frame(&mut self, pid: i32) -> io::Result<Frame> {
        self.scanner.skip_spaces();
        let address = self.scanner.read_while(|b| !b.is_ascii_whitespace());
        if address.is_empty() {
            return invalid_data_error!("stack line has no address");
        }
        let address = String::from_utf8_lossy(address).into_owned();
        self.scanner.skip_spaces();
        let rest = String::from_utf8_lossy(self.scanner.rest_of_line());

        let (mut symbol, mut module) = match rest.rfind(" (") {
            Some(open) if rest.ends_with(')') => (
                rest[..open].to_owned(),
                rest[open + 2..rest.len() - 1].to_owned(),
            ),
            _ => (rest.into_owned(), String::new()),
        };

        // Strip symbol offsets, as in `_dl_check_map_versions+0x597`.
        if let Some(plus) = symbol.rfind("+0x") {
            if symbol[plus + 3..].bytes().all(|b| b.is_ascii_hexdigit()) {
                symbol.truncate(plus);
            }
        }

        // Addresses inside a perf map file belong to dynamically generated
        // code; the archive (when present) recovers the real symbol, and
        // possibly the real module one indirection further.
        if module.ends_with(".map") {
            if let (Some(archive), Ok(addr)) =
                (self.symbols, u64::from_str_radix(&address, 16))
            {
                if let Some(resolved) = archive.resolve(pid, addr) {
                    symbol = resolved.symbol;
                    if let Some(real_module) = resolved.module {
                        module = real_module;
                    }
                }
            }
        }

        // Resolution failure only affects display fidelity: keep the raw
        // address text as the symbol.
        if symbol == "[unknown]" || symbol.is_empty() {
            symbol = address.clone();
        }

        Ok(Frame::Stack {
            address,
            module,
            symbol,
        })
    }

    fn parse_record(&mut self) -> io::Result<Option<Event>> {
        let comm = self.read_comm()?;
        let pid = self.scanner.read_uint()? as i32;
        self.scanner.expect(b'/')?;
        let tid = self.scanner.read_uint()? as i32;

        self.scanner.skip_to(b'[')?;
        self.scanner.bump();
        let cpu = self.scanner.read_uint()? as i32;
        self.scanner.skip_to(b']')?;
        self.scanner.bump();

        self.scanner.skip_spaces();
        let time = self.scanner.read_float()? * 1000.0;
        self.scanner.expect(b':')?;

        self.scanner.skip_spaces();
        let time_property = match self.scanner.peek() {
            Some(b) if b.is_ascii_digit() => {
                let value = self.scanner.read_uint()?;
                self.scanner.skip_spaces();
                Some(value)
            }
            _ => None,
        };

        let name =
            String::from_utf8_lossy(self.scanner.read_while(|b| b != b':' && b != b'\n'))
                .into_owned();
        self.scanner.expect(b':')?;
        self.scanner.skip_spaces();

        let detail_mark = self.scanner.pos();
        let detail = String::from_utf8_lossy(self.scanner.rest_of_line()).into_owned();

        if let Some(filter) = self.filter {
            if !filter.is_match(&name) {
                self.scanner.skip_to_end_of_sample();
                return Ok(None);
            }
        }

        let kind = if detail.starts_with("sched_switch") {
            self.scanner.seek(detail_mark);
            let switch = self.parse_switch()?;
            self.scanner.rest_of_line();
            EventKind::Scheduler(switch)
        } else {
            EventKind::Cpu
        };

        let mut frames = Vec::new();
        while !self.scanner.at_end_of_sample() {
            frames.push(self.parse_frame(pid)?);
        }
        frames.push(Frame::Thread {
            tid,
            name: "Thread".to_owned(),
        });
        frames.push(Frame::Process { name: comm.clone() });

        // A NUL immediately after the record marks it as the truncated tail
        // of a sub-stream; it must be discarded, not emitted.
        if self.scanner.peek() == Some(0) {
            return Ok(None);
        }

        Ok(Some(Event {
            comm,
            tid,
            pid,
            time,
            time_property,
            cpu,
            name,
            detail,
            kind,
            frames,
            period: 1.0,
        }))
    }
}

impl Iterator for EventParser<'_> {
    type Item = io::Result<Option<Event>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == 0 {
            return None;
        }
        self.scanner.skip_whitespace();
        match self.scanner.peek() {
            None | Some(0) => {
                self.done = true;
                return None;
            }
            Some(_) => {}
        }
        let record = self.parse_record();
        match &record {
            Ok(Some(_)) => self.remaining -= 1,
            Ok(None) => {}
            // Record boundaries cannot be trusted once a field parse has
            // failed, so a structural error ends the stream.
            Err(_) => self.done = true,
        }
        Some(record)
    }
}

/// Folds one event's frames through the interner, root first, producing the
/// sample bound to the resulting call stack.
///
/// The parser stores frames leaf first with the synthetic thread and
/// process frames appended last, so the reverse walk visits process, then
/// thread, then the stack from its root down to the sampled leaf. In
/// thread-time mode a classification frame takes the leaf slot on top of
/// the full real stack; the event's own frames are all still walked.
pub(crate) fn intern_event(
    event: &Event,
    state: Option<ThreadRunState>,
    interner: &mut Interner,
) -> StackSourceSample {
    let mut stack = CallStackIndex::ROOT;
    for frame in event.frames.iter().rev() {
        let frame = interner.intern_frame(&frame.display_name(), frame.module());
        stack = interner.intern_stack(frame, stack);
    }
    if let Some(state) = state {
        let leaf = Frame::BlockedCpu {
            tid: event.tid,
            state,
        };
        let frame = interner.intern_frame(&leaf.display_name(), leaf.module());
        stack = interner.intern_stack(frame, stack);
    }
    StackSourceSample {
        sample_index: 0,
        time: event.time,
        metric: event.period as f32,
        stack,
    }
}

/// Ingests `perf script` text into a [`Profile`].
pub struct Ingester {
    opt: Options,
    symbols: Option<SymbolArchive>,
}

impl From<Options> for Ingester {
    fn from(opt: Options) -> Self {
        Ingester { opt, symbols: None }
    }
}

impl Ingester {
    /// Attaches a symbol archive consulted for `.map` module frames.
    pub fn with_symbols(mut self, symbols: SymbolArchive) -> Self {
        self.symbols = Some(symbols);
        self
    }

    /// Ingests perf-script text from an arbitrary reader.
    ///
    /// The input is read fully up front; both the serial and the parallel
    /// paths parse out of one in-memory buffer.
    pub fn ingest<R: Read>(&mut self, mut reader: R) -> io::Result<Profile> {
        let mut buf = Vec::with_capacity(CAPACITY_READER);
        reader.read_to_end(&mut buf)?;
        self.ingest_buf(&buf)
    }

    /// Ingests a perf-script dump from a file on disk.
    pub fn ingest_file<P: AsRef<Path>>(&mut self, path: P) -> io::Result<Profile> {
        self.ingest(File::open(path)?)
    }

    fn ingest_buf(&mut self, buf: &[u8]) -> io::Result<Profile> {
        if self.opt.thread_time && self.opt.nthreads > 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "thread-time classification requires the events in global \
                 order; set nthreads to 1 to use it",
            ));
        }

        #[cfg(feature = "multithreaded")]
        if self.opt.nthreads > 1 {
            return crate::ingest::parallel::ingest(buf, &self.opt, self.symbols.as_ref());
        }

        self.ingest_serial(buf)
    }

    fn ingest_serial(&mut self, buf: &[u8]) -> io::Result<Profile> {
        let mut interner = Interner::new(1);
        let mut samples = Vec::new();
        let mut analyzer = if self.opt.thread_time {
            Some(BlockedTimeAnalyzer::new())
        } else {
            None
        };

        let parser = EventParser::new(
            buf,
            self.opt.event_filter.as_ref(),
            self.symbols.as_ref(),
            self.opt.max_samples,
        );
        for event in parser {
            let mut event = match event? {
                Some(event) => event,
                None => continue,
            };
            let state = analyzer.as_mut().map(|analyzer| {
                analyzer.observe(&mut event);
                analyzer.thread_state(event.tid)
            });
            samples.push(intern_event(&event, state, &mut interner));
        }

        let total_blocked_time = analyzer.map(|mut analyzer| {
            analyzer.finish();
            analyzer.total_blocked_time()
        });
        sort_and_normalize(&mut samples, self.opt.max_samples);
        Ok(Profile {
            samples,
            stacks: interner.done_interning(),
            total_blocked_time,
        })
    }
}
