use once_cell::sync::Lazy;
use regex::Regex;

macro_rules! invalid_data_error {
    ($($arg:tt)*) => {{
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!($($arg)*),
        ))
    }};
}

pub mod csv;

/// The shared event/frame data model produced by the parsers.
pub mod event;

pub mod intern;
pub mod perf;
pub mod symbols;
pub mod thread_time;

#[cfg(feature = "multithreaded")]
mod parallel;
mod scanner;

pub use self::intern::{CallStackIndex, FrameIndex, ModuleIndex, StackTable};

pub(crate) const CAPACITY_READER: usize = 128 * 1024;

/// Default size of the lookahead buffer used when splitting input for the
/// worker pool. One buffer's worth of input is carved into one sub-stream,
/// so this also bounds how much of the input a single lock of the shared
/// cursor scans.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default cap on the number of samples retained from one source.
pub const DEFAULT_MAX_SAMPLES: usize = 50_000_000;

#[cfg(feature = "multithreaded")]
#[doc(hidden)]
pub static DEFAULT_NTHREADS: Lazy<usize> =
    Lazy::new(|| std::thread::available_parallelism().map(usize::from).unwrap_or(4));
#[cfg(not(feature = "multithreaded"))]
#[doc(hidden)]
pub static DEFAULT_NTHREADS: Lazy<usize> = Lazy::new(|| 1);

/// Settings that control which records are retained and how ingestion runs.
#[derive(Clone, Debug)]
pub struct Options {
    /// Retain only records whose event name matches this pattern.
    ///
    /// Filtered-out records are skipped without constructing their stacks,
    /// so a narrow filter makes ingestion of a broad trace substantially
    /// cheaper.
    pub event_filter: Option<Regex>,

    /// Maximum number of samples to retain; excess records are dropped.
    pub max_samples: usize,

    /// Classify every sample as `CPU_TIME` or `BLOCKED_TIME` using
    /// scheduler-switch events.
    ///
    /// Thread-time classification depends on observing every event in
    /// global order, so it requires serial ingestion: combining it with
    /// `nthreads > 1` is a configuration error.
    pub thread_time: bool,

    /// Lookahead buffer size used to carve sample-aligned sub-streams in
    /// parallel mode.
    pub buffer_size: usize,

    /// Number of worker threads to parse with. `1` forces serial ingestion.
    pub nthreads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            event_filter: None,
            max_samples: DEFAULT_MAX_SAMPLES,
            thread_time: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            nthreads: *DEFAULT_NTHREADS,
        }
    }
}

/// One retained trace record, bound to its interned call stack.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StackSourceSample {
    /// Position of this sample in the time-sorted output.
    pub sample_index: usize,
    /// Milliseconds since the start of the trace (the earliest retained
    /// sample is at exactly 0).
    pub time: f64,
    /// Sample weight: 1 for plain CPU samples, the blocked/running period
    /// in thread-time mode, or the source's weight column for CSV input.
    pub metric: f32,
    /// The sample's call stack.
    pub stack: CallStackIndex,
}

/// The artifact of one ingestion run: time-ordered samples plus the frozen
/// interning tables they point into.
#[derive(Debug)]
pub struct Profile {
    /// Samples sorted ascending by [`StackSourceSample::time`] and
    /// normalized so the trace begins at relative time zero.
    pub samples: Vec<StackSourceSample>,
    /// The frozen frame/module/call-stack tables.
    pub stacks: StackTable,
    /// Total milliseconds threads spent blocked, when thread-time
    /// classification was on.
    pub total_blocked_time: Option<f64>,
}

/// Sorts samples by time, shifts them so the trace starts at zero, applies
/// the sample cap, and renumbers.
pub(crate) fn sort_and_normalize(samples: &mut Vec<StackSourceSample>, max_samples: usize) {
    samples.sort_by(|a, b| a.time.total_cmp(&b.time));
    samples.truncate(max_samples);
    if let Some(first) = samples.first() {
        let start = first.time;
        for (index, sample) in samples.iter_mut().enumerate() {
            sample.time -= start;
            sample.sample_index = index;
        }
    }
}
