//! Ingestion of xperf-style CSV stack dumps.
//!
//! One record per line, comma separated: an event kind, a timestamp in
//! milliseconds, a weight, and then one field per stack segment, leaf
//! first, ending in the thread and process pseudo-frames:
//!
//! ```text
//! SampledProfile, 1704.5, 1, d3d9.dll!Present (64), ntdll.dll!RtlUserThreadStart, tid (5678), chrome.exe (1234)
//! ```
//!
//! Because `,` delimits fields, the source encodes commas inside template
//! arguments as `;`; the function part of each segment decodes them back.
//! Lines whose timestamp field is not numeric (headers, footers) are
//! skipped.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use ahash::AHashMap;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::ingest::intern::{CallStackIndex, Interner};
use crate::ingest::{sort_and_normalize, Options, Profile, StackSourceSample};

/// Thread pseudo-frame, e.g. `tid (5678)`.
static THREAD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^tid +\((\d+)\)$").unwrap());

/// Process pseudo-frame, e.g. `chrome.exe (1234)` or `audiodg (816)`.
static PROCESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?)(?:\.exe)? +\((\d+)\)$").unwrap());

/// Numeric decoration some tools append to the function, e.g. `Present (64)`.
static DECORATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" \(\d+\)$").unwrap());

/// Context switches carry their weight in microseconds; everything else is
/// already in the output unit.
const CSWITCH_KIND: &str = "CSwitch";

/// One parsed stack segment, ready for interning.
#[derive(Debug, PartialEq)]
pub(crate) struct CsvFrame {
    /// The display name the frame is interned under.
    pub(crate) name: String,
    /// The tidied module name, for `module!function` segments.
    pub(crate) module: Option<String>,
    /// Whether this is a recognized thread pseudo-frame.
    pub(crate) is_thread: bool,
}

impl CsvFrame {
    fn plain(name: String) -> CsvFrame {
        CsvFrame {
            name,
            module: None,
            is_thread: false,
        }
    }
}

/// Stacks that failed to unwind to a legitimate thread start (the frame
/// called from the thread pseudo-frame must come from ntdll) get a `BROKEN`
/// marker inserted between the thread frame and the orphaned fragment.
///
/// Only the immediate neighbor of a thread frame is checked; deeper broken
/// chains are left as parsed.
pub(crate) fn insert_broken_markers(frames: &mut Vec<CsvFrame>) {
    let mut index = 0;
    while index < frames.len() {
        if frames[index].is_thread && index > 0 {
            let from_ntdll = frames[index - 1]
                .module
                .as_deref()
                .map_or(false, |module| module.ends_with("ntdll"));
            if !from_ntdll {
                frames.insert(index, CsvFrame::plain("BROKEN".to_owned()));
                index += 1;
            }
        }
        index += 1;
    }
}

/// Ingests CSV stack dumps into a [`Profile`]. CSV ingestion is always
/// serial; records are one line each, so there is no splitting to win from.
pub struct Ingester {
    opt: Options,
    /// Full paths by module file name, consulted before the module's
    /// platform suffix is stripped.
    module_paths: AHashMap<Box<str>, Box<str>>,
}

impl From<Options> for Ingester {
    fn from(opt: Options) -> Self {
        Ingester {
            opt,
            module_paths: AHashMap::new(),
        }
    }
}

impl Ingester {
    /// Registers full-path translations for module file names.
    pub fn with_module_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<Box<str>>,
    {
        self.module_paths
            .extend(paths.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Ingests CSV text from an arbitrary reader.
    pub fn ingest<R: Read>(&mut self, reader: R) -> io::Result<Profile> {
        let mut interner = Interner::new(1);
        let mut samples = Vec::new();
        let reader = BufReader::new(reader);

        for line in reader.lines() {
            let line = line?;
            if samples.len() >= self.opt.max_samples {
                break;
            }
            if let Some(sample) = self.parse_line(&line, &mut interner) {
                samples.push(sample);
            }
        }

        sort_and_normalize(&mut samples, self.opt.max_samples);
        Ok(Profile {
            samples,
            stacks: interner.done_interning(),
            total_blocked_time: None,
        })
    }

    /// Ingests a CSV dump from a file on disk.
    pub fn ingest_file<P: AsRef<Path>>(&mut self, path: P) -> io::Result<Profile> {
        self.ingest(File::open(path)?)
    }

    fn parse_line(&self, line: &str, interner: &mut Interner) -> Option<StackSourceSample> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let mut fields = line.split(',').map(str::trim);
        let kind = fields.next()?;
        let time: f64 = match fields.next()?.parse() {
            Ok(time) => time,
            Err(_) => {
                // Headers and footers land here; only warn on lines that
                // otherwise look like records.
                if !kind.is_empty() && kind.bytes().next().is_some_and(|b| b.is_ascii_digit()) {
                    warn!("skipping unparsable record line: {}", line);
                }
                return None;
            }
        };
        let weight: f64 = fields.next()?.parse().ok()?;

        if let Some(filter) = &self.opt.event_filter {
            if !filter.is_match(kind) {
                return None;
            }
        }

        let mut frames: Vec<CsvFrame> = fields.map(|field| self.parse_segment(field)).collect();
        insert_broken_markers(&mut frames);

        let mut metric = if kind == CSWITCH_KIND {
            weight / 1000.0
        } else {
            weight
        };
        if metric == 0.0 {
            metric = 1.0;
        }

        // Frames are leaf first; fold from the far end so the process and
        // thread pseudo-frames sit at the root of the interned stack.
        let mut stack = CallStackIndex::ROOT;
        for frame in frames.iter().rev() {
            let frame = interner.intern_frame(&frame.name, frame.module.as_deref());
            stack = interner.intern_stack(frame, stack);
        }

        Some(StackSourceSample {
            sample_index: 0,
            time,
            metric: metric as f32,
            stack,
        })
    }

    /// Parses one stack segment into its display name and module.
    pub(crate) fn parse_segment(&self, text: &str) -> CsvFrame {
        if let Some((module, function)) = text.split_once('!') {
            let mut name = function.replace(';', ",");
            if let Some(decoration) = DECORATION_RE.find(&name).map(|m| m.start()) {
                name.truncate(decoration);
            }
            return CsvFrame {
                name,
                module: Some(self.tidy_module(module)),
                is_thread: false,
            };
        }
        if let Some(captures) = THREAD_RE.captures(text) {
            return CsvFrame {
                name: format!("Thread ({})", &captures[1]),
                module: None,
                is_thread: true,
            };
        }
        if let Some(captures) = PROCESS_RE.captures(text) {
            return CsvFrame::plain(format!("Process ({}) ({})", &captures[1], &captures[2]));
        }
        CsvFrame::plain(text.to_owned())
    }

    /// Resolves a module file name through the full-path table, then strips
    /// the platform decoration (a trailing 4-character `.xxx` suffix).
    fn tidy_module(&self, module: &str) -> String {
        let module = self
            .module_paths
            .get(module)
            .map(|path| path.as_ref())
            .unwrap_or(module);
        let mut module = module.to_owned();
        if module.len() > 4 && module.as_bytes()[module.len() - 4] == b'.' {
            module.truncate(module.len() - 4);
        }
        module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn ingester() -> Ingester {
        Ingester::from(Options {
            nthreads: 1,
            ..Options::default()
        })
    }

    fn segments(ingester: &Ingester, fields: &[&str]) -> Vec<String> {
        let mut frames: Vec<_> = fields
            .iter()
            .map(|field| ingester.parse_segment(field))
            .collect();
        insert_broken_markers(&mut frames);
        frames.into_iter().map(|frame| frame.name).collect()
    }

    #[test]
    fn stack_rooted_in_ntdll_is_not_broken() {
        let ingester = ingester();
        assert_eq!(
            segments(&ingester, &["ntdll.dll!Func (1234)", "tid (5678)"]),
            vec!["Func", "Thread (5678)"]
        );
    }

    #[test]
    fn stack_not_rooted_in_ntdll_gets_a_broken_marker() {
        let ingester = ingester();
        assert_eq!(
            segments(&ingester, &["other.dll!Func (1234)", "tid (5678)"]),
            vec!["Func", "BROKEN", "Thread (5678)"]
        );
    }

    #[test]
    fn template_argument_separators_are_decoded() {
        let ingester = ingester();
        let frame = ingester.parse_segment("mylib.dll!std::map<int; std::string>::find");
        assert_eq!(frame.name, "std::map<int, std::string>::find");
        assert_eq!(frame.module.as_deref(), Some("mylib"));
    }

    #[test]
    fn pseudo_frame_grammars() {
        let ingester = ingester();

        let thread = ingester.parse_segment("tid (5678)");
        assert!(thread.is_thread);
        assert_eq!(thread.name, "Thread (5678)");

        let process = ingester.parse_segment("chrome.exe (1234)");
        assert_eq!(process.name, "Process (chrome) (1234)");
        assert!(!process.is_thread);

        let bare = ingester.parse_segment("audiodg (816)");
        assert_eq!(bare.name, "Process (audiodg) (816)");
    }

    #[test]
    fn module_paths_are_resolved_before_suffix_stripping() {
        let ingester = ingester().with_module_paths([(
            "ntdll.dll",
            r"C:\Windows\System32\ntdll.dll",
        )]);
        let frame = ingester.parse_segment("ntdll.dll!RtlUserThreadStart");
        assert_eq!(
            frame.module.as_deref(),
            Some(r"C:\Windows\System32\ntdll")
        );

        // The resolved path still counts as an ntdll thread start.
        assert_eq!(
            segments(
                &ingester,
                &["ntdll.dll!RtlUserThreadStart", "tid (5678)"]
            ),
            vec!["RtlUserThreadStart", "Thread (5678)"]
        );
    }

    #[test]
    fn cswitch_weights_convert_from_microseconds() {
        let mut ingester = ingester();
        let text = "\
EventName, TimeMsec, Weight, Stack
CSwitch, 10.0, 2500, ntdll.dll!Wait, tid (1), app.exe (1)
CSwitch, 11.0, 0, ntdll.dll!Wait, tid (1), app.exe (1)
SampledProfile, 12.0, 3, ntdll.dll!Run, tid (1), app.exe (1)
";
        let profile = ingester.ingest(Cursor::new(text)).unwrap();
        assert_eq!(profile.samples.len(), 3);
        assert_eq!(profile.samples[0].metric, 2.5);
        // Zero weights are clamped up so the sample still counts.
        assert_eq!(profile.samples[1].metric, 1.0);
        assert_eq!(profile.samples[2].metric, 3.0);
    }

    #[test]
    fn samples_are_sorted_and_normalized() {
        let mut ingester = ingester();
        let text = "\
SampledProfile, 20.5, 1, a.dll!f, tid (1), app.exe (1)
SampledProfile, 18.0, 1, a.dll!g, tid (1), app.exe (1)
";
        let profile = ingester.ingest(Cursor::new(text)).unwrap();
        assert_eq!(profile.samples[0].time, 0.0);
        assert_eq!(profile.samples[1].time, 2.5);

        let names: Vec<_> = profile
            .stacks
            .frames_of(profile.samples[0].stack)
            .into_iter()
            .map(|frame| profile.stacks.frame_name(frame).to_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "Process (app) (1)".to_owned(),
                "Thread (1)".to_owned(),
                "BROKEN".to_owned(),
                "g".to_owned(),
            ]
        );
    }

    #[test]
    fn event_filter_applies_to_the_kind_column() {
        let mut ingester = Ingester::from(Options {
            nthreads: 1,
            event_filter: Some(Regex::new("^SampledProfile$").unwrap()),
            ..Options::default()
        });
        let text = "\
SampledProfile, 1.0, 1, a.dll!f, tid (1), app.exe (1)
CSwitch, 2.0, 1000, a.dll!g, tid (1), app.exe (1)
";
        let profile = ingester.ingest(Cursor::new(text)).unwrap();
        assert_eq!(profile.samples.len(), 1);
    }
}
