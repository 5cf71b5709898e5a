//! Address-to-symbol resolution from auxiliary perf map files.
//!
//! Dynamically generated code (JITs, ahead-of-time images) has no symbols
//! in any binary's symbol table; instead a companion archive of `.map`
//! files carries `start size name` triples per address range. Resolution
//! may chain through exactly one indirection: a native `perf-<pid>.map`
//! entry can name a per-module JIT map, in which case the address relative
//! to the entry's start is looked up again in that module's map.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek};
use std::path::Path;

use ahash::AHashMap;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use zip::ZipArchive;

/// Matches the native per-process symbol file, e.g. `perf-1234.map`.
pub(crate) static PERF_MAP_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^perf-(\d+)\.map$").unwrap());

/// Matches per-module JIT maps, e.g. `System.Private.CoreLib.ni.{guid}.map`.
static JIT_MAP_FILE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.ni\..+\.map$").unwrap());

#[derive(Debug)]
struct Interval {
    start: u64,
    len: u64,
    symbol: Box<str>,
}

/// A sorted table of non-overlapping address intervals, each naming a
/// symbol. Built in two phases: bulk [`insert`](Self::insert)s followed by
/// one [`finalize`](Self::finalize); lookups before finalization are a
/// programming error.
#[derive(Debug, Default)]
pub struct SymbolMapper {
    intervals: Vec<Interval>,
    finalized: bool,
}

impl SymbolMapper {
    /// Creates an empty mapper.
    pub fn new() -> Self {
        SymbolMapper::default()
    }

    /// Appends one interval. Input order is irrelevant until `finalize`.
    pub fn insert(&mut self, start: u64, len: u64, symbol: &str) {
        debug_assert!(!self.finalized);
        self.intervals.push(Interval {
            start,
            len,
            symbol: Box::from(symbol),
        });
    }

    /// Sorts the intervals ascending by start address, enabling lookups.
    pub fn finalize(&mut self) {
        self.intervals.sort_by_key(|interval| interval.start);
        self.finalized = true;
    }

    /// Binary-searches the interval containing `address`, returning the
    /// symbol and the interval's start.
    ///
    /// Containment is `address - start < len` in wrapping arithmetic, so a
    /// single subtract-and-compare covers both bounds.
    pub fn find(&self, address: u64) -> Option<(&str, u64)> {
        debug_assert!(self.finalized);
        let upper = self
            .intervals
            .partition_point(|interval| interval.start <= address);
        let interval = &self.intervals[upper.checked_sub(1)?];
        if address.wrapping_sub(interval.start) < interval.len {
            Some((&interval.symbol, interval.start))
        } else {
            None
        }
    }

    /// Parses a perf map file: one `start(hex) size(hex) symbol` triple per
    /// line. Unparsable lines are skipped; map files only affect display
    /// fidelity, never correctness.
    pub fn parse<R: BufRead>(reader: R) -> io::Result<SymbolMapper> {
        let mut mapper = SymbolMapper::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, char::is_whitespace);
            let entry = (|| {
                let start = u64::from_str_radix(parts.next()?, 16).ok()?;
                let len = u64::from_str_radix(parts.next()?, 16).ok()?;
                let symbol = parts.next()?.trim();
                Some((start, len, symbol))
            })();
            match entry {
                Some((start, len, symbol)) => mapper.insert(start, len, symbol),
                None => warn!("skipping unparsable map line: {}", line),
            }
        }
        mapper.finalize();
        Ok(mapper)
    }
}

/// A resolved address: the symbol name, and the true module when resolution
/// chained through a per-module JIT map.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// The symbol the address fell into.
    pub symbol: String,
    /// Set when the native map entry redirected into a JIT module map; the
    /// caller should replace the frame's module name with this.
    pub module: Option<String>,
}

/// The symbol maps accompanying one trace: per-process native maps plus
/// per-module JIT maps, loaded from a ZIP archive.
#[derive(Debug, Default)]
pub struct SymbolArchive {
    by_pid: AHashMap<i32, SymbolMapper>,
    jit_modules: AHashMap<Box<str>, SymbolMapper>,
}

impl SymbolArchive {
    /// Loads all recognized map files from a ZIP archive. Entries that
    /// match neither filename pattern are ignored.
    pub fn from_reader<R: Read + Seek>(reader: R) -> io::Result<SymbolArchive> {
        let mut zip = ZipArchive::new(reader)?;
        let mut archive = SymbolArchive::default();
        for index in 0..zip.len() {
            let entry = zip.by_index(index)?;
            let name = entry
                .name()
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_owned();
            if let Some(captures) = PERF_MAP_FILE.captures(&name) {
                let pid = match captures[1].parse::<i32>() {
                    Ok(pid) => pid,
                    Err(_) => continue,
                };
                let mapper = SymbolMapper::parse(BufReader::new(entry))?;
                archive.by_pid.insert(pid, mapper);
            } else if JIT_MAP_FILE.is_match(&name) {
                let mapper = SymbolMapper::parse(BufReader::new(entry))?;
                archive.jit_modules.insert(Box::from(name.as_str()), mapper);
            }
        }
        Ok(archive)
    }

    /// Loads the archive from a file on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<SymbolArchive> {
        SymbolArchive::from_reader(File::open(path)?)
    }

    /// Resolves an address within a process.
    ///
    /// Consults the process's native map; when the resolved symbol itself
    /// names a JIT module map in this archive, the address relative to the
    /// native interval's start is resolved once more through that map. No
    /// further chaining is attempted. `None` means the caller keeps the raw
    /// address text.
    pub fn resolve(&self, pid: i32, address: u64) -> Option<ResolvedSymbol> {
        let (symbol, start) = self.by_pid.get(&pid)?.find(address)?;
        if let Some(jit) = self.jit_modules.get(symbol) {
            if let Some((jit_symbol, _)) = jit.find(address - start) {
                return Some(ResolvedSymbol {
                    symbol: jit_symbol.to_owned(),
                    module: Some(symbol.to_owned()),
                });
            }
        }
        Some(ResolvedSymbol {
            symbol: symbol.to_owned(),
            module: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    #[test]
    fn interval_lookup() {
        let mut mapper = SymbolMapper::new();
        // Inserted out of order on purpose.
        mapper.insert(0x200, 0x100, "f3");
        mapper.insert(0x100, 0x10, "f1");
        mapper.insert(0x110, 0xF0, "f2");
        mapper.finalize();

        assert_eq!(mapper.find(0x100), Some(("f1", 0x100)));
        assert_eq!(mapper.find(0x1FF), Some(("f2", 0x110)));
        assert_eq!(mapper.find(0x250), Some(("f3", 0x200)));
        // Interval ends are exclusive; addresses below the first interval
        // fail too.
        assert_eq!(mapper.find(0x300), None);
        assert_eq!(mapper.find(0xFF), None);
    }

    #[test]
    fn map_file_parsing_skips_garbage() {
        let text = "100 10 jit_func_a\n\nnot a map line\n200 20 jit_func_b\n";
        let mapper = SymbolMapper::parse(Cursor::new(text)).unwrap();
        assert_eq!(mapper.find(0x105), Some(("jit_func_a", 0x100)));
        assert_eq!(mapper.find(0x21F), Some(("jit_func_b", 0x200)));
        assert_eq!(mapper.find(0x120), None);
    }

    #[test]
    fn symbols_may_contain_spaces() {
        let text = "400 40 instance void [mscorlib] Dispose ()\n";
        let mapper = SymbolMapper::parse(Cursor::new(text)).unwrap();
        assert_eq!(
            mapper.find(0x410).map(|(s, _)| s),
            Some("instance void [mscorlib] Dispose ()")
        );
    }

    fn archive_with(entries: &[(&str, &str)]) -> SymbolArchive {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        let cursor = writer.finish().unwrap();
        SymbolArchive::from_reader(cursor).unwrap()
    }

    #[test]
    fn archive_resolution_chains_through_one_jit_map() {
        let archive = archive_with(&[
            (
                "perf-42.map",
                "1000 1000 mylib.ni.{abc}.map\n2000 100 plain_native\n",
            ),
            ("mylib.ni.{abc}.map", "10 20 Jitted::Method\n"),
            ("README", "not a map\n"),
        ]);

        // Native entry redirecting into the JIT map: relative address
        // 0x1015 - 0x1000 = 0x15 falls in [0x10, 0x30).
        assert_eq!(
            archive.resolve(42, 0x1015),
            Some(ResolvedSymbol {
                symbol: "Jitted::Method".to_owned(),
                module: Some("mylib.ni.{abc}.map".to_owned()),
            })
        );

        // Plain native entry.
        assert_eq!(
            archive.resolve(42, 0x2010),
            Some(ResolvedSymbol {
                symbol: "plain_native".to_owned(),
                module: None,
            })
        );

        // Unmapped address and unknown pid.
        assert_eq!(archive.resolve(42, 0x5000), None);
        assert_eq!(archive.resolve(7, 0x1015), None);
    }
}
