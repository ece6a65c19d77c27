//! The build log stores one line per executed command: timing, the recorded
//! output mtime, and a hash of the command line.  The dependency scan
//! consults it to notice edited commands and obsolete outputs.
//!
//! The format is the standard ninja one, so logs interoperate:
//!   # ninja log v6
//!   start_ms \t end_ms \t mtime \t output_path \t hex_command_hash

use crate::fs::MTime;
use crate::hash::Hash;
use anyhow::{anyhow, Context};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};

const SIGNATURE: &str = "# ninja log v";
const VERSION: u32 = 6;

/// Entries live past the files they describe; recompact once the dead
/// outnumber the live by this ratio (and the log is big enough to matter).
const MIN_COMPACTION_ENTRIES: usize = 100;
const COMPACTION_RATIO: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub command_hash: u64,
    pub mtime: MTime,
    pub start_ms: u32,
    pub end_ms: u32,
}

pub struct BuildLog {
    entries: HashMap<String, LogEntry>,
    path: Option<String>,
    w: Option<BufWriter<File>>,
    /// Total data lines parsed at load time; entries.len() is the live count.
    parsed_lines: usize,
    /// Set when the on-disk log is unusable (old version) and must be
    /// rewritten wholesale.
    discard_on_write: bool,
}

impl BuildLog {
    /// An in-memory log that never touches disk.  Used by tests.
    pub fn new() -> Self {
        BuildLog {
            entries: HashMap::new(),
            path: None,
            w: None,
            parsed_lines: 0,
            discard_on_write: false,
        }
    }

    /// Load a log file.  A missing file yields an empty log; a trailing
    /// partial line (crash during write) is dropped silently.
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let mut log = BuildLog::new();
        log.path = Some(path.to_string());
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(err) => return Err(anyhow!("read {}: {}", path, err)),
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut lines = text.split('\n');

        match lines.next().and_then(|header| {
            header
                .strip_prefix(SIGNATURE)
                .and_then(|v| v.trim_end_matches('\r').parse::<u32>().ok())
        }) {
            Some(VERSION) => {}
            _ => {
                // Unknown or missing version: start over.
                log.discard_on_write = true;
                return Ok(log);
            }
        }

        for line in lines {
            match parse_line(line) {
                Some((output, entry)) => {
                    log.parsed_lines += 1;
                    log.entries.insert(output.to_string(), entry);
                }
                // Tolerate a truncated tail, but read no further.
                None => break,
            }
        }
        Ok(log)
    }

    pub fn lookup(&self, output: &str) -> Option<&LogEntry> {
        self.entries.get(output)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Prepare the log for appending.  Entries whose output is no longer
    /// live are dropped, and the file is recompacted when mostly dead.
    pub fn open_for_write(&mut self, is_live: &dyn Fn(&str) -> bool) -> anyhow::Result<()> {
        self.entries.retain(|output, _| is_live(output));

        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };

        let needs_recompaction = self.discard_on_write
            || (self.parsed_lines > MIN_COMPACTION_ENTRIES
                && self.parsed_lines > self.entries.len() * COMPACTION_RATIO);
        if needs_recompaction {
            self.recompact()?;
            return Ok(());
        }

        let fresh = !std::path::Path::new(&path).exists();
        let f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path))?;
        let mut w = BufWriter::new(f);
        if fresh {
            writeln!(w, "{}{}", SIGNATURE, VERSION)?;
            w.flush()?;
        }
        self.w = Some(w);
        Ok(())
    }

    /// Rewrite the log to contain only the current live entries.  Writes a
    /// sibling temp file and renames it into place so a crash cannot lose
    /// the old log.
    pub fn recompact(&mut self) -> anyhow::Result<()> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let tmp = format!("{}.tmp", path);
        {
            let mut w = BufWriter::new(
                File::create(&tmp).with_context(|| format!("create {}", tmp))?,
            );
            writeln!(w, "{}{}", SIGNATURE, VERSION)?;
            let mut outputs: Vec<&String> = self.entries.keys().collect();
            outputs.sort();
            for output in outputs {
                let entry = &self.entries[output];
                write_line(&mut w, output, entry)?;
            }
            w.flush()?;
        }
        std::fs::rename(&tmp, &path).with_context(|| format!("rename {}", tmp))?;
        self.parsed_lines = self.entries.len();
        self.discard_on_write = false;
        let f = std::fs::OpenOptions::new().append(true).open(&path)?;
        self.w = Some(BufWriter::new(f));
        Ok(())
    }

    pub fn record(
        &mut self,
        output: &str,
        command_hash: Hash,
        mtime: MTime,
        start_ms: u32,
        end_ms: u32,
    ) -> anyhow::Result<()> {
        let entry = LogEntry {
            command_hash: command_hash.0,
            mtime,
            start_ms,
            end_ms,
        };
        if let Some(w) = &mut self.w {
            write_line(w, output, &entry)?;
            w.flush()?;
        }
        self.entries.insert(output.to_string(), entry);
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<(&str, LogEntry)> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() {
        return None;
    }
    let mut fields = line.split('\t');
    let start_ms = fields.next()?.parse::<u32>().ok()?;
    let end_ms = fields.next()?.parse::<u32>().ok()?;
    let mtime = MTime::from_raw(fields.next()?.parse::<u64>().ok()?);
    let output = fields.next()?;
    let command_hash = u64::from_str_radix(fields.next()?, 16).ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((
        output,
        LogEntry {
            command_hash,
            mtime,
            start_ms,
            end_ms,
        },
    ))
}

fn write_line(w: &mut impl Write, output: &str, entry: &LogEntry) -> std::io::Result<()> {
    writeln!(
        w,
        "{}\t{}\t{}\t{}\t{:x}",
        entry.start_ms,
        entry.end_ms,
        entry.mtime.to_raw(),
        output,
        entry.command_hash
    )
}
