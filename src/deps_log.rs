//! The deps log is a compact binary database of discovered dependencies
//! (mostly header files), so incremental builds don't have to re-read
//! thousands of depfiles.  The format is the standard ninja one:
//!
//! - header: the magic "# ninjadeps\n" plus a little-endian u32 version;
//! - records framed by a u32 whose high bit distinguishes the two kinds:
//!   - path record: path bytes, NUL padding to 4-byte alignment, then a u32
//!     checksum of !id.  The record's position assigns the id.
//!   - deps record: u32 output id, u64 mtime, u32 input ids.
//!
//! Later records shadow earlier ones for the same output, so appending is
//! cheap; recompaction rewrites only the latest record per live output.

use crate::densemap::Index;
use crate::fs::MTime;
use crate::graph::{FileId, Graph};
use anyhow::{anyhow, bail, Context};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

const MAGIC: &[u8] = b"# ninjadeps\n";
const VERSION: u32 = 4;

/// Records beyond this size indicate corruption.
const MAX_RECORD_SIZE: u32 = (1 << 19) - 1;
const DEPS_RECORD_FLAG: u32 = 0x8000_0000;

const MIN_COMPACTION_ENTRIES: usize = 1000;
const COMPACTION_RATIO: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct DepsEntry {
    pub mtime: MTime,
    pub ins: Vec<FileId>,
}

pub struct DepsLog {
    path: Option<String>,
    w: Option<File>,
    /// log id -> graph file, in record order.
    log_files: Vec<FileId>,
    /// graph file -> log id.
    file_ids: HashMap<FileId, usize>,
    /// Latest deps record per output.
    deps: HashMap<FileId, DepsEntry>,
    /// Total deps records seen at load time, for recompaction accounting.
    total_records: usize,
}

impl DepsLog {
    /// An in-memory log that never touches disk.  Used by tests.
    pub fn new() -> Self {
        DepsLog {
            path: None,
            w: None,
            log_files: Vec::new(),
            file_ids: HashMap::new(),
            deps: HashMap::new(),
            total_records: 0,
        }
    }

    /// Load a log, interning its paths into the graph.  A corrupt or
    /// truncated tail is cut off and forgotten rather than failing the load.
    pub fn open(path: &str, graph: &mut Graph) -> anyhow::Result<Self> {
        let mut log = DepsLog::new();
        log.path = Some(path.to_string());
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(err) => return Err(anyhow!("read {}: {}", path, err)),
        };

        let valid_len = log.parse(&bytes, graph);
        if valid_len < bytes.len() as u64 {
            // Tail-truncated or corrupt record: drop the tail on disk so the
            // next append starts from a consistent state.
            let f = std::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .with_context(|| format!("open {}", path))?;
            f.set_len(valid_len)
                .with_context(|| format!("truncate {}", path))?;
        }
        Ok(log)
    }

    /// Parse records from the byte buffer, returning the offset of the first
    /// byte that could not be consumed.
    fn parse(&mut self, bytes: &[u8], graph: &mut Graph) -> u64 {
        let mut r = Reader { buf: bytes, ofs: 0 };
        if r.take(MAGIC.len()) != Some(MAGIC) {
            return 0;
        }
        if r.read_u32() != Some(VERSION) {
            return 0;
        }

        loop {
            let record_start = r.ofs;
            let header = match r.read_u32() {
                Some(h) => h,
                None => return record_start as u64,
            };
            let size = header & !DEPS_RECORD_FLAG;
            if size > MAX_RECORD_SIZE {
                return record_start as u64;
            }
            let payload = match r.take(size as usize) {
                Some(p) => p,
                None => return record_start as u64,
            };
            let ok = if header & DEPS_RECORD_FLAG != 0 {
                self.parse_deps_record(payload)
            } else {
                self.parse_path_record(payload, graph)
            };
            if !ok {
                return record_start as u64;
            }
        }
    }

    fn parse_path_record(&mut self, payload: &[u8], graph: &mut Graph) -> bool {
        if payload.len() < 8 {
            return false;
        }
        let (path_bytes, checksum_bytes) = payload.split_at(payload.len() - 4);
        let checksum = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
        let id = self.log_files.len() as u32;
        if checksum != !id {
            return false;
        }
        let mut end = path_bytes.len();
        while end > 0 && path_bytes[end - 1] == 0 {
            end -= 1;
        }
        let name = match std::str::from_utf8(&path_bytes[..end]) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let files_before = graph.files_len();
        let file = graph.file_id(name);
        if file.index() >= files_before {
            // The file is only known from the deps log; it is allowed to be
            // missing without that being a "no rule to make it" error.
            graph.file_mut(file).generated_by_dep_loader = true;
        }
        self.file_ids.insert(file, self.log_files.len());
        self.log_files.push(file);
        true
    }

    fn parse_deps_record(&mut self, payload: &[u8]) -> bool {
        if payload.len() < 12 || payload.len() % 4 != 0 {
            return false;
        }
        let mut r = Reader { buf: payload, ofs: 0 };
        let out_id = r.read_u32().unwrap() as usize;
        let mtime = MTime::from_raw(r.read_u64().unwrap());
        let out = match self.log_files.get(out_id) {
            Some(&f) => f,
            None => return false,
        };
        let mut ins = Vec::with_capacity((payload.len() - 12) / 4);
        while let Some(in_id) = r.read_u32() {
            match self.log_files.get(in_id as usize) {
                Some(&f) => ins.push(f),
                None => return false,
            }
        }
        self.total_records += 1;
        self.deps.insert(out, DepsEntry { mtime, ins });
        true
    }

    pub fn get_deps(&self, output: FileId) -> Option<&DepsEntry> {
        self.deps.get(&output)
    }

    /// True when enough shadowed records have accumulated that a rewrite
    /// would meaningfully shrink the file.
    pub fn needs_recompaction(&self) -> bool {
        self.total_records > MIN_COMPACTION_ENTRIES
            && self.total_records > self.deps.len() * COMPACTION_RATIO
    }

    pub fn open_for_write(&mut self) -> anyhow::Result<()> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        // A zero-length file needs its header too: corrupt logs are
        // truncated all the way back on open.
        let fresh = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path))?;
        if fresh {
            f.write_all(MAGIC)?;
            f.write_all(&VERSION.to_le_bytes())?;
            f.flush()?;
        }
        self.w = Some(f);
        Ok(())
    }

    fn ensure_id(&mut self, graph: &Graph, file: FileId) -> anyhow::Result<(usize, bool)> {
        if let Some(&id) = self.file_ids.get(&file) {
            return Ok((id, false));
        }
        let id = self.log_files.len();
        let name = graph.file(file).name.as_bytes();
        if let Some(w) = &mut self.w {
            let padding = (4 - name.len() % 4) % 4;
            let size = (name.len() + padding + 4) as u32;
            if size > MAX_RECORD_SIZE {
                bail!("deps log: path too long: {}", graph.file(file).name);
            }
            w.write_all(&size.to_le_bytes())?;
            w.write_all(name)?;
            w.write_all(&[0u8; 3][..padding])?;
            w.write_all(&(!(id as u32)).to_le_bytes())?;
        }
        self.file_ids.insert(file, id);
        self.log_files.push(file);
        Ok((id, true))
    }

    /// Record the dependencies discovered for an output.  Unchanged records
    /// are skipped to keep the log from growing without bound.
    pub fn record_deps(
        &mut self,
        graph: &Graph,
        output: FileId,
        mtime: MTime,
        ins: &[FileId],
    ) -> anyhow::Result<()> {
        let mut made_change = false;
        let (out_id, new) = self.ensure_id(graph, output)?;
        made_change |= new;
        let mut in_ids = Vec::with_capacity(ins.len());
        for &dep in ins {
            let (id, new) = self.ensure_id(graph, dep)?;
            made_change |= new;
            in_ids.push(id);
        }
        if !made_change {
            match self.deps.get(&output) {
                Some(entry) if entry.mtime == mtime && entry.ins == ins => return Ok(()),
                _ => {}
            }
        }

        if let Some(w) = &mut self.w {
            let size = (4 + 8 + 4 * in_ids.len()) as u32;
            if size > MAX_RECORD_SIZE {
                bail!("deps log: too many deps for {}", graph.file(output).name);
            }
            w.write_all(&(size | DEPS_RECORD_FLAG).to_le_bytes())?;
            w.write_all(&(out_id as u32).to_le_bytes())?;
            w.write_all(&mtime.to_raw().to_le_bytes())?;
            for id in &in_ids {
                w.write_all(&(*id as u32).to_le_bytes())?;
            }
            w.flush()?;
        }
        self.total_records += 1;
        self.deps.insert(
            output,
            DepsEntry {
                mtime,
                ins: ins.to_vec(),
            },
        );
        Ok(())
    }

    /// Rewrite the log keeping only the latest record per live output,
    /// renumbering ids densely.  Writes a temp file and renames it in.
    pub fn recompact(
        &mut self,
        graph: &Graph,
        is_live: &dyn Fn(FileId) -> bool,
    ) -> anyhow::Result<()> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let tmp = format!("{}.tmp", path);

        let mut fresh = DepsLog::new();
        fresh.path = Some(tmp.clone());
        {
            let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp))?;
            f.write_all(MAGIC)?;
            f.write_all(&VERSION.to_le_bytes())?;
            fresh.w = Some(f);

            let mut outputs: Vec<FileId> = self.deps.keys().copied().collect();
            outputs.sort_by(|&a, &b| graph.file(a).name.cmp(&graph.file(b).name));
            for output in outputs {
                if !is_live(output) {
                    continue;
                }
                let entry = self.deps[&output].clone();
                fresh.record_deps(graph, output, entry.mtime, &entry.ins)?;
            }
            fresh.w.as_mut().unwrap().flush()?;
        }
        std::fs::rename(&tmp, &path).with_context(|| format!("rename {}", tmp))?;

        fresh.path = Some(path.clone());
        fresh.total_records = fresh.deps.len();
        fresh.w = Some(std::fs::OpenOptions::new().append(true).open(&path)?);
        *self = fresh;
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.ofs + n > self.buf.len() {
            return None;
        }
        let s = &self.buf[self.ofs..self.ofs + n];
        self.ofs += n;
        Some(s)
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(dir: &tempfile::TempDir) -> String {
        dir.path().join(".ninja_deps").to_str().unwrap().to_string()
    }

    #[test]
    fn roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = temp_path(&dir);

        let mut graph = Graph::new();
        let out = graph.file_id("foo.o");
        let h1 = graph.file_id("foo.h");
        let h2 = graph.file_id("bar.h");
        {
            let mut log = DepsLog::open(&path, &mut graph)?;
            log.open_for_write()?;
            log.record_deps(&graph, out, MTime::Stamp(42), &[h1, h2])?;
        }

        // Reload into a fresh graph: identities come back via re-interning.
        let mut graph2 = Graph::new();
        let log = DepsLog::open(&path, &mut graph2)?;
        let out2 = graph2.lookup("foo.o").unwrap();
        let entry = log.get_deps(out2).unwrap();
        assert_eq!(entry.mtime, MTime::Stamp(42));
        let names: Vec<&str> = entry
            .ins
            .iter()
            .map(|&id| graph2.file(id).name.as_str())
            .collect();
        assert_eq!(names, vec!["foo.h", "bar.h"]);
        assert!(graph2.file(entry.ins[0]).generated_by_dep_loader);
        Ok(())
    }

    #[test]
    fn later_records_shadow_earlier() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = temp_path(&dir);

        let mut graph = Graph::new();
        let out = graph.file_id("foo.o");
        let h1 = graph.file_id("foo.h");
        let h2 = graph.file_id("bar.h");
        {
            let mut log = DepsLog::open(&path, &mut graph)?;
            log.open_for_write()?;
            log.record_deps(&graph, out, MTime::Stamp(1), &[h1])?;
            log.record_deps(&graph, out, MTime::Stamp(2), &[h2])?;
        }

        let mut graph2 = Graph::new();
        let log = DepsLog::open(&path, &mut graph2)?;
        let entry = log.get_deps(graph2.lookup("foo.o").unwrap()).unwrap();
        assert_eq!(entry.mtime, MTime::Stamp(2));
        assert_eq!(entry.ins.len(), 1);
        assert_eq!(graph2.file(entry.ins[0]).name, "bar.h");
        Ok(())
    }

    #[test]
    fn unchanged_deps_are_not_rewritten() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = temp_path(&dir);

        let mut graph = Graph::new();
        let out = graph.file_id("foo.o");
        let h = graph.file_id("foo.h");
        {
            let mut log = DepsLog::open(&path, &mut graph)?;
            log.open_for_write()?;
            log.record_deps(&graph, out, MTime::Stamp(1), &[h])?;
        }
        let size_once = std::fs::metadata(&path)?.len();
        {
            let mut log = DepsLog::open(&path, &mut graph)?;
            log.open_for_write()?;
            log.record_deps(&graph, out, MTime::Stamp(1), &[h])?;
        }
        assert_eq!(std::fs::metadata(&path)?.len(), size_once);
        Ok(())
    }

    #[test]
    fn corrupt_tail_truncated() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = temp_path(&dir);

        let mut graph = Graph::new();
        let out = graph.file_id("foo.o");
        let h = graph.file_id("foo.h");
        {
            let mut log = DepsLog::open(&path, &mut graph)?;
            log.open_for_write()?;
            log.record_deps(&graph, out, MTime::Stamp(9), &[h])?;
        }
        let good_len = std::fs::metadata(&path)?.len();
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path)?;
            // A record header promising more bytes than exist.
            f.write_all(&(32u32 | DEPS_RECORD_FLAG).to_le_bytes())?;
            f.write_all(&[1, 2, 3])?;
        }

        let mut graph2 = Graph::new();
        let log = DepsLog::open(&path, &mut graph2)?;
        assert!(log.get_deps(graph2.lookup("foo.o").unwrap()).is_some());
        assert_eq!(std::fs::metadata(&path)?.len(), good_len);
        Ok(())
    }

    #[test]
    fn recompact_drops_dead_and_shrinks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = temp_path(&dir);

        let mut graph = Graph::new();
        let live = graph.file_id("live.o");
        let dead = graph.file_id("dead.o");
        let h = graph.file_id("a.h");
        {
            let mut log = DepsLog::open(&path, &mut graph)?;
            log.open_for_write()?;
            for i in 0..50 {
                log.record_deps(&graph, live, MTime::Stamp(i + 1), &[h])?;
            }
            log.record_deps(&graph, dead, MTime::Stamp(1), &[h])?;
        }
        let size_before = std::fs::metadata(&path)?.len();

        {
            let mut log = DepsLog::open(&path, &mut graph)?;
            log.recompact(&graph, &|id| id == live || id == h)?;
            assert!(log.get_deps(live).is_some());
            assert!(log.get_deps(dead).is_none());
        }
        assert!(std::fs::metadata(&path)?.len() <= size_before);

        let mut graph2 = Graph::new();
        let log = DepsLog::open(&path, &mut graph2)?;
        let entry = log.get_deps(graph2.lookup("live.o").unwrap()).unwrap();
        assert_eq!(entry.mtime, MTime::Stamp(50));
        assert!(graph2.lookup("dead.o").is_none());
        Ok(())
    }
}
