//! The build graph: files, builds (commands), pools, and per-build file
//! state such as stat results and dirty bits.

use crate::densemap::{self, DenseMap};
use crate::fs::{FileSystem, MTime};
use anyhow::{anyhow, bail};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);
impl densemap::Index for FileId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for FileId {
    fn from(u: usize) -> FileId {
        FileId(u as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildId(u32);
impl densemap::Index for BuildId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for BuildId {
    fn from(u: usize) -> BuildId {
        BuildId(u as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);
impl densemap::Index for PoolId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for PoolId {
    fn from(u: usize) -> PoolId {
        PoolId(u as u32)
    }
}

/// One file path.  Produced by at most one build, consumed by any number.
#[derive(Debug)]
pub struct File {
    pub name: String,
    /// The unique build that produces this file, if any.
    pub input: Option<BuildId>,
    /// Builds that depend on this file.
    pub dependents: Vec<BuildId>,
    /// Set by the dependency scan; cleared again by restat propagation.
    pub dirty: bool,
    /// True while this file is a dyndep binding whose content has not been
    /// loaded yet.
    pub dyndep_pending: bool,
    /// True for files that only entered the graph via the deps log, a
    /// depfile, or a dyndep file.  Such files may legitimately not exist.
    pub generated_by_dep_loader: bool,
}

/// A concurrency bound shared by a class of builds.  Depth 0 means unbounded.
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub depth: usize,
}

/// The reserved console pool: depth 1, members own the terminal while running.
pub const CONSOLE_POOL: &str = "console";

/// Input files to a build, in explicit/implicit/order-only partitions.
/// Deps discovered from depfiles or the deps log splice into the implicit
/// section; validations are tracked separately since they never gate the
/// build itself.
#[derive(Debug, Default)]
pub struct BuildIns {
    pub ids: Vec<FileId>,
    pub explicit: usize,
    pub implicit: usize,
    pub order_only: usize,
}

#[derive(Debug, Default)]
pub struct BuildOuts {
    pub ids: Vec<FileId>,
    pub explicit: usize,
}

/// How discovered dependencies are communicated by the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsStyle {
    None,
    Gcc,
    Msvc,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RspFile {
    pub path: String,
    pub content: String,
}

/// Visit marks used by the dependency scan for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitMark {
    None,
    InStack,
    Done,
}

/// One build statement: a command along with its inputs and outputs.
#[derive(Debug)]
pub struct Build {
    /// Source location, for diagnostics ("build.ninja:32").
    pub location: String,
    /// Expanded command line to run; None for phony builds.
    pub cmdline: Option<String>,
    pub desc: Option<String>,
    pub depfile: Option<String>,
    pub rspfile: Option<RspFile>,
    pub deps: DepsStyle,
    pub msvc_deps_prefix: Option<String>,
    pub restat: bool,
    pub generator: bool,
    pub pool: PoolId,
    /// File to load dyndep patches from at build time, if any.
    pub dyndep: Option<FileId>,

    pub ins: BuildIns,
    pub validations: Vec<FileId>,
    pub outs: BuildOuts,

    // Scan/plan state, reset per process.
    pub mark: VisitMark,
    pub deps_loaded: bool,
    pub deps_missing: bool,
    pub outputs_ready: bool,
}

impl Build {
    pub fn is_phony(&self) -> bool {
        self.cmdline.is_none()
    }

    /// All inputs that affect dirtiness: explicit and implicit, including
    /// spliced discovered deps, but not order-only inputs.
    pub fn dirtying_ins(&self) -> &[FileId] {
        &self.ins.ids[0..self.ins.explicit + self.ins.implicit]
    }

    pub fn order_only_ins(&self) -> &[FileId] {
        let start = self.ins.explicit + self.ins.implicit;
        &self.ins.ids[start..start + self.ins.order_only]
    }

    /// All inputs walked for scheduling: everything but validations.
    pub fn scheduling_ins(&self) -> &[FileId] {
        &self.ins.ids
    }

    pub fn outs(&self) -> &[FileId] {
        &self.outs.ids
    }

    pub fn primary_out(&self) -> FileId {
        self.outs.ids[0]
    }

    /// Splice discovered dependencies in just before the order-only section.
    pub fn insert_implicit_ins(&mut self, deps: &[FileId]) {
        let pos = self.ins.explicit + self.ins.implicit;
        self.ins.ids.splice(pos..pos, deps.iter().copied());
        self.ins.implicit += deps.len();
    }

    pub fn add_implicit_out(&mut self, id: FileId) {
        self.outs.ids.push(id);
    }
}

/// The build graph and everything the manifest interned into it.
#[derive(Debug)]
pub struct Graph {
    files: DenseMap<FileId, File>,
    by_name: HashMap<String, FileId>,
    pub builds: DenseMap<BuildId, Build>,
    pub pools: DenseMap<PoolId, Pool>,
    pool_names: HashMap<String, PoolId>,
}

/// The id of the default (unbounded) pool.
pub const DEFAULT_POOL: PoolId = PoolId(0);

impl Graph {
    pub fn new() -> Graph {
        let mut graph = Graph {
            files: DenseMap::new(),
            by_name: HashMap::new(),
            builds: DenseMap::new(),
            pools: DenseMap::new(),
            pool_names: HashMap::new(),
        };
        graph.add_pool(Pool {
            name: String::new(),
            depth: 0,
        });
        graph.add_pool(Pool {
            name: CONSOLE_POOL.to_string(),
            depth: 1,
        });
        graph
    }

    /// Intern a (canonicalized) path, creating its File on first reference.
    pub fn file_id(&mut self, name: impl Into<String>) -> FileId {
        let name = name.into();
        match self.by_name.get(&name) {
            Some(&id) => id,
            None => {
                let id = self.files.push(File {
                    name: name.clone(),
                    input: None,
                    dependents: Vec::new(),
                    dirty: false,
                    dyndep_pending: false,
                    generated_by_dep_loader: false,
                });
                self.by_name.insert(name, id);
                id
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<FileId> {
        self.by_name.get(name).copied()
    }

    pub fn file(&self, id: FileId) -> &File {
        self.files.get(id)
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut File {
        self.files.get_mut(id)
    }

    pub fn files_len(&self) -> usize {
        self.files.len()
    }

    pub fn file_ids(&self) -> impl Iterator<Item = FileId> {
        self.files.ids()
    }

    pub fn build(&self, id: BuildId) -> &Build {
        self.builds.get(id)
    }

    pub fn build_mut(&mut self, id: BuildId) -> &mut Build {
        self.builds.get_mut(id)
    }

    /// Add a build, linking its outputs and inputs.  Fails when an output
    /// already has a producer.
    pub fn add_build(&mut self, build: Build) -> anyhow::Result<BuildId> {
        if build.outs.ids.is_empty() {
            bail!("{}: build statement needs at least one output", build.location);
        }
        let id = self.builds.next_id();
        for &out in &build.outs.ids {
            let file = self.files.get_mut(out);
            if file.input.is_some() {
                bail!("multiple rules generate {}", file.name);
            }
            file.input = Some(id);
        }
        for &f in build.ins.ids.iter().chain(build.validations.iter()) {
            self.files.get_mut(f).dependents.push(id);
        }
        self.builds.push(build);
        Ok(id)
    }

    pub fn add_pool(&mut self, pool: Pool) -> PoolId {
        let name = pool.name.clone();
        let id = self.pools.push(pool);
        self.pool_names.insert(name, id);
        id
    }

    pub fn pool_by_name(&self, name: &str) -> Option<PoolId> {
        self.pool_names.get(name).copied()
    }

    /// Whether a pool is the reserved console pool, whose members own the
    /// terminal while they run.
    pub fn pool_is_console(&self, id: PoolId) -> bool {
        self.pools.get(id).name == CONSOLE_POOL
    }

    /// Clear the per-run scan state so the graph can be scanned again, e.g.
    /// after the manifest rebuilt itself.  Dependencies spliced into builds
    /// stay; they are re-derived from the logs on the next scan anyway.
    pub fn reset(&mut self) {
        for id in self.files.ids().collect::<Vec<_>>() {
            self.files.get_mut(id).dirty = false;
        }
        for id in self.builds.ids().collect::<Vec<_>>() {
            let build = self.builds.get_mut(id);
            build.mark = VisitMark::None;
            build.outputs_ready = false;
            build.deps_loaded = false;
            build.deps_missing = false;
        }
    }
}

/// Stat results and per-file build state, covering the same id space as
/// Graph's files; None means "not stat()ed yet".
pub struct FileState(DenseMap<FileId, Option<MTime>>);

impl FileState {
    pub fn new(graph: &Graph) -> Self {
        FileState(DenseMap::new_sized(graph.files.next_id(), None))
    }

    pub fn get(&self, id: FileId) -> Option<MTime> {
        self.0.get_or(id, None)
    }

    pub fn set(&mut self, id: FileId, mtime: MTime) {
        self.0.set_grow(id, Some(mtime), None);
    }

    /// stat() a file unless we already have its state.
    pub fn stat_if_necessary(
        &mut self,
        graph: &Graph,
        fs: &dyn FileSystem,
        id: FileId,
    ) -> anyhow::Result<MTime> {
        if let Some(mtime) = self.get(id) {
            return Ok(mtime);
        }
        self.restat(graph, fs, id)
    }

    /// stat() a file even if we have its state, e.g. after a command ran.
    pub fn restat(
        &mut self,
        graph: &Graph,
        fs: &dyn FileSystem,
        id: FileId,
    ) -> anyhow::Result<MTime> {
        let name = &graph.file(id).name;
        let mtime = fs
            .stat(name)
            .map_err(|err| anyhow!("stat {}: {}", name, err))?;
        self.set(id, mtime);
        Ok(mtime)
    }
}
