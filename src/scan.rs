//! The dependency scan: walks a target's input closure, stats files, loads
//! discovered dependencies (deps log, depfiles, ready dyndep files), and
//! decides which files are dirty.

use crate::build_log::BuildLog;
use crate::canon::canon_path;
use crate::depfile::{self, DepfileOptions};
use crate::deps_log::DepsLog;
use crate::dyndep;
use crate::fs::{FileSystem, MTime};
use crate::graph::{BuildId, DepsStyle, FileId, FileState, Graph, VisitMark};
use crate::hash::hash_command;
use crate::scanner::Scanner;
use anyhow::{anyhow, bail};
use std::path::Path;

/// Print an "explain:" line describing a dirtiness decision, behind -d explain.
macro_rules! explain {
    ($enabled:expr, $($args:tt)*) => {
        if $enabled {
            eprintln!("explain: {}", format!($($args)*));
        }
    };
}

#[derive(Clone, Copy, Default)]
pub struct ScanOptions {
    pub explain: bool,
    pub depfile: DepfileOptions,
}

/// Borrowed view of everything a dependency scan needs.  The graph and the
/// file state are passed into each call since the scan mutates them.
pub struct DepScan<'a> {
    pub fs: &'a dyn FileSystem,
    pub build_log: &'a BuildLog,
    pub deps_log: &'a DepsLog,
    pub options: ScanOptions,
}

impl DepScan<'_> {
    /// Walk the dependency graph from `id`, computing dirty state for
    /// everything reachable.  Validation targets encountered along the way
    /// are scanned too and appended to `validations` for the caller to
    /// schedule.
    pub fn recompute_dirty(
        &self,
        graph: &mut Graph,
        file_state: &mut FileState,
        id: FileId,
        validations: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        let mut queue = std::collections::VecDeque::from([id]);
        while let Some(node) = queue.pop_front() {
            let mut stack = Vec::new();
            let mut new_validations = Vec::new();
            self.node_dirty(graph, file_state, node, &mut stack, &mut new_validations)?;
            queue.extend(new_validations.iter().copied());
            validations.extend(new_validations);
        }
        Ok(())
    }

    fn node_dirty(
        &self,
        graph: &mut Graph,
        file_state: &mut FileState,
        id: FileId,
        stack: &mut Vec<(BuildId, FileId)>,
        validations: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        match graph.file(id).input {
            None => {
                // A leaf file: dirty when missing.
                let mtime = file_state.stat_if_necessary(graph, self.fs, id)?;
                let missing = mtime == MTime::Missing;
                if missing {
                    explain!(
                        self.options.explain,
                        "{} has no producing rule and is missing",
                        graph.file(id).name
                    );
                }
                graph.file_mut(id).dirty = missing;
                Ok(())
            }
            Some(bid) => self.build_dirty(graph, file_state, bid, id, stack, validations),
        }
    }

    fn build_dirty(
        &self,
        graph: &mut Graph,
        file_state: &mut FileState,
        bid: BuildId,
        via: FileId,
        stack: &mut Vec<(BuildId, FileId)>,
        validations: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        match graph.build(bid).mark {
            VisitMark::Done => return Ok(()),
            VisitMark::InStack => {
                // Re-entry: the stack from the first visit to here is a cycle.
                let pos = stack
                    .iter()
                    .position(|&(b, _)| b == bid)
                    .expect("in-stack build missing from stack");
                let mut names: Vec<&str> = stack[pos..]
                    .iter()
                    .map(|&(_, f)| graph.file(f).name.as_str())
                    .collect();
                names.push(&graph.file(via).name);
                bail!("dependency cycle: {}", names.join(" -> "));
            }
            VisitMark::None => {}
        }
        graph.build_mut(bid).mark = VisitMark::InStack;
        stack.push((bid, via));

        let mut dirty = false;
        {
            let build = graph.build_mut(bid);
            build.outputs_ready = true;
            build.deps_missing = false;
        }

        let deps_loaded = graph.build(bid).deps_loaded;
        if !deps_loaded {
            // First encounter with this build this run; a pending dyndep file
            // is visited (and loaded, if it is already up to date) before
            // anything else since it can add inputs and outputs.
            if let Some(dd) = graph.build(bid).dyndep {
                if graph.file(dd).dyndep_pending {
                    self.node_dirty(graph, file_state, dd, stack, validations)?;
                    let dd_ready = match graph.file(dd).input {
                        None => true,
                        Some(producer) => graph.build(producer).outputs_ready,
                    };
                    if dd_ready {
                        dyndep::load_and_apply(self.fs, graph, dd)?;
                    }
                }
            }
        }

        // Load output mtimes so we can compare them to the most recent input.
        for i in 0..graph.build(bid).outs().len() {
            let out = graph.build(bid).outs()[i];
            file_state.stat_if_necessary(graph, self.fs, out)?;
        }

        if !deps_loaded {
            graph.build_mut(bid).deps_loaded = true;
            if !self.load_deps(graph, file_state, bid)? {
                // Failed to find dependency info: rebuild to regenerate it.
                graph.build_mut(bid).deps_missing = true;
                dirty = true;
            }
        }

        // Visit all inputs; we're dirty if any non-order-only input is.
        let ins: Vec<FileId> = graph.build(bid).ins.ids.clone();
        let dirtying = graph.build(bid).dirtying_ins().len();
        let mut most_recent_input: Option<(MTime, FileId)> = None;
        for (i, &in_id) in ins.iter().enumerate() {
            self.node_dirty(graph, file_state, in_id, stack, validations)?;

            // If an input is not ready, neither are our outputs.
            if let Some(in_edge) = graph.file(in_id).input {
                if !graph.build(in_edge).outputs_ready {
                    graph.build_mut(bid).outputs_ready = false;
                }
            }

            if i < dirtying {
                if graph.file(in_id).dirty {
                    explain!(self.options.explain, "{} is dirty", graph.file(in_id).name);
                    dirty = true;
                } else {
                    let mtime = file_state.get(in_id).unwrap_or(MTime::Missing);
                    if most_recent_input.map_or(true, |(best, _)| mtime > best) {
                        most_recent_input = Some((mtime, in_id));
                    }
                }
            }
        }

        // Validation targets don't gate this build; hand them to the caller.
        validations.extend(graph.build(bid).validations.iter().copied());

        // We may also be dirty due to output state: missing outputs, out of
        // date outputs, etc.
        if !dirty {
            dirty = self.outputs_dirty(graph, file_state, bid, most_recent_input)?;
        }

        if dirty {
            for i in 0..graph.build(bid).outs().len() {
                let out = graph.build(bid).outs()[i];
                graph.file_mut(out).dirty = true;
            }
        }

        // A dirty build's outputs are normally not ready.  (Clean but not
        // ready happens with order-only inputs.)  Phony builds with no
        // inputs have nothing to do, so they are always ready.
        let build = graph.build_mut(bid);
        if dirty && !(build.is_phony() && build.ins.ids.is_empty()) {
            build.outputs_ready = false;
        }

        build.mark = VisitMark::Done;
        stack.pop();
        Ok(())
    }

    /// Decide whether any output is out of date with respect to the inputs,
    /// the build log, or the disk.  Also used by restat propagation to
    /// re-evaluate outputs after a command declined to touch them.
    pub fn outputs_dirty(
        &self,
        graph: &Graph,
        file_state: &mut FileState,
        bid: BuildId,
        most_recent_input: Option<(MTime, FileId)>,
    ) -> anyhow::Result<bool> {
        for &out in graph.build(bid).outs() {
            if self.output_dirty(graph, file_state, bid, out, most_recent_input)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn output_dirty(
        &self,
        graph: &Graph,
        file_state: &mut FileState,
        bid: BuildId,
        out: FileId,
        most_recent_input: Option<(MTime, FileId)>,
    ) -> anyhow::Result<bool> {
        let build = graph.build(bid);
        let mtime = file_state.stat_if_necessary(graph, self.fs, out)?;
        let out_name = &graph.file(out).name;

        if build.is_phony() {
            // Phony builds don't write output; it is only dirty when there
            // are no inputs and the output doesn't exist either.
            if build.ins.ids.is_empty() && mtime == MTime::Missing {
                explain!(
                    self.options.explain,
                    "output {} of phony build with no inputs doesn't exist",
                    out_name
                );
                return Ok(true);
            }
            return Ok(false);
        }

        if mtime == MTime::Missing {
            explain!(self.options.explain, "output {} doesn't exist", out_name);
            return Ok(true);
        }

        let mut log_entry = None;
        if let Some((input_mtime, input_id)) = most_recent_input {
            if mtime < input_mtime {
                // The output is older than the input, but a restat build may
                // have recorded a fresher effective mtime in the log.
                let mut output_mtime = mtime;
                let mut used_restat = false;
                if build.restat {
                    if let Some(entry) = self.build_log.lookup(out_name) {
                        output_mtime = entry.mtime;
                        used_restat = true;
                        log_entry = Some(entry);
                    }
                }
                if output_mtime < input_mtime {
                    explain!(
                        self.options.explain,
                        "{}output {} older than most recent input {}",
                        if used_restat { "restat of " } else { "" },
                        out_name,
                        graph.file(input_id).name
                    );
                    return Ok(true);
                }
            }
        }

        if log_entry.is_none() {
            log_entry = self.build_log.lookup(out_name);
        }
        match log_entry {
            Some(entry) => {
                if !build.generator {
                    let hash = hash_command(
                        build.cmdline.as_deref().unwrap_or(""),
                        build.rspfile.as_ref().map(|r| r.content.as_str()),
                    );
                    if entry.command_hash != hash.0 {
                        explain!(
                            self.options.explain,
                            "command line changed for {}",
                            out_name
                        );
                        return Ok(true);
                    }
                }
                if let Some((input_mtime, _)) = most_recent_input {
                    if entry.mtime < input_mtime {
                        explain!(
                            self.options.explain,
                            "recorded mtime of {} older than most recent input",
                            out_name
                        );
                        return Ok(true);
                    }
                }
            }
            None => {
                if !build.generator {
                    explain!(
                        self.options.explain,
                        "command line not found in log for {}",
                        out_name
                    );
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Splice in dependencies discovered on a previous run.  Ok(false) means
    /// no usable record exists and the build must rerun to regenerate it.
    fn load_deps(
        &self,
        graph: &mut Graph,
        file_state: &mut FileState,
        bid: BuildId,
    ) -> anyhow::Result<bool> {
        match graph.build(bid).deps {
            DepsStyle::Gcc | DepsStyle::Msvc => {
                let out = graph.build(bid).primary_out();
                let entry = match self.deps_log.get_deps(out) {
                    None => {
                        explain!(
                            self.options.explain,
                            "deps for '{}' are missing",
                            graph.file(out).name
                        );
                        return Ok(false);
                    }
                    Some(e) => e,
                };
                // The record is stale if the output changed after it was
                // written.
                let out_mtime = file_state.get(out).unwrap_or(MTime::Missing);
                if out_mtime > entry.mtime {
                    explain!(
                        self.options.explain,
                        "stale deps detected for '{}'",
                        graph.file(out).name
                    );
                    return Ok(false);
                }
                let ins = entry.ins.clone();
                self.splice_deps(graph, bid, &ins);
                Ok(true)
            }
            DepsStyle::None => match graph.build(bid).depfile.clone() {
                Some(depfile) => self.load_depfile_deps(graph, bid, &depfile),
                None => Ok(true),
            },
        }
    }

    fn load_depfile_deps(
        &self,
        graph: &mut Graph,
        bid: BuildId,
        depfile_path: &str,
    ) -> anyhow::Result<bool> {
        let mut bytes = match self.fs.read(depfile_path) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                explain!(
                    self.options.explain,
                    "depfile '{}' is missing",
                    depfile_path
                );
                return Ok(false);
            }
            Err(err) => return Err(anyhow!("read {}: {}", depfile_path, err)),
        };
        bytes.push(0);
        let mut scanner = Scanner::new(&bytes);
        let parsed = depfile::parse(&mut scanner, self.options.depfile)
            .map_err(|err| anyhow!(scanner.format_parse_error(Path::new(depfile_path), err)))?;

        let primary_out = &graph.file(graph.build(bid).primary_out()).name;
        match &parsed.target {
            Some(target) if &canon_path(target.as_str()) == primary_out => {}
            other => bail!(
                "expected depfile '{}' to mention '{}', got '{}'",
                depfile_path,
                primary_out,
                other.as_deref().unwrap_or("")
            ),
        }

        let mut ins = Vec::with_capacity(parsed.deps.len());
        for dep in &parsed.deps {
            ins.push(intern_dep_loader_path(graph, canon_path(dep.as_str())));
        }
        self.splice_deps(graph, bid, &ins);
        Ok(true)
    }

    fn splice_deps(&self, graph: &mut Graph, bid: BuildId, deps: &[FileId]) {
        graph.build_mut(bid).insert_implicit_ins(deps);
        for &dep in deps {
            graph.file_mut(dep).dependents.push(bid);
        }
    }
}

/// Intern a path discovered by dep loading, flagging newly created files so
/// their absence is not a "no rule to make it" error.
pub fn intern_dep_loader_path(graph: &mut Graph, name: String) -> FileId {
    use crate::densemap::Index;
    let files_before = graph.files_len();
    let id = graph.file_id(name);
    if id.index() >= files_before {
        graph.file_mut(id).generated_by_dep_loader = true;
    }
    id
}
