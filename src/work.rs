//! The build plan and driver: tracking which builds are wanted and ready,
//! admitting them against pool limits, running their commands, and folding
//! results back into the logs and the plan.

use crate::build_log::BuildLog;
use crate::canon::canon_path;
use crate::densemap::DenseMap;
use crate::deps_log::DepsLog;
use crate::dyndep::{self, DyndepFile};
use crate::fs::{FileSystem, MTime};
use crate::graph::{BuildId, DepsStyle, FileId, FileState, Graph, PoolId};
use crate::hash::hash_command;
use crate::progress::Progress;
use crate::scan::{intern_dep_loader_path, DepScan, ScanOptions};
use crate::scanner::Scanner;
use crate::signal;
use crate::task::{CommandRunner, FinishedTask, TaskResult, Termination};
use anyhow::{anyhow, bail};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

/// Marker error for user interruption, so the CLI can exit with code 2.
#[derive(Debug)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("interrupted by user")
    }
}

impl std::error::Error for Interrupted {}

#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Command failures tolerated before the build stops starting new work.
    /// 0 means keep going as long as progress is possible.
    pub failures_allowed: usize,
    pub explain: bool,
    pub keep_rsp: bool,
    pub keep_depfile: bool,
    pub depfile: crate::depfile::DepfileOptions,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            failures_allowed: 1,
            explain: false,
            keep_rsp: false,
            keep_depfile: false,
            depfile: crate::depfile::DepfileOptions::default(),
        }
    }
}

/// Externally visible state of one build, for progress display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    Want,
    Ready,
    Queued,
    Running,
    Done,
    Failed,
}

/// Counts of builds in each state.  Only command (non-phony) builds are
/// counted; phony builds resolve instantly and would only add noise.
#[derive(Clone, Debug, Default)]
pub struct StateCounts([isize; 6]);

impl StateCounts {
    fn idx(state: BuildState) -> usize {
        match state {
            BuildState::Want => 0,
            BuildState::Ready => 1,
            BuildState::Queued => 2,
            BuildState::Running => 3,
            BuildState::Done => 4,
            BuildState::Failed => 5,
        }
    }

    pub fn add(&mut self, state: BuildState, delta: isize) {
        self.0[StateCounts::idx(state)] += delta;
    }

    pub fn get(&self, state: BuildState) -> usize {
        self.0[StateCounts::idx(state)].max(0) as usize
    }

    pub fn total(&self) -> usize {
        self.0.iter().map(|&c| c.max(0) as usize).sum()
    }
}

/// What we want out of a given build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Want {
    /// We do not want to run the build, but we may want one of its dependents.
    Nothing,
    /// We want to run the build but have not yet scheduled it.
    ToStart,
    /// The build has been scheduled and we are waiting for it to finish.
    ToFinish,
}

struct PoolState {
    depth: usize,
    current_use: usize,
    /// Ready builds held back because the pool was full when they were
    /// popped; reconsidered whenever the pool releases a slot.
    delayed: Vec<BuildId>,
}

/// Plan stores the state of the build plan: what we intend to run,
/// which builds are ready to be run.
pub struct Plan {
    /// Builds in the plan.  No entry means the build is not part of the
    /// plan at all; Want::Nothing means only its dependents are.
    want: HashMap<BuildId, Want>,
    ready: Vec<BuildId>,
    pools: DenseMap<PoolId, PoolState>,
    /// Remaining builds (of any kind) we want to run.
    wanted_edges: usize,
    /// Builds with actual commands, over the plan's lifetime, minus any
    /// cancelled by restat propagation.
    command_edges: usize,
    counts: StateCounts,
}

impl Plan {
    pub fn new(graph: &Graph) -> Self {
        let mut pools = DenseMap::new();
        for (_, pool) in graph.pools.iter() {
            pools.push(PoolState {
                depth: pool.depth,
                current_use: 0,
                delayed: Vec::new(),
            });
        }
        Plan {
            want: HashMap::new(),
            ready: Vec::new(),
            pools,
            wanted_edges: 0,
            command_edges: 0,
            counts: StateCounts::default(),
        }
    }

    pub fn counts(&self) -> &StateCounts {
        &self.counts
    }

    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    /// Clear all plan state, leaving the graph's dirty bits alone.
    pub fn reset(&mut self) {
        self.want.clear();
        self.ready.clear();
        for id in self.pools.ids().collect::<Vec<_>>() {
            let pool = self.pools.get_mut(id);
            pool.current_use = 0;
            pool.delayed.clear();
        }
        self.wanted_edges = 0;
        self.command_edges = 0;
        self.counts = StateCounts::default();
    }

    /// Add a target and its dirty dependencies to the plan.  Ok(false) means
    /// the target needs no work.
    pub fn add_target(&mut self, graph: &mut Graph, id: FileId) -> anyhow::Result<bool> {
        self.add_sub_target(graph, id, None, None)
    }

    fn add_sub_target(
        &mut self,
        graph: &mut Graph,
        id: FileId,
        dependent: Option<FileId>,
        mut dyndep_walk: Option<&mut HashSet<BuildId>>,
    ) -> anyhow::Result<bool> {
        let bid = match graph.file(id).input {
            None => {
                // A leaf.  Source files may be dirty only when missing, which
                // stops the build; files known only from dep loaders are
                // allowed to be missing.
                if graph.file(id).dirty && !graph.file(id).generated_by_dep_loader {
                    let referenced = match dependent {
                        Some(d) => format!(", needed by '{}',", graph.file(d).name),
                        None => String::new(),
                    };
                    bail!(
                        "'{}'{} missing and no known rule to make it",
                        graph.file(id).name,
                        referenced
                    );
                }
                return Ok(false);
            }
            Some(bid) => bid,
        };

        if graph.build(bid).outputs_ready {
            return Ok(false);
        }

        let first_visit = !self.want.contains_key(&bid);
        if first_visit {
            self.want.insert(bid, Want::Nothing);
        }

        if dyndep_walk.is_some() && self.want[&bid] == Want::ToFinish {
            // Already scheduled; nothing to refresh.
            return Ok(true);
        }

        if graph.file(id).dirty && self.want[&bid] == Want::Nothing {
            self.want.insert(bid, Want::ToStart);
            self.edge_wanted(graph, bid);
        }

        if let Some(walk) = dyndep_walk.as_deref_mut() {
            walk.insert(bid);
        }

        if !first_visit {
            return Ok(true);
        }

        for i in 0..graph.build(bid).ins.ids.len() {
            let in_id = graph.build(bid).ins.ids[i];
            self.add_sub_target(graph, in_id, Some(id), dyndep_walk.as_deref_mut())?;
        }
        Ok(true)
    }

    fn edge_wanted(&mut self, graph: &Graph, bid: BuildId) {
        self.wanted_edges += 1;
        if !graph.build(bid).is_phony() {
            self.command_edges += 1;
            self.counts.add(BuildState::Want, 1);
        }
    }

    fn all_inputs_ready(&self, graph: &Graph, bid: BuildId) -> bool {
        graph
            .build(bid)
            .scheduling_ins()
            .iter()
            .all(|&i| match graph.file(i).input {
                Some(in_edge) => graph.build(in_edge).outputs_ready,
                None => true,
            })
    }

    /// Submit a build whose inputs are all ready for execution.
    fn schedule_work(&mut self, graph: &Graph, bid: BuildId) {
        let want = self.want.get_mut(&bid).expect("scheduled build not wanted");
        if *want == Want::ToFinish {
            return; // Already scheduled.
        }
        *want = Want::ToFinish;
        if !graph.build(bid).is_phony() {
            self.counts.add(BuildState::Want, -1);
            self.counts.add(BuildState::Ready, 1);
        }
        self.ready.push(bid);
    }

    /// Pop a ready build, subject to pool limits.  Pops in first-output-path
    /// order so scheduling is reproducible; builds displaced by a full pool
    /// park on the pool's delayed list until a slot opens.
    pub fn find_work(&mut self, graph: &Graph) -> Option<BuildId> {
        loop {
            if self.ready.is_empty() {
                return None;
            }
            let mut best = 0;
            for i in 1..self.ready.len() {
                let name = |b: BuildId| &graph.file(graph.build(b).primary_out()).name;
                if name(self.ready[i]) < name(self.ready[best]) {
                    best = i;
                }
            }
            let bid = self.ready.remove(best);
            if self.want.get(&bid) == Some(&Want::Nothing) {
                continue; // Cancelled while queued.
            }
            let pool = self.pools.get_mut(graph.build(bid).pool);
            if pool.depth > 0 && pool.current_use >= pool.depth {
                pool.delayed.push(bid);
                continue;
            }
            pool.current_use += 1;
            if !graph.build(bid).is_phony() {
                self.counts.add(BuildState::Ready, -1);
                self.counts.add(BuildState::Queued, 1);
            }
            return Some(bid);
        }
    }

    /// Mark a build as finished, successfully or not.  Success propagates
    /// readiness to dependents; outputs that turn out to be pending dyndep
    /// files are reported through `dyndeps_out` for the driver to load.
    pub fn edge_finished(
        &mut self,
        graph: &mut Graph,
        bid: BuildId,
        success: bool,
        dyndeps_out: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        let want = *self.want.get(&bid).expect("finished build not in plan");
        let directly_wanted = want != Want::Nothing;

        // Release the pool slot and requeue anything the pool was delaying.
        if directly_wanted {
            let pool = self.pools.get_mut(graph.build(bid).pool);
            if pool.current_use > 0 {
                pool.current_use -= 1;
            }
            let delayed = std::mem::take(&mut pool.delayed);
            self.ready.extend(delayed);
        }

        // A failed build stays in `want` so the plan cannot mistake it for
        // satisfied; its outputs never become ready.
        if !success {
            return Ok(());
        }

        if directly_wanted {
            self.wanted_edges -= 1;
        }
        self.want.remove(&bid);
        graph.build_mut(bid).outputs_ready = true;

        for i in 0..graph.build(bid).outs().len() {
            let out = graph.build(bid).outs()[i];
            self.node_finished(graph, out, dyndeps_out)?;
        }
        Ok(())
    }

    fn node_finished(
        &mut self,
        graph: &mut Graph,
        id: FileId,
        dyndeps_out: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        // If this file provides dyndep info, it must be loaded (by the
        // driver) before dependents can be scheduled correctly.
        if graph.file(id).dyndep_pending {
            dyndeps_out.push(id);
            return Ok(());
        }

        let dependents = graph.file(id).dependents.clone();
        for bid in dependents {
            if self.want.contains_key(&bid) {
                self.edge_maybe_ready(graph, bid, dyndeps_out)?;
            }
        }
        Ok(())
    }

    fn edge_maybe_ready(
        &mut self,
        graph: &mut Graph,
        bid: BuildId,
        dyndeps_out: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        if !self.all_inputs_ready(graph, bid) {
            return Ok(());
        }
        if self.want[&bid] != Want::Nothing {
            self.schedule_work(graph, bid);
        } else {
            // We don't need to run this build, but downstream consumers were
            // waiting on it, so resolve it as finished.
            self.edge_finished(graph, bid, true, dyndeps_out)?;
        }
        Ok(())
    }

    /// A restat build left this file unchanged: mark it clean and cancel any
    /// wanted dependents whose outputs turn out to be up to date after all.
    pub fn clean_node(
        &mut self,
        scan: &DepScan,
        graph: &mut Graph,
        file_state: &mut FileState,
        id: FileId,
    ) -> anyhow::Result<()> {
        graph.file_mut(id).dirty = false;
        let dependents = graph.file(id).dependents.clone();
        for bid in dependents {
            match self.want.get(&bid) {
                None | Some(Want::Nothing) => continue,
                Some(_) => {}
            }
            if graph.build(bid).deps_missing {
                continue;
            }
            let dirtying: Vec<FileId> = graph.build(bid).dirtying_ins().to_vec();
            if dirtying.iter().any(|&i| graph.file(i).dirty) {
                continue;
            }
            let mut most_recent_input: Option<(MTime, FileId)> = None;
            for &i in &dirtying {
                let mtime = file_state.get(i).unwrap_or(MTime::Missing);
                if most_recent_input.map_or(true, |(best, _)| mtime > best) {
                    most_recent_input = Some((mtime, i));
                }
            }
            if scan.outputs_dirty(graph, file_state, bid, most_recent_input)? {
                continue;
            }
            for out in graph.build(bid).outs().to_vec() {
                self.clean_node(scan, graph, file_state, out)?;
            }
            self.want.insert(bid, Want::Nothing);
            self.wanted_edges -= 1;
            if !graph.build(bid).is_phony() {
                self.command_edges -= 1;
                self.counts.add(BuildState::Want, -1);
            }
        }
        Ok(())
    }

    /// Update the plan for graph modifications made by a freshly loaded
    /// dyndep file.
    pub fn dyndeps_loaded(
        &mut self,
        scan: &DepScan,
        graph: &mut Graph,
        file_state: &mut FileState,
        node: FileId,
        ddf: &DyndepFile,
        dyndeps_out: &mut Vec<FileId>,
    ) -> anyhow::Result<()> {
        // Recompute the dirty state of all dependents now that the dyndep
        // information is in the graph.
        self.refresh_dyndep_dependents(scan, graph, file_state, node)?;

        // Pull the dyndep-discovered inputs of planned builds into the plan.
        let mut walk: HashSet<BuildId> = HashSet::new();
        for (bid, dyndeps) in ddf.iter() {
            let bid = *bid;
            if graph.build(bid).outputs_ready {
                continue;
            }
            if !self.want.contains_key(&bid) {
                continue;
            }
            let out0 = graph.build(bid).primary_out();
            for &input in &dyndeps.implicit_ins {
                self.add_sub_target(graph, input, Some(out0), Some(&mut walk))?;
            }
        }

        // The builds that were waiting on the dyndep file itself get a
        // readiness check, just as NodeFinished would have given them.
        for bid in graph.file(node).dependents.clone() {
            if self.want.contains_key(&bid) {
                walk.insert(bid);
            }
        }

        for bid in walk {
            if self.want.contains_key(&bid) {
                self.edge_maybe_ready(graph, bid, dyndeps_out)?;
            }
        }
        Ok(())
    }

    fn refresh_dyndep_dependents(
        &mut self,
        scan: &DepScan,
        graph: &mut Graph,
        file_state: &mut FileState,
        node: FileId,
    ) -> anyhow::Result<()> {
        // Collect the transitive dependents and clear their scan marks so
        // they can be visited again.
        let mut dependents: HashSet<FileId> = HashSet::new();
        self.unmark_dependents(graph, node, &mut dependents);

        for &n in &dependents {
            let mut validations = Vec::new();
            scan.recompute_dirty(graph, file_state, n, &mut validations)?;
            for v in validations {
                if let Some(in_edge) = graph.file(v).input {
                    if !graph.build(in_edge).outputs_ready {
                        self.add_target(graph, v)?;
                    }
                }
            }
            if !graph.file(n).dirty {
                continue;
            }
            // An output that only now became known-dirty makes its build
            // wanted.
            let bid = graph.file(n).input.expect("dyndep dependent must be built");
            if let Some(want) = self.want.get(&bid) {
                if *want == Want::Nothing {
                    self.want.insert(bid, Want::ToStart);
                    self.edge_wanted(graph, bid);
                }
            }
        }
        Ok(())
    }

    fn unmark_dependents(
        &self,
        graph: &mut Graph,
        id: FileId,
        dependents: &mut HashSet<FileId>,
    ) {
        for bid in graph.file(id).dependents.clone() {
            if !self.want.contains_key(&bid) {
                continue;
            }
            if graph.build(bid).mark != crate::graph::VisitMark::None {
                graph.build_mut(bid).mark = crate::graph::VisitMark::None;
                for out in graph.build(bid).outs().to_vec() {
                    if dependents.insert(out) {
                        self.unmark_dependents(graph, out, dependents);
                    }
                }
            }
        }
    }
}

/// Work drives the whole build: scan targets, run the plan to completion,
/// keep the logs current.
pub struct Work<'a> {
    fs: &'a dyn FileSystem,
    graph: &'a mut Graph,
    build_log: &'a mut BuildLog,
    deps_log: &'a mut DepsLog,
    progress: &'a mut dyn Progress,
    runner: Box<dyn CommandRunner + 'a>,
    options: Options,
    file_state: FileState,
    plan: Plan,
    start: Instant,
    tasks_ran: usize,
}

impl<'a> Work<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        graph: &'a mut Graph,
        build_log: &'a mut BuildLog,
        deps_log: &'a mut DepsLog,
        progress: &'a mut dyn Progress,
        runner: Box<dyn CommandRunner + 'a>,
        options: Options,
    ) -> Self {
        let file_state = FileState::new(graph);
        let plan = Plan::new(graph);
        Work {
            fs,
            graph,
            build_log,
            deps_log,
            progress,
            runner,
            options,
            file_state,
            plan,
            start: Instant::now(),
            tasks_ran: 0,
        }
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            explain: self.options.explain,
            depfile: self.options.depfile,
        }
    }

    /// The file, if it is produced by some build statement.  Used by the
    /// driver to decide whether the manifest can regenerate itself.
    pub fn is_build_target(&self, name: &str) -> Option<FileId> {
        let id = self.graph.lookup(&canon_path(name))?;
        self.graph.file(id).input.map(|_| id)
    }

    pub fn want_file(&mut self, name: &str) -> anyhow::Result<()> {
        let canon = canon_path(name);
        match self.graph.lookup(&canon) {
            Some(id) => self.want_fileid(id),
            None => bail!("unknown target: '{}'", name),
        }
    }

    /// Scan a target's subgraph and add what is dirty to the plan.
    pub fn want_fileid(&mut self, id: FileId) -> anyhow::Result<()> {
        let mut validations = Vec::new();
        let scan = DepScan {
            fs: self.fs,
            build_log: &*self.build_log,
            deps_log: &*self.deps_log,
            options: self.scan_options(),
        };
        scan.recompute_dirty(self.graph, &mut self.file_state, id, &mut validations)?;

        let needs_plan = match self.graph.file(id).input {
            Some(bid) => !self.graph.build(bid).outputs_ready,
            None => true,
        };
        if needs_plan {
            self.plan.add_target(self.graph, id)?;
        }
        // Validation targets discovered while scanning become top-level
        // targets of their own.
        for v in validations {
            if let Some(in_edge) = self.graph.file(v).input {
                if !self.graph.build(in_edge).outputs_ready {
                    self.plan.add_target(self.graph, v)?;
                }
            }
        }
        self.progress.update(self.plan.counts());
        Ok(())
    }

    pub fn already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    /// Run the plan to completion.  Returns the number of commands executed;
    /// failures and interrupts surface as errors with the conventional
    /// messages.
    pub fn run(&mut self) -> anyhow::Result<usize> {
        let budget = if self.options.failures_allowed == 0 {
            usize::MAX
        } else {
            self.options.failures_allowed
        };
        let mut failures_left = budget;

        while self.plan.more_to_do() {
            if signal::was_interrupted() {
                self.cleanup()?;
                return Err(Interrupted.into());
            }

            // Start as much ready work as the runner and the pools accept.
            if failures_left > 0 && self.runner.can_run_more() {
                if let Some(bid) = self.plan.find_work(self.graph) {
                    if self.graph.build(bid).is_phony() {
                        let mut dyndeps = Vec::new();
                        self.plan.edge_finished(self.graph, bid, true, &mut dyndeps)?;
                        self.load_pending_dyndeps(dyndeps)?;
                    } else {
                        self.start_build(bid)?;
                    }
                    self.progress.update(self.plan.counts());
                    continue;
                }
            }

            // Reap a finished command.
            if self.runner.running() > 0 {
                let finished = match self.runner.wait() {
                    Some(f) => f,
                    None => bail!("command runner lost track of running commands"),
                };
                if finished.result.termination == Termination::Interrupted {
                    self.cleanup()?;
                    return Err(Interrupted.into());
                }
                let success = self.finish_build(finished)?;
                if !success {
                    failures_left = failures_left.saturating_sub(1);
                }
                self.progress.update(self.plan.counts());
                continue;
            }

            // Nothing runnable and nothing running: we cannot finish.
            if failures_left == 0 {
                if budget > 1 {
                    bail!("subcommands failed");
                }
                bail!("subcommand failed");
            }
            bail!("cannot make progress due to previous errors");
        }
        Ok(self.tasks_ran)
    }

    fn start_build(&mut self, bid: BuildId) -> anyhow::Result<()> {
        {
            let build = self.graph.build(bid);
            for &out in build.outs() {
                self.fs.create_parent_dirs(&self.graph.file(out).name)?;
            }
            if let Some(rsp) = &build.rspfile {
                self.fs.create_parent_dirs(&rsp.path)?;
                self.fs.write(&rsp.path, rsp.content.as_bytes())?;
            }
        }
        self.plan.counts.add(BuildState::Queued, -1);
        self.plan.counts.add(BuildState::Running, 1);
        let build = self.graph.build(bid);
        self.progress.task_started(bid, build);
        let cmdline = build.cmdline.clone().expect("non-phony build has command");
        // A console-pool command owns the terminal until it completes.
        let console = self.graph.pool_is_console(self.graph.build(bid).pool);
        if console {
            self.progress.console_held(true);
        }
        self.runner.start(bid, cmdline, console);
        Ok(())
    }

    /// Fold one finished command back into the graph, the logs, and the
    /// plan.  Returns whether the command counts as successful.
    fn finish_build(&mut self, finished: FinishedTask) -> anyhow::Result<bool> {
        let bid = finished.buildid;
        let start_ms = finished.span.0.duration_since(self.start).as_millis() as u32;
        let end_ms = finished.span.1.duration_since(self.start).as_millis() as u32;

        // The command has exited; give the terminal back before reporting.
        if self.graph.pool_is_console(self.graph.build(bid).pool) {
            self.progress.console_held(false);
        }

        // Extract discovered dependencies first; extraction failure turns a
        // successful command into a failed one.
        let mut output = finished.result.output;
        let mut success = finished.result.termination == Termination::Success;
        let mut deps_nodes: Vec<FileId> = Vec::new();
        if success {
            match self.extract_deps(bid, &mut output) {
                Ok(nodes) => deps_nodes = nodes,
                Err(err) => {
                    if !output.is_empty() {
                        output.push(b'\n');
                    }
                    output.extend_from_slice(err.to_string().as_bytes());
                    success = false;
                }
            }
        }

        let result = TaskResult {
            termination: if success {
                Termination::Success
            } else {
                finished.result.termination
            },
            output,
        };
        self.progress
            .task_finished(bid, self.graph.build(bid), &result);

        if !success {
            self.plan.counts.add(BuildState::Running, -1);
            self.plan.counts.add(BuildState::Failed, 1);
            let mut dyndeps = Vec::new();
            self.plan.edge_finished(self.graph, bid, false, &mut dyndeps)?;
            return Ok(false);
        }
        self.plan.counts.add(BuildState::Running, -1);
        self.plan.counts.add(BuildState::Done, 1);
        self.tasks_ran += 1;

        // Re-stat the outputs.  A restat build that left an output untouched
        // propagates cleanliness to dependents and records the input mtime
        // instead, so later runs still compare correctly.
        let restat = self.graph.build(bid).restat;
        let outs = self.graph.build(bid).outs().to_vec();
        let mut record_mtime = MTime::Missing;
        let mut node_cleaned = false;
        for &out in &outs {
            let before = self.file_state.get(out);
            let after = self.file_state.restat(self.graph, self.fs, out)?;
            if after > record_mtime {
                record_mtime = after;
            }
            if restat && before == Some(after) {
                let scan = DepScan {
                    fs: self.fs,
                    build_log: &*self.build_log,
                    deps_log: &*self.deps_log,
                    options: ScanOptions {
                        explain: self.options.explain,
                        depfile: self.options.depfile,
                    },
                };
                self.plan
                    .clean_node(&scan, self.graph, &mut self.file_state, out)?;
                node_cleaned = true;
            }
        }
        if node_cleaned {
            let mut restat_mtime = MTime::Missing;
            for &i in self.graph.build(bid).dirtying_ins() {
                let mtime = self.fs.stat(&self.graph.file(i).name)?;
                if mtime > restat_mtime {
                    restat_mtime = mtime;
                }
            }
            if self.graph.build(bid).deps == DepsStyle::None {
                if let Some(depfile) = &self.graph.build(bid).depfile {
                    let mtime = self.fs.stat(depfile)?;
                    if mtime > restat_mtime {
                        restat_mtime = mtime;
                    }
                }
            }
            record_mtime = restat_mtime;
        }

        // Discovered deps are committed before the build log entry, and both
        // before the plan moves on; a crash in between reruns the build.
        if self.graph.build(bid).deps != DepsStyle::None {
            for &out in &outs {
                let deps_mtime = self.fs.stat(&self.graph.file(out).name)?;
                self.deps_log
                    .record_deps(self.graph, out, deps_mtime, &deps_nodes)?;
            }
        }

        let build = self.graph.build(bid);
        let hash = hash_command(
            build.cmdline.as_deref().unwrap_or(""),
            build.rspfile.as_ref().map(|r| r.content.as_str()),
        );
        for &out in &outs {
            let name = self.graph.file(out).name.clone();
            self.build_log
                .record(&name, hash, record_mtime, start_ms, end_ms)?;
        }

        if let Some(rsp) = &self.graph.build(bid).rspfile {
            if !self.options.keep_rsp {
                self.fs.remove(&rsp.path)?;
            }
        }

        let mut dyndeps = Vec::new();
        self.plan.edge_finished(self.graph, bid, true, &mut dyndeps)?;
        self.load_pending_dyndeps(dyndeps)?;
        Ok(true)
    }

    /// Turn a command's side channel (depfile or filtered output) into a
    /// list of discovered dependency files.
    fn extract_deps(&mut self, bid: BuildId, output: &mut Vec<u8>) -> anyhow::Result<Vec<FileId>> {
        match self.graph.build(bid).deps {
            DepsStyle::None => Ok(Vec::new()),
            DepsStyle::Gcc => {
                let depfile = match self.graph.build(bid).depfile.clone() {
                    Some(d) => d,
                    None => bail!("deps = gcc requires a depfile"),
                };
                let deps = self.read_depfile(&depfile)?;
                if !self.options.keep_depfile {
                    self.fs.remove(&depfile)?;
                }
                Ok(deps)
            }
            DepsStyle::Msvc => {
                let prefix = self
                    .graph
                    .build(bid)
                    .msvc_deps_prefix
                    .clone()
                    .unwrap_or_else(|| "Note: including file: ".to_string());
                let (paths, filtered) = filter_showincludes(output, &prefix);
                *output = filtered;
                let mut deps = Vec::with_capacity(paths.len());
                for path in paths {
                    deps.push(intern_dep_loader_path(self.graph, canon_path(path)));
                }
                Ok(deps)
            }
        }
    }

    fn read_depfile(&mut self, path: &str) -> anyhow::Result<Vec<FileId>> {
        let mut bytes = self
            .fs
            .read(path)
            .map_err(|err| anyhow!("read depfile {}: {}", path, err))?;
        bytes.push(0);
        let mut scanner = Scanner::new(&bytes);
        let parsed = crate::depfile::parse(&mut scanner, self.options.depfile)
            .map_err(|err| anyhow!(scanner.format_parse_error(Path::new(path), err)))?;
        let mut deps = Vec::with_capacity(parsed.deps.len());
        for dep in &parsed.deps {
            deps.push(intern_dep_loader_path(self.graph, canon_path(dep.as_str())));
        }
        Ok(deps)
    }

    fn load_pending_dyndeps(&mut self, nodes: Vec<FileId>) -> anyhow::Result<()> {
        for node in nodes {
            let ddf = dyndep::load_and_apply(self.fs, self.graph, node)?;
            let scan = DepScan {
                fs: self.fs,
                build_log: &*self.build_log,
                deps_log: &*self.deps_log,
                options: ScanOptions {
                    explain: self.options.explain,
                    depfile: self.options.depfile,
                },
            };
            let mut more = Vec::new();
            self.plan.dyndeps_loaded(
                &scan,
                self.graph,
                &mut self.file_state,
                node,
                &ddf,
                &mut more,
            )?;
            self.load_pending_dyndeps(more)?;
        }
        Ok(())
    }

    /// Clean up after an interrupt: delete outputs the interrupted commands
    /// had started writing, along with their temporary files.
    pub fn cleanup(&mut self) -> anyhow::Result<()> {
        let active = self.runner.active_builds();
        self.runner.abort();
        for bid in active {
            if self.graph.pool_is_console(self.graph.build(bid).pool) {
                self.progress.console_held(false);
            }
            for out in self.graph.build(bid).outs().to_vec() {
                let name = &self.graph.file(out).name;
                let now = self.fs.stat(name)?;
                if Some(now) != self.file_state.get(out) {
                    self.fs.remove(name)?;
                }
            }
            if let Some(depfile) = &self.graph.build(bid).depfile {
                self.fs.remove(depfile)?;
            }
            if let Some(rsp) = &self.graph.build(bid).rspfile {
                self.fs.remove(&rsp.path)?;
            }
        }
        Ok(())
    }
}

/// Split "Note: including file:" lines out of captured output, returning
/// the mentioned paths and the remaining output.
fn filter_showincludes(output: &[u8], prefix: &str) -> (Vec<String>, Vec<u8>) {
    let mut paths = Vec::new();
    let mut filtered = Vec::with_capacity(output.len());
    for line in output.split_inclusive(|&b| b == b'\n') {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_end_matches(['\n', '\r']);
        if let Some(path) = trimmed.strip_prefix(prefix) {
            let path = path.trim();
            if !path.is_empty() && !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        } else {
            filtered.extend_from_slice(line);
        }
    }
    (paths, filtered)
}
