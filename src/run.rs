//! The top-level driver: flag parsing, log management, and the build loop
//! including manifest regeneration.

use crate::build_log::BuildLog;
use crate::deps_log::DepsLog;
use crate::fs::RealFileSystem;
use crate::graph::Graph;
use crate::load::{self, LoadOptions};
use crate::progress::{DumbConsoleProgress, FancyConsoleProgress, Progress};
use crate::work::{Interrupted, Options, Work};
use crate::{signal, task, terminal, trace, work};
use anyhow::{anyhow, bail};
use std::path::Path;

struct BuildParams<'a> {
    options: Options,
    load_options: LoadOptions,
    parallelism: usize,
    max_load_average: f64,
    target_names: &'a [String],
    build_filename: &'a str,
}

/// Open (or create) the two logs next to the build output, pruning dead
/// entries and recompacting when they have grown mostly stale.
fn open_logs(
    graph: &mut Graph,
    builddir: &Option<String>,
) -> anyhow::Result<(BuildLog, DepsLog)> {
    let prefix = match builddir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|err| anyhow!("creating builddir {}: {}", dir, err))?;
            format!("{}/", dir)
        }
        None => String::new(),
    };

    let mut deps_log = DepsLog::open(&format!("{}.ninja_deps", prefix), graph)?;
    if deps_log.needs_recompaction() {
        let graph_ref: &Graph = graph;
        deps_log.recompact(graph_ref, &|id| {
            graph_ref.file(id).input.is_some() || !graph_ref.file(id).dependents.is_empty()
        })?;
    }
    deps_log.open_for_write()?;

    let mut build_log = BuildLog::open(&format!("{}.ninja_log", prefix))?;
    build_log.open_for_write(&|path| {
        graph
            .lookup(path)
            .map_or(false, |id| graph.file(id).input.is_some())
    })?;

    Ok((build_log, deps_log))
}

/// Run one whole build.  Ok(None) means the build stopped on command
/// failures (already reported); Ok(Some(n)) is the number of commands run.
fn build(progress: &mut dyn Progress, params: &BuildParams) -> anyhow::Result<Option<usize>> {
    let fs = RealFileSystem::new();
    let mut state = trace::scope("load", || {
        load::read(&fs, params.build_filename, params.load_options)
    })?;
    let (mut build_log, mut deps_log) = open_logs(&mut state.graph, &state.builddir)?;

    // If the manifest is produced by the build, bring it up to date first.
    let mut manifest_regenerated = false;
    {
        let runner = task::Runner::new(params.parallelism, params.max_load_average);
        let mut work = Work::new(
            &fs,
            &mut state.graph,
            &mut build_log,
            &mut deps_log,
            progress,
            Box::new(runner),
            params.options,
        );
        if let Some(target) = work.is_build_target(params.build_filename) {
            work.want_fileid(target)?;
            match run_work(&mut work)? {
                None => return Ok(None),
                Some(0) => {}
                Some(_) => manifest_regenerated = true,
            }
        }
    }

    if manifest_regenerated {
        // Start over against the fresh manifest.
        state = trace::scope("load", || {
            load::read(&fs, params.build_filename, params.load_options)
        })?;
        let logs = open_logs(&mut state.graph, &state.builddir)?;
        build_log = logs.0;
        deps_log = logs.1;
    } else {
        state.graph.reset();
    }

    let runner = task::Runner::new(params.parallelism, params.max_load_average);
    let mut work = Work::new(
        &fs,
        &mut state.graph,
        &mut build_log,
        &mut deps_log,
        progress,
        Box::new(runner),
        params.options,
    );
    if !params.target_names.is_empty() {
        for name in params.target_names {
            work.want_file(name)?;
        }
    } else if !state.default.is_empty() {
        for &target in &state.default {
            work.want_fileid(target)?;
        }
    } else {
        bail!("no path specified and no default");
    }
    run_work(&mut work)
}

/// Run a prepared plan, converting command-failure stops into the
/// conventional "build stopped" report.
fn run_work(work: &mut Work) -> anyhow::Result<Option<usize>> {
    match trace::scope("work.run", || work.run()) {
        Ok(n) => Ok(Some(n)),
        Err(err) => {
            if err.downcast_ref::<Interrupted>().is_some() {
                return Err(err);
            }
            println!("ninja: build stopped: {}.", err);
            Ok(None)
        }
    }
}

fn default_parallelism() -> anyhow::Result<usize> {
    // The original uses available processors + a constant, but the
    // difference rarely matters.
    let par = std::thread::available_parallelism()?;
    Ok(usize::from(par))
}

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// nin, a ninja-compatible build system
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.ninja]
    #[argh(option, short = 'f', default = "(\"build.ninja\".into())")]
    build_file: String,

    /// debugging tools; use -d list to list
    #[argh(option, short = 'd')]
    debug: Vec<String>,

    /// subcommands; use -t list to list
    #[argh(option, short = 't')]
    tool: Option<String>,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until N failures (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: usize,

    /// do not start new jobs while the load average exceeds N
    #[argh(option, short = 'l')]
    load_average: Option<f64>,

    /// adjust warnings; dupbuild, phonycycle, depfilemulti = {err,warn}
    #[argh(option, short = 'w')]
    warnings: Vec<String>,

    /// print version
    #[argh(switch, hidden_help)]
    version: bool,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if opts.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    let mut options = Options {
        failures_allowed: opts.keep_going,
        ..Options::default()
    };
    let mut load_options = LoadOptions::default();

    for debug in &opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  explain      explain why each target is considered out of date");
                println!("  trace        generate json performance trace");
                println!("  keeprsp      keep response files after successful commands");
                println!("  keepdepfile  keep depfiles after they are read");
                return Ok(1);
            }
            "explain" => options.explain = true,
            "trace" => trace::open("trace.json")?,
            "keeprsp" => options.keep_rsp = true,
            "keepdepfile" => options.keep_depfile = true,
            _ => bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    for warning in &opts.warnings {
        match warning.as_str() {
            "dupbuild=err" => load_options.dup_edge_is_error = true,
            "dupbuild=warn" => load_options.dup_edge_is_error = false,
            "phonycycle=err" => load_options.phony_cycle_is_error = true,
            "phonycycle=warn" => load_options.phony_cycle_is_error = false,
            "depfilemulti=err" => options.depfile.distinct_target_lines_error = true,
            "depfilemulti=warn" => options.depfile.distinct_target_lines_error = false,
            _ => bail!("unknown -w {:?}", warning),
        }
    }

    if let Some(tool) = opts.tool {
        match tool.as_str() {
            "list" => {
                println!("subcommands:");
                println!("  (none yet)");
                return Ok(1);
            }
            _ => bail!("unknown -t {:?}, use -t list to list", tool),
        }
    }

    if let Some(dir) = opts.chdir {
        let dir = Path::new(&dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    signal::register_sigint();

    let params = BuildParams {
        options,
        load_options,
        parallelism: match opts.parallelism {
            Some(p) => p,
            None => default_parallelism()?,
        },
        max_load_average: opts.load_average.unwrap_or(-1.0),
        target_names: &opts.targets,
        build_filename: &opts.build_file,
    };

    let mut progress: Box<dyn Progress> = if terminal::use_fancy() {
        Box::new(FancyConsoleProgress::new(opts.verbose))
    } else {
        Box::new(DumbConsoleProgress::new(opts.verbose))
    };

    match build(progress.as_mut(), &params) {
        Ok(None) => Ok(1),
        Ok(Some(0)) => {
            println!("ninja: no work to do.");
            Ok(0)
        }
        Ok(Some(_)) => Ok(0),
        Err(err) => {
            if err.downcast_ref::<work::Interrupted>().is_some() {
                println!("ninja: build stopped: interrupted by user.");
                return Ok(2);
            }
            Err(err)
        }
    }
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    let _ = trace::close();
    res
}
