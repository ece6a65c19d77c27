//! Graph construction: loads the manifest (and its includes), evaluates
//! bindings, and interns everything into a Graph.

use crate::canon::canon_path;
use crate::eval::{Env, EvalString, Vars};
use crate::fs::FileSystem;
use crate::graph::{
    Build, BuildIns, BuildOuts, DepsStyle, FileId, Graph, Pool, RspFile, VisitMark, DEFAULT_POOL,
};
use crate::parse::{Parser, Statement};
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use std::borrow::Cow;
use std::path::Path;

#[derive(Clone, Copy, Default)]
pub struct LoadOptions {
    /// Treat a second producer for one output as an error instead of
    /// dropping the duplicate with a warning.
    pub dup_edge_is_error: bool,
    /// Treat a phony build that lists its own output as an input as an
    /// error instead of dropping the input with a warning.
    pub phony_cycle_is_error: bool,
}

/// A rule as stored for later expansion: unevaluated bindings.
struct Rule {
    vars: SmallMap<String, EvalString<String>>,
}

/// Everything loading a manifest produces.
#[derive(Debug)]
pub struct LoadedState {
    pub graph: Graph,
    pub default: Vec<FileId>,
    pub builddir: Option<String>,
}

/// The $in/$out bindings of one build statement.
struct ImplicitVars {
    ins: String,
    in_newline: String,
    outs: String,
}

impl Env for ImplicitVars {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        match var {
            "in" => Some(Cow::Borrowed(self.ins.as_str())),
            "in_newline" => Some(Cow::Borrowed(self.in_newline.as_str())),
            "out" => Some(Cow::Borrowed(self.outs.as_str())),
            _ => None,
        }
    }
}

/// Variable scope as seen from one build statement: $in/$out, then the
/// build's own bindings, then the rule's (expanded recursively in this same
/// scope), then the enclosing file scope.
struct EdgeScope<'a> {
    implicit: &'a ImplicitVars,
    build_vars: &'a SmallMap<String, String>,
    rule: &'a Rule,
    file_vars: &'a Vars,
}

impl Env for EdgeScope<'_> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        if let Some(v) = self.implicit.get_var(var) {
            return Some(v);
        }
        if let Some(v) = self.build_vars.get(var) {
            return Some(Cow::Borrowed(v.as_str()));
        }
        if let Some(es) = self.rule.vars.get(var) {
            return Some(Cow::Owned(es.evaluate(&[self])));
        }
        self.file_vars.get_var(var)
    }
}

struct Loader {
    graph: Graph,
    rules: SmallMap<String, Rule>,
    vars: Vars,
    default: Vec<FileId>,
    options: LoadOptions,
}

/// Read a manifest from the given filesystem into a LoadedState.
pub fn read(
    fs: &dyn FileSystem,
    build_filename: &str,
    options: LoadOptions,
) -> anyhow::Result<LoadedState> {
    let mut loader = Loader {
        graph: Graph::new(),
        rules: SmallMap::default(),
        vars: Vars::default(),
        default: Vec::new(),
        options,
    };
    loader.read_file(fs, build_filename)?;
    let builddir = loader.vars.get("builddir").cloned();
    Ok(LoadedState {
        graph: loader.graph,
        default: loader.default,
        builddir,
    })
}

impl Loader {
    fn read_file(&mut self, fs: &dyn FileSystem, filename: &str) -> anyhow::Result<()> {
        let mut bytes = fs
            .read(filename)
            .map_err(|err| anyhow!("read {}: {}", filename, err))?;
        bytes.push(0);
        let mut parser = Parser::new(&bytes);
        loop {
            let stmt = match parser
                .read()
                .map_err(|err| anyhow!(parser.format_parse_error(Path::new(filename), err)))?
            {
                None => break,
                Some(s) => s,
            };
            match stmt {
                Statement::VarDef(name, value) => {
                    let value = value.evaluate(&[&self.vars]);
                    self.vars.insert(name, value);
                }
                Statement::Rule(rule) => {
                    if rule.name == "phony" || self.rules.get(rule.name).is_some() {
                        bail!("{}: duplicate rule '{}'", filename, rule.name);
                    }
                    let mut vars = SmallMap::default();
                    for (name, value) in rule.vars.into_iter() {
                        vars.insert(name.to_owned(), value.into_owned());
                    }
                    self.rules.insert(rule.name.to_owned(), Rule { vars });
                }
                Statement::Pool(pool) => {
                    if self.graph.pool_by_name(pool.name).is_some() {
                        bail!("{}: duplicate pool '{}'", filename, pool.name);
                    }
                    let depth = match pool.vars.get("depth") {
                        None => 0,
                        Some(val) => {
                            let val = val.evaluate(&[&self.vars]);
                            val.parse::<usize>()
                                .map_err(|err| anyhow!("{}: pool depth: {}", filename, err))?
                        }
                    };
                    self.graph.add_pool(Pool {
                        name: pool.name.to_owned(),
                        depth,
                    });
                }
                Statement::Default(paths) => {
                    for path in paths {
                        let path = canon_path(path.evaluate(&[&self.vars]));
                        match self.graph.lookup(&path) {
                            Some(id) => self.default.push(id),
                            None => bail!("{}: unknown default target '{}'", filename, path),
                        }
                    }
                }
                Statement::Include(path) => {
                    let path = path.evaluate(&[&self.vars]);
                    self.read_file(fs, &path)?;
                }
                Statement::Subninja(path) => {
                    let path = path.evaluate(&[&self.vars]);
                    // A subninja sees the enclosing scope but cannot leak
                    // bindings or rules back out.
                    let saved_vars = self.vars.clone();
                    let saved_rules = self.snapshot_rules();
                    self.read_file(fs, &path)?;
                    self.vars = saved_vars;
                    self.rules = saved_rules;
                }
                Statement::Build(build) => {
                    self.handle_build(filename, build)?;
                }
            }
        }
        Ok(())
    }

    fn snapshot_rules(&self) -> SmallMap<String, Rule> {
        let mut rules = SmallMap::default();
        for (name, rule) in self.rules.iter() {
            let mut vars = SmallMap::default();
            for (k, v) in rule.vars.iter() {
                vars.insert(k.clone(), v.clone());
            }
            rules.insert(name.clone(), Rule { vars });
        }
        rules
    }

    fn handle_build(&mut self, filename: &str, stmt: crate::parse::Build) -> anyhow::Result<()> {
        let location = format!("{}:{}", filename, stmt.line);

        // Build bindings are evaluated against the file scope; they do not
        // see each other.
        let mut build_vars: SmallMap<String, String> = SmallMap::default();
        for (name, value) in stmt.vars.iter() {
            build_vars.insert((*name).to_owned(), value.evaluate(&[&self.vars]));
        }

        // Paths see the build's bindings too.
        let path_env: [&dyn Env; 2] = [&build_vars, &self.vars];
        let mut out_paths: Vec<String> = Vec::new();
        let mut explicit_outs = stmt.explicit_outs;
        for (i, out) in stmt.outs.iter().enumerate() {
            let path = canon_path(out.evaluate(&path_env));
            if out_paths.contains(&path) {
                eprintln!("warning: {}: output '{}' is repeated in output list", location, path);
                if i < stmt.explicit_outs {
                    explicit_outs -= 1;
                }
                continue;
            }
            out_paths.push(path);
        }
        let mut in_paths: Vec<String> = stmt
            .ins
            .iter()
            .map(|i| canon_path(i.evaluate(&path_env)))
            .collect();
        let validation_paths: Vec<String> =
            in_paths.split_off(in_paths.len() - stmt.validation_ins);

        let is_phony = stmt.rule == "phony";
        let phony_rule = Rule {
            vars: SmallMap::default(),
        };
        let rule = if is_phony {
            &phony_rule
        } else {
            match self.rules.get(stmt.rule) {
                Some(rule) => rule,
                None => bail!("{}: unknown rule '{}'", location, stmt.rule),
            }
        };

        // Drop a phony build's reference to its own output; a historical
        // generator emits those and expects them to be a no-op.
        let mut explicit_ins = stmt.explicit_ins;
        let mut implicit_ins = stmt.implicit_ins;
        let mut order_only_ins = stmt.order_only_ins;
        if is_phony {
            let mut i = 0;
            while i < in_paths.len() {
                if out_paths.contains(&in_paths[i]) {
                    if self.options.phony_cycle_is_error {
                        bail!(
                            "{}: phony target '{}' names itself as an input",
                            location,
                            in_paths[i]
                        );
                    }
                    eprintln!(
                        "warning: {}: phony target '{}' names itself as an input; ignoring",
                        location, in_paths[i]
                    );
                    if i < explicit_ins {
                        explicit_ins -= 1;
                    } else if i < explicit_ins + implicit_ins {
                        implicit_ins -= 1;
                    } else {
                        order_only_ins -= 1;
                    }
                    in_paths.remove(i);
                } else {
                    i += 1;
                }
            }
        }

        let implicit = ImplicitVars {
            ins: in_paths[0..explicit_ins].join(" "),
            in_newline: in_paths[0..explicit_ins].join("\n"),
            outs: out_paths[0..explicit_outs.min(out_paths.len())].join(" "),
        };
        let scope = EdgeScope {
            implicit: &implicit,
            build_vars: &build_vars,
            rule,
            file_vars: &self.vars,
        };
        let lookup = |key: &str| -> Option<String> {
            scope.get_var(key).map(|v| v.into_owned()).filter(|v| !v.is_empty())
        };

        let cmdline = if is_phony { None } else { Some(lookup("command").unwrap_or_default()) };
        let desc = lookup("description");
        let depfile = lookup("depfile");
        let deps = match lookup("deps").as_deref() {
            None => DepsStyle::None,
            Some("gcc") => DepsStyle::Gcc,
            Some("msvc") => DepsStyle::Msvc,
            Some(other) => bail!("{}: unknown deps type '{}'", location, other),
        };
        let msvc_deps_prefix = lookup("msvc_deps_prefix");
        let restat = lookup("restat").is_some();
        let generator = lookup("generator").is_some();
        let rspfile_path = lookup("rspfile");
        let rspfile_content = lookup("rspfile_content");
        let rspfile = match (rspfile_path, rspfile_content) {
            (None, None) => None,
            (Some(path), Some(content)) => Some(RspFile { path, content }),
            _ => bail!("{}: rspfile and rspfile_content need to be both specified", location),
        };
        if deps == DepsStyle::Gcc && depfile.is_none() {
            bail!("{}: deps = gcc requires depfile to be set", location);
        }
        let pool = match lookup("pool") {
            None => DEFAULT_POOL,
            Some(name) => match self.graph.pool_by_name(&name) {
                Some(id) => id,
                None => bail!("{}: unknown pool name '{}'", location, name),
            },
        };
        let dyndep_path = lookup("dyndep").map(canon_path);

        // Interning happens only after evaluation is done with the scope.
        let mut out_ids: Vec<FileId> = Vec::with_capacity(out_paths.len());
        for path in &out_paths {
            out_ids.push(self.graph.file_id(path.clone()));
        }
        let in_ids: Vec<FileId> = in_paths
            .iter()
            .map(|p| self.graph.file_id(p.clone()))
            .collect();
        let validations: Vec<FileId> = validation_paths
            .iter()
            .map(|p| self.graph.file_id(p.clone()))
            .collect();
        let dyndep = match dyndep_path {
            None => None,
            Some(path) => {
                if !in_paths.contains(&path) {
                    bail!("{}: dyndep '{}' is not an input", location, path);
                }
                let id = self.graph.file_id(path);
                self.graph.file_mut(id).dyndep_pending = true;
                Some(id)
            }
        };

        // Check for outputs claimed by an earlier build statement.
        let mut filtered_outs: Vec<FileId> = Vec::with_capacity(out_ids.len());
        let mut filtered_explicit = explicit_outs;
        for (i, &out) in out_ids.iter().enumerate() {
            if self.graph.file(out).input.is_some() {
                if self.options.dup_edge_is_error {
                    bail!("{}: multiple rules generate {}", location, self.graph.file(out).name);
                }
                eprintln!(
                    "warning: {}: multiple rules generate {}; ignoring the later one",
                    location,
                    self.graph.file(out).name
                );
                if i < explicit_outs {
                    filtered_explicit -= 1;
                }
                continue;
            }
            filtered_outs.push(out);
        }
        if filtered_outs.is_empty() {
            return Ok(());
        }

        self.graph.add_build(Build {
            location,
            cmdline,
            desc,
            depfile,
            rspfile,
            deps,
            msvc_deps_prefix,
            restat,
            generator,
            pool,
            dyndep,
            ins: BuildIns {
                ids: in_ids,
                explicit: explicit_ins,
                implicit: implicit_ins,
                order_only: order_only_ins,
            },
            validations,
            outs: BuildOuts {
                ids: filtered_outs,
                explicit: filtered_explicit,
            },
            mark: VisitMark::None,
            deps_loaded: false,
            deps_missing: false,
            outputs_ready: false,
        })?;
        Ok(())
    }
}
