//! Dyndep files: dependency information that is itself produced by the
//! build.  A dyndep file is a tiny manifest restricted to a version line and
//! `build OUT | IMPLICIT_OUTS: dyndep | IMPLICIT_INS` statements; loading
//! one patches the named builds in place.

use crate::canon::canon_path;
use crate::fs::FileSystem;
use crate::graph::{BuildId, FileId, Graph};
use crate::parse::{Parser, Statement};
use crate::scan::intern_dep_loader_path;
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use std::path::Path;

#[derive(Debug, Default)]
pub struct Dyndeps {
    pub restat: bool,
    pub implicit_ins: Vec<FileId>,
    pub implicit_outs: Vec<FileId>,
}

/// Patches keyed by the build each one applies to.
pub type DyndepFile = SmallMap<BuildId, Dyndeps>;

fn parse_dyndep(
    fs: &dyn FileSystem,
    graph: &mut Graph,
    file: FileId,
) -> anyhow::Result<DyndepFile> {
    let name = graph.file(file).name.clone();
    let mut bytes = fs
        .read(&name)
        .map_err(|err| anyhow!("loading '{}': {}", name, err))?;
    bytes.push(0);
    let mut parser = Parser::new(&bytes);
    let mut ddf = DyndepFile::default();
    let mut saw_version = false;

    loop {
        let stmt = match parser
            .read()
            .map_err(|err| anyhow!(parser.format_parse_error(Path::new(&name), err)))?
        {
            None => break,
            Some(s) => s,
        };
        match stmt {
            Statement::VarDef(key, value) => {
                if saw_version {
                    bail!("{}: unexpected variable '{}'", name, key);
                }
                if key != "ninja_dyndep_version" {
                    bail!("{}: expected 'ninja_dyndep_version = ...'", name);
                }
                let version = value.evaluate(&[]);
                if version != "1" && !version.starts_with("1.") {
                    bail!("unsupported 'ninja_dyndep_version = {}'", version);
                }
                saw_version = true;
            }
            Statement::Build(b) => {
                if !saw_version {
                    bail!("{}: expected 'ninja_dyndep_version = ...'", name);
                }
                if b.rule != "dyndep" {
                    bail!("{}: expected build statement command name 'dyndep'", name);
                }
                if b.explicit_outs != 1 {
                    bail!("{}: dyndep must list exactly one explicit output", name);
                }
                if b.explicit_ins != 0 || b.order_only_ins != 0 || b.validation_ins != 0 {
                    bail!(
                        "{}: dyndep build statements take only implicit inputs",
                        name
                    );
                }
                let mut restat = false;
                for (key, val) in b.vars.iter() {
                    match *key {
                        "restat" => restat = !val.evaluate(&[]).is_empty(),
                        _ => bail!("{}: unexpected variable '{}'", name, key),
                    }
                }

                let out_path = canon_path(b.outs[0].evaluate(&[]));
                let edge = graph
                    .lookup(&out_path)
                    .and_then(|id| graph.file(id).input)
                    .ok_or_else(|| anyhow!("no build statement exists for '{}'", out_path))?;
                if ddf.get(&edge).is_some() {
                    bail!("multiple statements for '{}'", out_path);
                }

                let implicit_outs = b.outs[1..]
                    .iter()
                    .map(|es| intern_dep_loader_path(graph, canon_path(es.evaluate(&[]))))
                    .collect();
                let implicit_ins = b.ins
                    .iter()
                    .map(|es| intern_dep_loader_path(graph, canon_path(es.evaluate(&[]))))
                    .collect();
                ddf.insert(
                    edge,
                    Dyndeps {
                        restat,
                        implicit_ins,
                        implicit_outs,
                    },
                );
            }
            _ => bail!("{}: unexpected statement in dyndep file", name),
        }
    }
    if !saw_version {
        bail!("{}: expected 'ninja_dyndep_version = ...'", name);
    }
    Ok(ddf)
}

/// Splice one patch into its build: implicit outputs and inputs append to
/// their partitions, restat turns the flag on.
fn update_build(graph: &mut Graph, bid: BuildId, dyndeps: &Dyndeps) -> anyhow::Result<()> {
    if dyndeps.restat {
        graph.build_mut(bid).restat = true;
    }
    for &out in &dyndeps.implicit_outs {
        if graph.file(out).input.is_some() {
            bail!("multiple rules generate {}", graph.file(out).name);
        }
        graph.file_mut(out).input = Some(bid);
        graph.build_mut(bid).add_implicit_out(out);
    }
    for &inp in &dyndeps.implicit_ins {
        graph.file_mut(inp).dependents.push(bid);
    }
    graph.build_mut(bid).insert_implicit_ins(&dyndeps.implicit_ins);
    Ok(())
}

/// Load a dyndep file and patch every build bound to it.  Every build bound
/// to the file must be mentioned, and every mention must be bound.
pub fn load_and_apply(
    fs: &dyn FileSystem,
    graph: &mut Graph,
    file: FileId,
) -> anyhow::Result<DyndepFile> {
    graph.file_mut(file).dyndep_pending = false;
    let ddf = parse_dyndep(fs, graph, file)?;

    let dependents: Vec<BuildId> = graph.file(file).dependents.clone();
    let mut used: Vec<BuildId> = Vec::new();
    for bid in dependents {
        if graph.build(bid).dyndep != Some(file) {
            continue;
        }
        match ddf.get(&bid) {
            None => bail!(
                "'{}' not mentioned in its dyndep file '{}'",
                graph.file(graph.build(bid).primary_out()).name,
                graph.file(file).name
            ),
            Some(dyndeps) => {
                update_build(graph, bid, dyndeps)?;
                used.push(bid);
            }
        }
    }
    for (bid, _) in ddf.iter() {
        if !used.contains(bid) {
            bail!(
                "dyndep file '{}' mentions output '{}' whose build statement does not have a dyndep binding for the file",
                graph.file(file).name,
                graph.file(graph.build(*bid).primary_out()).name
            );
        }
    }
    Ok(ddf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::graph::{Build, BuildIns, BuildOuts, DepsStyle, VisitMark, DEFAULT_POOL};

    fn make_build(graph: &mut Graph, out: &str, ins: &[&str], dyndep: Option<&str>) -> BuildId {
        let out_id = graph.file_id(out);
        let in_ids: Vec<FileId> = ins.iter().map(|name| graph.file_id(*name)).collect();
        let dyndep_id = dyndep.map(|name| {
            let id = graph.file_id(name);
            graph.file_mut(id).dyndep_pending = true;
            id
        });
        let explicit = in_ids.len();
        graph
            .add_build(Build {
                location: "build.ninja:1".to_string(),
                cmdline: Some(format!("touch {}", out)),
                desc: None,
                depfile: None,
                rspfile: None,
                deps: DepsStyle::None,
                msvc_deps_prefix: None,
                restat: false,
                generator: false,
                pool: DEFAULT_POOL,
                dyndep: dyndep_id,
                ins: BuildIns {
                    ids: in_ids,
                    explicit,
                    implicit: 0,
                    order_only: 0,
                },
                validations: Vec::new(),
                outs: BuildOuts {
                    ids: vec![out_id],
                    explicit: 1,
                },
                mark: VisitMark::None,
                deps_loaded: false,
                deps_missing: false,
                outputs_ready: false,
            })
            .unwrap()
    }

    #[test]
    fn patch_adds_input_output_and_restat() -> anyhow::Result<()> {
        let fs = MemFs::new();
        fs.add_file(
            "dd",
            "ninja_dyndep_version = 1\nbuild out | out.imp: dyndep | in.imp\n  restat = 1\n",
        );
        let mut graph = Graph::new();
        let bid = make_build(&mut graph, "out", &["dd"], Some("dd"));

        let dd = graph.lookup("dd").unwrap();
        load_and_apply(&fs, &mut graph, dd)?;

        let build = graph.build(bid);
        assert!(build.restat);
        let in_imp = graph.lookup("in.imp").unwrap();
        let out_imp = graph.lookup("out.imp").unwrap();
        assert!(build.dirtying_ins().contains(&in_imp));
        assert!(build.outs().contains(&out_imp));
        assert_eq!(graph.file(out_imp).input, Some(bid));
        assert!(graph.file(in_imp).generated_by_dep_loader);
        assert!(!graph.file(graph.lookup("dd").unwrap()).dyndep_pending);
        Ok(())
    }

    #[test]
    fn version_line_required() {
        let fs = MemFs::new();
        fs.add_file("dd", "build out: dyndep\n");
        let mut graph = Graph::new();
        make_build(&mut graph, "out", &["dd"], Some("dd"));
        let dd = graph.lookup("dd").unwrap();
        let err = load_and_apply(&fs, &mut graph, dd).unwrap_err();
        assert!(err.to_string().contains("ninja_dyndep_version"), "{}", err);
    }

    #[test]
    fn unknown_output_rejected() {
        let fs = MemFs::new();
        fs.add_file("dd", "ninja_dyndep_version = 1\nbuild nosuch: dyndep\n");
        let mut graph = Graph::new();
        make_build(&mut graph, "out", &["dd"], Some("dd"));
        let dd = graph.lookup("dd").unwrap();
        let err = load_and_apply(&fs, &mut graph, dd).unwrap_err();
        assert!(
            err.to_string().contains("no build statement exists for 'nosuch'"),
            "{}",
            err
        );
    }

    #[test]
    fn every_bound_build_must_be_mentioned() {
        let fs = MemFs::new();
        fs.add_file("dd", "ninja_dyndep_version = 1\n");
        let mut graph = Graph::new();
        make_build(&mut graph, "out", &["dd"], Some("dd"));
        let dd = graph.lookup("dd").unwrap();
        let err = load_and_apply(&fs, &mut graph, dd).unwrap_err();
        assert!(
            err.to_string()
                .contains("'out' not mentioned in its dyndep file 'dd'"),
            "{}",
            err
        );
    }

    #[test]
    fn duplicate_patch_rejected() {
        let fs = MemFs::new();
        fs.add_file(
            "dd",
            "ninja_dyndep_version = 1\nbuild out: dyndep\nbuild out: dyndep\n",
        );
        let mut graph = Graph::new();
        make_build(&mut graph, "out", &["dd"], Some("dd"));
        let dd = graph.lookup("dd").unwrap();
        let err = load_and_apply(&fs, &mut graph, dd).unwrap_err();
        assert!(err.to_string().contains("multiple statements for 'out'"), "{}", err);
    }
}
