use crate::*;

/// A pool of depth 1 admits one command at a time even under -j2: the
/// begin/end markers in the log file must never interleave.
#[cfg(unix)]
#[test]
fn depth_one_serializes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
pool serial
  depth = 1

rule slow
  command = echo begin >> marks && sleep 0.3 && echo end >> marks && touch $out
  pool = serial

build a: slow
build b: slow
build all: phony a b
",
    )?;

    space.run_expect(&mut nin_command(vec!["-j", "2", "all"]))?;
    let marks = String::from_utf8(space.read("marks")?)?;
    assert_eq!(marks, "begin\nend\nbegin\nend\n");
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_ok());
    Ok(())
}

/// Without a pool, -j2 genuinely overlaps the two commands.
#[cfg(unix)]
#[test]
fn unpooled_commands_overlap() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule slow
  command = echo begin >> marks && sleep 0.3 && echo end >> marks && touch $out

build a: slow
build b: slow
build all: phony a b
",
    )?;

    space.run_expect(&mut nin_command(vec!["-j", "2", "all"]))?;
    let marks = String::from_utf8(space.read("marks")?)?;
    assert_eq!(marks, "begin\nbegin\nend\nend\n");
    Ok(())
}

/// A console-pool command writes straight to the inherited stdio rather
/// than through the captured pipe, so its output shows up even though the
/// build never echoes captured output for it.
#[cfg(unix)]
#[test]
fn console_pool_inherits_stdio() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule shout
  command = echo direct-output && touch $out
  pool = console

build out: shout
",
    )?;
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "direct-output");
    assert!(space.read("out").is_ok());
    Ok(())
}

/// The reserved console pool behaves as a depth-1 pool.
#[cfg(unix)]
#[test]
fn console_pool_exists() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule note
  command = echo run >> marks && touch $out
  pool = console

build a: note
build b: note
build all: phony a b
",
    )?;
    space.run_expect(&mut nin_command(vec!["-j", "2", "all"]))?;
    let marks = String::from_utf8(space.read("marks")?)?;
    assert_eq!(marks, "run\nrun\n");
    Ok(())
}
