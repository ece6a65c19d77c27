use crate::*;

#[test]
fn empty_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "")?;
    let out = space.run(&mut nin_command(vec![]))?;
    assert_output_contains(&out, "no path specified and no default");
    Ok(())
}

#[test]
fn basic_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut nin_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());

    Ok(())
}

#[test]
fn no_work_second_time() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut nin_command(vec!["out"]))?;
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "ninja: no work to do.");
    Ok(())
}

#[test]
fn create_subdir() -> anyhow::Result<()> {
    // Run a build rule that needs a subdir to be automatically created.
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build subdir/out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut nin_command(vec!["subdir/out"]))?;
    assert!(space.read("subdir/out").is_ok());

    Ok(())
}

#[test]
fn specify_build_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build_specified.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut nin_command(vec!["-f", "build_specified.ninja", "out"]))?;
    assert!(space.read("out").is_ok());

    Ok(())
}

/// The core incremental scenario: a chain of copies rebuilds only from the
/// point of change onwards.
#[cfg(unix)]
#[test]
fn chain_rebuilds_incrementally() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            COPY_RULE,
            "build c2: copy c1",
            "build c3: copy c2",
            "build c4: copy c3",
            "build c5: copy c4",
            "",
        ]
        .join("\n"),
    )?;
    space.write("c1", "seed")?;
    space.sub_mtime("c1", std::time::Duration::from_secs(10))?;

    let out = space.run_expect(&mut nin_command(vec!["c5"]))?;
    for step in ["copy c1 c2", "copy c2 c3", "copy c3 c4", "copy c4 c5"] {
        assert_output_contains(&out, step);
    }
    assert_eq!(space.read("c5")?, b"seed");

    let out = space.run_expect(&mut nin_command(vec!["c5"]))?;
    assert_output_contains(&out, "ninja: no work to do.");

    // Touch the middle of the chain: only the downstream half rebuilds.
    space.write("c3", "replaced")?;
    let out = space.run_expect(&mut nin_command(vec!["c5"]))?;
    assert_output_not_contains(&out, "copy c1 c2");
    assert_output_not_contains(&out, "copy c2 c3");
    assert_output_contains(&out, "copy c3 c4");
    assert_output_contains(&out, "copy c4 c5");
    assert_eq!(space.read("c5")?, b"replaced");

    Ok(())
}

#[cfg(unix)]
#[test]
fn generate_rsp_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cat
  command = cat ${out}.rsp > ${out}
  rspfile = ${out}.rsp
  rspfile_content = 1 $in 2 $in_newline 3

rule litter
  command = cat make/me/${out}.rsp > ${out}
  rspfile = make/me/${out}.rsp
  rspfile_content = random stuff

rule touch
  command = touch $out

build main: cat foo bar baz in
build foo: litter bar
build bar: touch baz
build baz: touch in
",
    )?;
    space.write("in", "go!")?;

    let _ = space.run_expect(&mut nin_command(vec!["main"]))?;

    // The 'main' and 'foo' targets copy the contents of their rsp file to
    // their output.
    let main_rsp = space.read("main").unwrap();
    assert_eq!(main_rsp, b"1 foo bar baz in 2 foo\nbar\nbaz\nin 3");
    let foo_rsp = space.read("foo").unwrap();
    assert_eq!(foo_rsp, b"random stuff");

    // The response files were cleaned up after success.
    assert!(space.read("main.rsp").is_err());
    assert!(space.read("make/me/foo.rsp").is_err());

    // The 'make/me' directory was created when writing an rsp file.
    // It should still be there.
    let meta = space.metadata("make/me").unwrap();
    assert!(meta.is_dir());

    // Run again: everything should be up to date.
    let out = space.run_expect(&mut nin_command(vec!["main"]))?;
    assert_output_contains(&out, "no work");

    Ok(())
}

/// A failed command leaves its response file behind for inspection.
#[cfg(unix)]
#[test]
fn rsp_file_kept_after_failure() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule fail
  command = false
  rspfile = $out.rsp
  rspfile_content = contents of $out
build out: fail
",
    )?;
    let out = space.run(&mut nin_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_eq!(space.read("out.rsp")?, b"contents of out");
    Ok(())
}

/// Build with the same output listed multiple times.
#[test]
fn repeated_out() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build dup dup: touch in",
            "build out: touch dup",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.write("dup", "")?;
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "is repeated in output list");

    Ok(())
}

// Phony depending on phony.
#[test]
fn phony_depends() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "
build out1: touch
build out2: phony out1
build out3: phony out2
",
        ]
        .join("\n"),
    )?;
    space.run_expect(&mut nin_command(vec!["out3"]))?;
    space.read("out1")?;
    Ok(())
}

// builddir controls where .ninja_log and .ninja_deps are written.
#[test]
fn builddir() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "builddir = foo",
            TOUCH_RULE,
            "build $builddir/bar: touch",
            "",
        ]
        .join("\n"),
    )?;
    space.run_expect(&mut nin_command(vec!["foo/bar"]))?;
    space.read("foo/.ninja_log")?;
    Ok(())
}

#[test]
fn bad_rule_variable() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule my_rule
    command = touch $out
    my_var = foo

build out: my_rule
",
    )?;

    let out = space.run(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "unexpected variable \"my_var\"");
    Ok(())
}

#[cfg(unix)]
#[test]
fn explain_describes_reruns() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[COPY_RULE, "build out: copy in", ""].join("\n"),
    )?;
    space.write("in", "v1")?;
    space.sub_mtime("in", std::time::Duration::from_secs(10))?;
    let out = space.run_expect(&mut nin_command(vec!["-d", "explain", "out"]))?;
    assert_output_contains(&out, "explain: output out doesn't exist");

    space.write("in", "v2")?;
    let out = space.run_expect(&mut nin_command(vec!["-d", "explain", "out"]))?;
    assert_output_contains(&out, "explain: output out older than most recent input in");
    Ok(())
}

/// Order-only inputs gate execution but never cause rebuilds.
#[cfg(unix)]
#[test]
fn order_only_does_not_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[COPY_RULE, "build out: copy in || oo", ""].join("\n"),
    )?;
    space.write("in", "a")?;
    space.write("oo", "b")?;
    space.sub_mtime("in", std::time::Duration::from_secs(10))?;
    space.sub_mtime("oo", std::time::Duration::from_secs(10))?;

    space.run_expect(&mut nin_command(vec!["out"]))?;
    space.write("oo", "newer")?;
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "ninja: no work to do.");
    Ok(())
}

/// An implicit input participates in dirtiness like an explicit one.
#[cfg(unix)]
#[test]
fn implicit_input_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[COPY_RULE, "build out: copy in | imp", ""].join("\n"),
    )?;
    space.write("in", "a")?;
    space.write("imp", "b")?;
    space.sub_mtime("in", std::time::Duration::from_secs(10))?;
    space.sub_mtime("imp", std::time::Duration::from_secs(10))?;

    space.run_expect(&mut nin_command(vec!["out"]))?;
    space.write("imp", "newer")?;
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "copy in out");
    Ok(())
}
