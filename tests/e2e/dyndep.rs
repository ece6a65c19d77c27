use crate::*;

/// Dyndep information built mid-build splices a new input into an edge, and
/// that input is built before the edge runs.
#[cfg(unix)]
#[test]
fn discovers_new_input() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            COPY_RULE,
            TOUCH_RULE,
            "build dd: copy dd-src",
            "build out: touch || dd
  dyndep = dd",
            "build in: touch",
            "",
        ]
        .join("\n"),
    )?;
    space.write(
        "dd-src",
        "ninja_dyndep_version = 1\nbuild out: dyndep | in\n",
    )?;

    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "copy dd-src dd");
    assert_output_contains(&out, "touch in");
    assert_output_contains(&out, "touch out");
    assert!(space.read("out").is_ok());

    // The discovered dependency is real: updating `in` reruns `out`.
    space.write("in", "newer")?;
    let run2 = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&run2, "touch out");
    assert_output_not_contains(&run2, "copy dd-src dd");
    Ok(())
}

/// An edge bound to a dyndep file must be mentioned by it.
#[cfg(unix)]
#[test]
fn missing_entry_is_an_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            COPY_RULE,
            TOUCH_RULE,
            "build dd: copy dd-src",
            "build out: touch || dd
  dyndep = dd",
            "",
        ]
        .join("\n"),
    )?;
    space.write("dd-src", "ninja_dyndep_version = 1\n")?;

    let out = space.run(&mut nin_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "'out' not mentioned in its dyndep file 'dd'");
    Ok(())
}

/// A dyndep file that already exists and is up to date loads during the
/// scan, before any command runs.
#[cfg(unix)]
#[test]
fn preexisting_dyndep_loads_at_scan_time() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build out: touch || dd
  dyndep = dd",
            "",
        ]
        .join("\n"),
    )?;
    space.write("dd", "ninja_dyndep_version = 1\nbuild out: dyndep | extra\n")?;
    space.write("extra", "")?;

    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "touch out");

    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "ninja: no work to do.");

    // The spliced input is live on rescans too.
    space.write("extra", "newer")?;
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "touch out");
    Ok(())
}
