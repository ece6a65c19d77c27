use crate::*;

/// A restat rule whose command leaves its output untouched cancels the
/// rebuild of dependents.
#[cfg(unix)]
#[test]
fn restat_cancels_downstream() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            COPY_RULE,
            "
rule noop
  command = true
  description = noop $out
  restat = 1

build out1: copy in
build out2: noop out1
build out3: copy out2
",
        ]
        .join("\n"),
    )?;
    space.write("in", "x")?;
    space.write("out2", "fixed content")?;
    space.sub_mtime("in", std::time::Duration::from_secs(10))?;
    space.sub_mtime("out2", std::time::Duration::from_secs(10))?;

    // First build: everything runs once (nothing is in the log yet).
    let out = space.run_expect(&mut nin_command(vec!["out3"]))?;
    assert_output_contains(&out, "copy in out1");
    assert_output_contains(&out, "noop out2");
    assert_output_contains(&out, "copy out2 out3");

    // Nothing changed.
    let out = space.run_expect(&mut nin_command(vec!["out3"]))?;
    assert_output_contains(&out, "ninja: no work to do.");

    // Touching the far input reruns out1 and the noop; since the noop left
    // out2 alone, out3's rebuild is cancelled.
    space.write("in", "y")?;
    let out = space.run_expect(&mut nin_command(vec!["out3"]))?;
    assert_output_contains(&out, "copy in out1");
    assert_output_contains(&out, "noop out2");
    assert_output_not_contains(&out, "copy out2 out3");

    // And the whole tree is considered clean again.
    let out = space.run_expect(&mut nin_command(vec!["out3"]))?;
    assert_output_contains(&out, "ninja: no work to do.");
    Ok(())
}
