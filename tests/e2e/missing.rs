use crate::*;

#[test]
fn unknown_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", TOUCH_RULE)?;
    let out = space.run(&mut nin_command(vec!["nosuch"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "unknown target: 'nosuch'");
    Ok(())
}

#[test]
fn missing_input_names_dependent() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch gone", ""].join("\n"),
    )?;
    let out = space.run(&mut nin_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(
        &out,
        "'gone', needed by 'out', missing and no known rule to make it",
    );
    Ok(())
}

#[test]
fn dependency_cycle() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build a: touch b", "build b: touch a", ""].join("\n"),
    )?;
    let out = space.run(&mut nin_command(vec!["a"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "dependency cycle: a -> b -> a");
    Ok(())
}

#[test]
fn phony_self_cycle_tolerated() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build real: touch", "build a: phony a real", ""].join("\n"),
    )?;
    let out = space.run_expect(&mut nin_command(vec!["a"]))?;
    assert_output_contains(&out, "names itself as an input; ignoring");
    assert!(space.read("real").is_ok());
    Ok(())
}

#[test]
fn missing_source_as_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    // `in` is a plain source: asking for it directly is fine and does no
    // work, but a missing source is an error.
    let out = space.run_expect(&mut nin_command(vec!["in"]))?;
    assert_output_contains(&out, "ninja: no work to do.");
    Ok(())
}
