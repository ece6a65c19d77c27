use crate::*;

/// A manifest that is itself a build output is brought up to date and
/// reloaded before the requested targets build.
#[cfg(unix)]
#[test]
fn manifest_regenerates_first() -> anyhow::Result<()> {
    let manifest = &[
        COPY_RULE,
        TOUCH_RULE,
        "build build.ninja: copy manifest-src
  generator = 1",
        "build out: touch",
        "",
    ]
    .join("\n");

    let space = TestSpace::new()?;
    space.write("manifest-src", manifest)?;
    space.write("build.ninja", manifest)?;
    space.sub_mtime("build.ninja", std::time::Duration::from_secs(10))?;

    // The manifest is older than its source, so it regenerates, then the
    // target builds against the fresh manifest.
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "copy manifest-src build.ninja");
    assert_output_contains(&out, "touch out");

    // Steady state.
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_not_contains(&out, "copy manifest-src build.ninja");
    assert_output_contains(&out, "ninja: no work to do.");
    Ok(())
}

/// Default targets are used when no target is named on the command line.
#[test]
fn default_targets_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch",
            "build b: touch",
            "default a",
            "",
        ]
        .join("\n"),
    )?;
    space.run_expect(&mut nin_command(vec![]))?;
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_err());
    Ok(())
}
