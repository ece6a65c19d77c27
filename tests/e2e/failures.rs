use crate::*;

#[cfg(unix)]
const FAIL_RULES: &str = "
rule fail
  command = echo attempted $out >> attempts && false
  description = fail $out

build f1: fail
build f2: fail
build f3: fail
build all: phony f1 f2 f3
";

/// With -k 3 every failing command is attempted before the build stops.
#[cfg(unix)]
#[test]
fn keep_going_runs_all_failures() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", FAIL_RULES)?;

    let out = space.run(&mut nin_command(vec!["-j", "1", "-k", "3", "all"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "ninja: build stopped: subcommands failed.");

    let attempts = String::from_utf8(space.read("attempts")?)?;
    assert_eq!(attempts, "attempted f1\nattempted f2\nattempted f3\n");
    Ok(())
}

/// With the default of one tolerated failure, the first failure stops the
/// build.
#[cfg(unix)]
#[test]
fn first_failure_stops_by_default() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", FAIL_RULES)?;

    let out = space.run(&mut nin_command(vec!["-j", "1", "all"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "ninja: build stopped: subcommand failed.");

    let attempts = String::from_utf8(space.read("attempts")?)?;
    assert_eq!(attempts, "attempted f1\n");
    Ok(())
}

/// A failing command's output is echoed so the user can see what broke.
#[cfg(unix)]
#[test]
fn failure_output_shown() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule fail
  command = echo oh no && false
build out: fail
",
    )?;
    let out = space.run(&mut nin_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "failed: ");
    assert_output_contains(&out, "oh no");
    Ok(())
}

/// Dependents of a failed build never run.
#[cfg(unix)]
#[test]
fn dependents_of_failure_do_not_run() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "
rule fail
  command = false
build broken: fail
build out: touch broken
",
        ]
        .join("\n"),
    )?;
    let out = space.run(&mut nin_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert!(space.read("out").is_err());
    Ok(())
}
