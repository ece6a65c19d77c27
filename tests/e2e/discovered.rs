use crate::*;

#[cfg(unix)]
const GENDEP_RULE: &str = "
rule gendep
  description = gendep $out
  command = echo \"$dep_content\" > $out.d && touch $out
  depfile = $out.d
  deps = gcc
";

/// Header dependencies round-trip through the deps log: the depfile is read
/// once, deleted, and later rebuilds honor the recorded headers.
#[cfg(unix)]
#[test]
fn discovered_header_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            GENDEP_RULE,
            "
build out: gendep src
  dep_content = out: src hdr
",
            "",
        ]
        .join("\n"),
    )?;
    space.write("src", "")?;
    space.write("hdr", "")?;
    space.sub_mtime("src", std::time::Duration::from_secs(10))?;
    space.sub_mtime("hdr", std::time::Duration::from_secs(10))?;

    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "gendep out");
    // The depfile has been consumed into the deps log.
    assert!(space.read("out.d").is_err());

    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "ninja: no work to do.");

    // Touching the header discovered via the depfile triggers a rebuild.
    space.write("hdr", "changed")?;
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "gendep out");

    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "ninja: no work to do.");
    Ok(())
}

/// -d keepdepfile leaves the depfile on disk.
#[cfg(unix)]
#[test]
fn keepdepfile() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            GENDEP_RULE,
            "
build out: gendep src
  dep_content = out: src
",
            "",
        ]
        .join("\n"),
    )?;
    space.write("src", "")?;
    space.run_expect(&mut nin_command(vec!["-d", "keepdepfile", "out"]))?;
    assert!(space.read("out.d").is_ok());
    Ok(())
}

/// depfile contains invalid syntax.
#[cfg(unix)]
#[test]
fn bad_depfile() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            GENDEP_RULE,
            "
build out: gendep
  dep_content = garbage text
",
            "",
        ]
        .join("\n"),
    )?;

    let out = space.run(&mut nin_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "parse error:");
    Ok(())
}

/// The depfile must describe the edge's first output.
#[cfg(unix)]
#[test]
fn depfile_for_wrong_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule gendep
  command = echo \"other: src\" > $out.d && touch $out
  depfile = $out.d

build out: gendep src
",
    )?;
    space.write("src", "")?;
    // First build succeeds (the depfile is only written now)...
    space.run_expect(&mut nin_command(vec!["out"]))?;
    // ...but the next scan rejects the mismatched depfile.
    let out = space.run(&mut nin_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "expected depfile 'out.d' to mention 'out', got 'other'");
    Ok(())
}

/// Without deps=gcc, the depfile is parsed during the scan and stays on
/// disk.
#[cfg(unix)]
#[test]
fn plain_depfile_scanned() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule gendep
  description = gendep $out
  command = echo \"out: src hdr\" > $out.d && touch $out
  depfile = $out.d

build out: gendep src
",
    )?;
    space.write("src", "")?;
    space.write("hdr", "")?;
    space.sub_mtime("src", std::time::Duration::from_secs(10))?;
    space.sub_mtime("hdr", std::time::Duration::from_secs(10))?;

    space.run_expect(&mut nin_command(vec!["out"]))?;
    assert!(space.read("out.d").is_ok());

    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "ninja: no work to do.");

    space.write("hdr", "changed")?;
    let out = space.run_expect(&mut nin_command(vec!["out"]))?;
    assert_output_contains(&out, "gendep out");
    Ok(())
}
