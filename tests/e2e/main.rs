//! Support code for e2e tests, which run nin as a binary.

mod basic;
mod discovered;
mod dyndep;
mod failures;
mod missing;
mod pools;
mod regen;
mod restat;

pub fn nin_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("nin")
}

pub fn nin_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(nin_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so the Rust test
    // framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

/// Both output streams, combined, for matching against.
pub fn output_text(out: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    text
}

#[track_caller]
pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let all = output_text(out);
    if !all.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, all
        );
    }
}

#[track_caller]
pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let all = output_text(out);
    if all.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, all
        );
    }
}

/// Manages a temporary directory for invoking nin.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn metadata(&self, path: &str) -> std::io::Result<std::fs::Metadata> {
        std::fs::metadata(self.dir.path().join(path))
    }

    /// Move a file's mtime backwards, so later writes clearly supersede it.
    pub fn sub_mtime(&self, path: &str, dur: std::time::Duration) -> std::io::Result<()> {
        let path = self.dir.path().join(path);
        let modified = std::fs::metadata(&path)?.modified()? - dur;
        let f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.set_modified(modified)
    }

    /// Invoke nin, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }
}

// Ensure TOUCH_RULE has the same description and number of lines of text
// on Windows/non-Windows to make tests agnostic to platform.

#[cfg(unix)]
pub const TOUCH_RULE: &str = "
rule touch
  command = touch $out
  description = touch $out
";

#[cfg(windows)]
pub const TOUCH_RULE: &str = "
rule touch
  command = cmd /c type nul > $out
  description = touch $out
";

#[cfg(unix)]
pub const COPY_RULE: &str = "
rule copy
  command = cp $in $out
  description = copy $in $out
";

#[cfg(windows)]
pub const COPY_RULE: &str = "
rule copy
  command = cmd /c copy /y $in $out
  description = copy $in $out
";
