//! Runs build commands, potentially in parallel.
//! Unaware of the build graph, pools, etc.; just command execution.

use crate::graph::BuildId;
use anyhow::bail;
use std::sync::mpsc;
use std::time::Instant;

#[cfg(unix)]
use std::io::Write;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// The result of executing one command.
pub struct TaskResult {
    pub termination: Termination,
    /// Captured stdout+stderr.
    pub output: Vec<u8>,
}

pub struct FinishedTask {
    /// A (faked) "thread id", used to put different finished builds in
    /// different tracks in a performance trace.
    pub tid: usize,
    pub buildid: BuildId,
    pub span: (Instant, Instant),
    pub result: TaskResult,
}

/// The seam between the build driver and subprocess management.  The real
/// implementation spawns threads that block on child processes; tests use a
/// synchronous fake.
pub trait CommandRunner {
    /// Whether another command may be started right now.  Gated by both
    /// parallelism and the load-average limit.
    fn can_run_more(&self) -> bool;
    /// Start a command.  A console command inherits the parent's stdio
    /// instead of having its output captured.
    fn start(&mut self, id: BuildId, cmdline: String, console: bool);
    /// Block until some started command completes.  None means there was
    /// nothing running to wait for.
    fn wait(&mut self) -> Option<FinishedTask>;
    fn running(&self) -> usize;
    fn active_builds(&self) -> Vec<BuildId>;
    fn abort(&mut self);
}

#[cfg(unix)]
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret < 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        bail!("{}: {}", func, err_str.to_string_lossy());
    }
    Ok(())
}

#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Run a command via the shell, capturing stdout and stderr into one buffer.
/// We don't use std::process because we want both streams interleaved in a
/// single pipe, which its API cannot express.  Console commands are spawned
/// without any redirection at all, so they own the real terminal.
#[cfg(unix)]
fn run_command(cmdline: &str, console: bool) -> anyhow::Result<TaskResult> {
    use std::io::Read;

    let (pid, pipe) = unsafe {
        use libc::c_int;
        use std::os::fd::FromRawFd;

        let mut actions = PosixSpawnFileActions::new()?;
        let mut pipe: [c_int; 2] = std::mem::zeroed();
        if !console {
            check_posix("pipe", libc::pipe(&mut pipe as *mut i32))?;
            // stdout/stderr => pipe
            actions.adddup2(pipe[1], 1)?;
            actions.adddup2(pipe[1], 2)?;
            // close pipe in child
            actions.addclose(pipe[0])?;
            actions.addclose(pipe[1])?;
        }

        let mut pid: libc::pid_t = 0;
        let path = c"/bin/sh".as_ptr();
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv: [*const libc::c_char; 4] = [
            path,
            c"-c".as_ptr(),
            cmdline_nul.as_ptr(),
            std::ptr::null(),
        ];

        check_posix(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                path,
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr() as *const *mut libc::c_char,
                std::ptr::null(),
            ),
        )?;

        if console {
            (pid, None)
        } else {
            check_posix("close", libc::close(pipe[1]))?;
            (pid, Some(std::fs::File::from_raw_fd(pipe[0])))
        }
    };

    let mut output = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut output)?;
    }

    let status = unsafe {
        let mut status: i32 = 0;
        check_posix("waitpid", libc::waitpid(pid, &mut status, 0))?;
        std::process::ExitStatus::from_raw(status)
    };

    let mut termination = Termination::Success;
    if !status.success() {
        termination = Termination::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT => {
                    write!(output, "interrupted").unwrap();
                    termination = Termination::Interrupted;
                }
                _ => write!(output, "signal {}", sig).unwrap(),
            }
        }
    }

    Ok(TaskResult {
        termination,
        output,
    })
}

#[cfg(windows)]
fn run_command(cmdline: &str, console: bool) -> anyhow::Result<TaskResult> {
    // Don't run `cmd /c` (it limits command length to 8k); hand the string
    // to CreateProcess unchanged, which std::process cannot do.
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0};
    use windows_sys::Win32::System::Threading::{
        CreateProcessA, GetExitCodeProcess, WaitForSingleObject, CREATE_NEW_PROCESS_GROUP,
        INFINITE, PROCESS_INFORMATION, STARTUPINFOA,
    };

    // Console commands stay in our process group so they own the terminal.
    let process_flags = if console { 0 } else { CREATE_NEW_PROCESS_GROUP };

    let mut startup_info: STARTUPINFOA = unsafe { std::mem::zeroed() };
    startup_info.cb = std::mem::size_of::<STARTUPINFOA>() as u32;
    if !console {
        startup_info.hStdInput = INVALID_HANDLE_VALUE;
        startup_info.hStdOutput = INVALID_HANDLE_VALUE;
        startup_info.hStdError = INVALID_HANDLE_VALUE;
    }

    let mut process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let mut mut_cmdline = cmdline.to_string() + "\0";

    let created = unsafe {
        CreateProcessA(
            std::ptr::null_mut(),
            mut_cmdline.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            TRUE,
            process_flags,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut startup_info,
            &mut process_info,
        )
    };
    if created == 0 {
        bail!("CreateProcessA failed");
    }

    let mut exit_code: u32 = 0;
    unsafe {
        CloseHandle(process_info.hThread);
        if WaitForSingleObject(process_info.hProcess, INFINITE) != WAIT_OBJECT_0 {
            bail!("WaitForSingleObject failed");
        }
        GetExitCodeProcess(process_info.hProcess, &mut exit_code);
        CloseHandle(process_info.hProcess);
    }

    let termination = match exit_code {
        0 => Termination::Success,
        0xC000013A => Termination::Interrupted,
        _ => Termination::Failure,
    };

    Ok(TaskResult {
        termination,
        output: Vec::new(),
    })
}

/// The 1-minute load average, or a negative value where unsupported.
#[cfg(unix)]
fn load_average() -> f64 {
    let mut avgs: [f64; 3] = [-1.0; 3];
    let r = unsafe { libc::getloadavg(avgs.as_mut_ptr(), 3) };
    if r < 1 {
        return -1.0;
    }
    avgs[0]
}

#[cfg(not(unix))]
fn load_average() -> f64 {
    -1.0
}

/// Tracks faked "thread ids" -- integers assigned to build tasks to track
/// parallelism in perf trace output.
#[derive(Default)]
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}

impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

/// The real CommandRunner: one thread per running command, each blocking on
/// its child process and reporting back over a channel.
pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    running: Vec<BuildId>,
    tids: ThreadIds,
    parallelism: usize,
    max_load_average: f64,
}

impl Runner {
    pub fn new(parallelism: usize, max_load_average: f64) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: Vec::new(),
            tids: ThreadIds::default(),
            parallelism,
            max_load_average,
        }
    }
}

impl CommandRunner for Runner {
    fn can_run_more(&self) -> bool {
        if self.running.len() >= self.parallelism {
            return false;
        }
        if self.max_load_average > 0.0 && !self.running.is_empty() {
            let load = load_average();
            if load >= 0.0 && load > self.max_load_average {
                return false;
            }
        }
        true
    }

    fn start(&mut self, id: BuildId, cmdline: String, console: bool) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = run_command(&cmdline, console).unwrap_or_else(|err| TaskResult {
                termination: Termination::Failure,
                output: err.to_string().into_bytes(),
            });
            let finish = Instant::now();

            let task = FinishedTask {
                tid,
                buildid: id,
                span: (start, finish),
                result,
            };
            // The send fails only if the receiver is gone, i.e. on shutdown.
            let _ = tx.send(task);
        });
        self.running.push(id);
    }

    fn wait(&mut self) -> Option<FinishedTask> {
        if self.running.is_empty() {
            return None;
        }
        let task = self.finished_recv.recv().ok()?;
        self.tids.release(task.tid);
        self.running.retain(|&id| id != task.buildid);
        Some(task)
    }

    fn running(&self) -> usize {
        self.running.len()
    }

    fn active_builds(&self) -> Vec<BuildId> {
        self.running.clone()
    }

    fn abort(&mut self) {
        // Children already received the terminal's SIGINT; their threads
        // will observe the exit and unblock.  Nothing to kill explicitly.
        self.running.clear();
    }
}
