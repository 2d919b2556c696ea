use crate::error::CreteError;
use log::{info, warn};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Everything needed to start one instance of the target.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub executable: PathBuf,
    /// Full argv; slot 0 is passed as the program name.
    pub args: Vec<String>,
    pub launch_dir: PathBuf,
    pub env_overrides: Vec<(OsString, OsString)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl TargetExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for TargetExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for TargetExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "terminated by signal {signal}"),
            (None, None) => write!(f, "exited abnormally"),
        }
    }
}

/// Handle to a running target.
pub trait TargetProcess {
    fn id(&self) -> u32;

    /// Non-blocking liveness check.
    fn is_running(&mut self) -> Result<bool, CreteError>;

    fn wait(&mut self) -> Result<TargetExit, CreteError>;
}

pub trait Launcher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<Box<dyn TargetProcess>, CreteError>;
}

/// Spawns the target with the startup hook forced into `LD_PRELOAD`,
/// whatever the inherited environment says.
pub struct ProcessLauncher {
    preload: PathBuf,
}

impl ProcessLauncher {
    pub fn new(preload: &Path) -> Self {
        Self {
            preload: preload.to_path_buf(),
        }
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&request.executable);
        if let Some(arg0) = request.args.first() {
            cmd.arg0(arg0);
        }
        if request.args.len() > 1 {
            cmd.args(&request.args[1..]);
        }
        cmd.current_dir(&request.launch_dir);

        for (key, value) in &request.env_overrides {
            cmd.env(key, value);
        }
        cmd.env_remove(PRELOAD_ENV);
        cmd.env(PRELOAD_ENV, &self.preload);

        cmd.stdin(Stdio::null());
        cmd
    }
}

/// Points stdout and stderr of `cmd` at the write end of one pipe and
/// returns the read end, so both streams arrive interleaved as printed.
fn attach_output(cmd: &mut Command) -> io::Result<File> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe2 fills in.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, both descriptors are open and owned here only.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    cmd.stderr(Stdio::from(write.try_clone()?));
    cmd.stdout(Stdio::from(write));
    Ok(File::from(read))
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<Box<dyn TargetProcess>, CreteError> {
        let mut cmd = self.command(request);
        let output = attach_output(&mut cmd)?;
        let child = cmd.spawn().map_err(|e| CreteError::io(&request.executable, e))?;
        // Our copies of the write end must go, or the echo never sees EOF.
        drop(cmd);

        let echo = Some(spawn_echo(output));

        info!(
            "Launched {:?} (pid {}) in {:?}",
            request.executable,
            child.id(),
            request.launch_dir
        );
        Ok(Box::new(SpawnedTarget { child, echo }))
    }
}

/// Hands each line of `stream` to `emit` until EOF.
fn echo_lines<R: Read>(stream: R, mut emit: impl FnMut(&str)) {
    let reader = BufReader::new(stream);
    for line in reader.split(b'\n') {
        match line {
            Ok(line) => emit(&String::from_utf8_lossy(&line)),
            Err(e) => {
                warn!("Stopped echoing target output: {}", e);
                break;
            }
        }
    }
}

/// Forwards every line the target prints to the log under target `target`.
fn spawn_echo<R: Read + Send + 'static>(stream: R) -> JoinHandle<()> {
    std::thread::spawn(move || echo_lines(stream, |line| info!(target: "target", "{}", line)))
}

struct SpawnedTarget {
    child: Child,
    echo: Option<JoinHandle<()>>,
}

impl SpawnedTarget {
    /// Drains the echo thread so no output of an exited target is lost.
    fn join_echo(&mut self) {
        if let Some(echo) = self.echo.take() {
            if echo.join().is_err() {
                warn!("Target output echo thread panicked");
            }
        }
    }
}

impl TargetProcess for SpawnedTarget {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_running(&mut self) -> Result<bool, CreteError> {
        match self.child.try_wait()? {
            Some(_) => {
                self.join_echo();
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn wait(&mut self) -> Result<TargetExit, CreteError> {
        let status = self.child.wait()?;
        self.join_echo();
        Ok(status.into())
    }
}
