use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Everything a launcher needs to start one simulation worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub seed: i64,
    pub identity: String,
    pub output_path: PathBuf,
    pub index: usize,
    pub process_count: usize,
}

pub trait WorkerLauncher: Send + Sync {
    fn spawn(&self, request: &WorkerRequest) -> io::Result<Box<dyn WorkerHandle>>;
}

pub trait WorkerHandle: Send {
    fn id(&self) -> u32;

    /// Non-blocking liveness check; reaps the worker once it has exited.
    fn is_alive(&mut self) -> bool;

    /// Asks the worker to exit.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forces the worker to exit.
    fn kill(&mut self) -> io::Result<()>;
}

/// Launches workers as operating system processes from a command template.
///
/// Template tokens may contain `{seed}`, `{identity}`, `{output}`, `{index}`
/// and `{processes}`, which are substituted per worker. The same values are
/// exported as `MCERD_*` environment variables.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    stdout_to_output: bool,
    inherit_stderr: bool,
}

impl ProcessLauncher {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
            stdout_to_output: true,
            inherit_stderr: false,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// When set, the worker's stdout is appended to its output file.
    pub fn stdout_to_output(mut self, enabled: bool) -> Self {
        self.stdout_to_output = enabled;
        self
    }

    pub fn inherit_stderr(mut self, enabled: bool) -> Self {
        self.inherit_stderr = enabled;
        self
    }

    fn render(&self, request: &WorkerRequest) -> Vec<String> {
        self.command
            .iter()
            .map(|part| substitute_placeholders(part, request))
            .collect()
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(&self, request: &WorkerRequest) -> io::Result<Box<dyn WorkerHandle>> {
        let argv = self.render(request);
        if argv.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker command is empty",
            ));
        }
        if let Some(parent) = request.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let output = open_output(&request.output_path)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env("MCERD_SEED", request.seed.to_string());
        cmd.env("MCERD_IDENTITY", &request.identity);
        cmd.env("MCERD_OUTPUT", &request.output_path);
        cmd.env("MCERD_INDEX", request.index.to_string());
        cmd.env("MCERD_PROCESSES", request.process_count.to_string());
        cmd.stdin(Stdio::null());
        if self.stdout_to_output {
            cmd.stdout(Stdio::from(output));
        } else {
            cmd.stdout(Stdio::null());
        }
        if self.inherit_stderr {
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stderr(Stdio::null());
        }

        let child = cmd.spawn()?;
        debug!(
            seed = request.seed,
            pid = child.id(),
            output = %request.output_path.display(),
            "spawned simulation worker"
        );
        Ok(Box::new(ProcessWorker {
            child,
            exited: false,
        }))
    }
}

fn open_output(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().create(true).append(true).open(path)
}

fn substitute_placeholders(part: &str, request: &WorkerRequest) -> String {
    part.replace("{seed}", &request.seed.to_string())
        .replace("{identity}", &request.identity)
        .replace("{output}", &request.output_path.to_string_lossy())
        .replace("{index}", &request.index.to_string())
        .replace("{processes}", &request.process_count.to_string())
}

struct ProcessWorker {
    child: Child,
    exited: bool,
}

impl WorkerHandle for ProcessWorker {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => {
                self.exited = true;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = self.child.id(), error = %e, "worker status check failed");
                false
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if !self.is_alive() {
            return Ok(());
        }
        kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.child.kill()?;
        self.child.wait()?;
        self.exited = true;
        Ok(())
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Asks every worker to terminate, waits up to `grace` for them to exit and
/// force-kills the rest. Returns how many had to be killed.
pub fn terminate_with_grace(
    workers: &mut [Box<dyn WorkerHandle>],
    grace: Duration,
    poll: Duration,
) -> usize {
    for worker in workers.iter_mut() {
        if let Err(e) = worker.terminate() {
            warn!(pid = worker.id(), error = %e, "failed to signal worker");
        }
    }
    let deadline = Instant::now() + grace;
    loop {
        if workers.iter_mut().all(|w| !w.is_alive()) {
            return 0;
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(poll);
    }
    let mut killed = 0;
    for worker in workers.iter_mut() {
        if !worker.is_alive() {
            continue;
        }
        warn!(pid = worker.id(), "worker ignored termination, killing");
        match worker.kill() {
            Ok(()) => killed += 1,
            Err(e) => warn!(pid = worker.id(), error = %e, "failed to kill worker"),
        }
    }
    killed
}
