use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ProcessError, Result};
#[cfg(windows)]
use crate::job::Job;
use crate::logs::{LogSink, LogStream};
use crate::state::{EngineState, StateMachine};
#[cfg(unix)]
use crate::tree;

/// How long each process gets between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const LOG_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A running (or finished) engine and everything needed to tear it down.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    pid: u32,
    executable: PathBuf,
    args: Vec<String>,
    state: StateMachine,
    exit_status: Option<ExitStatus>,
    kill_grace: Duration,
    log_threads: Vec<JoinHandle<()>>,
    #[cfg(windows)]
    job: Job,
}

/// Start `executable` with `args` without waiting for it.
///
/// Stdout and stderr are read line by line on their own threads and handed
/// to `sink`. On Unix the engine leads a new process group; on Linux it also
/// gets SIGKILL when the spawning thread's process dies. On Windows it runs
/// inside a kill-on-close job object.
pub fn spawn(
    executable: impl AsRef<Path>,
    args: &[String],
    workdir: Option<&Path>,
    sink: Arc<dyn LogSink>,
) -> Result<EngineProcess> {
    let executable = executable.as_ref().to_path_buf();
    let spawn_failed = |source: io::Error| ProcessError::ProcessSpawnFailed {
        executable: executable.clone(),
        source,
    };

    let mut command = Command::new(&executable);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }

    #[cfg(unix)]
    configure_unix(&mut command);
    #[cfg(windows)]
    let job = {
        use std::os::windows::process::CommandExt;
        use windows_sys::Win32::System::Threading::CREATE_NO_WINDOW;
        command.creation_flags(CREATE_NO_WINDOW);
        Job::kill_on_close().map_err(spawn_failed)?
    };

    let mut child = command.spawn().map_err(spawn_failed)?;
    let pid = child.id();

    #[cfg(windows)]
    if let Err(err) = job.assign(&child) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(spawn_failed(err));
    }

    let mut log_threads = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        log_threads.push(capture(stdout, LogStream::Stdout, Arc::clone(&sink), pid)?);
    }
    if let Some(stderr) = child.stderr.take() {
        log_threads.push(capture(stderr, LogStream::Stderr, sink, pid)?);
    }

    info!(pid, executable = %executable.display(), args = args.len(), "engine spawned");
    Ok(EngineProcess {
        child,
        pid,
        executable,
        args: args.to_vec(),
        state: StateMachine::default(),
        exit_status: None,
        kill_grace: DEFAULT_KILL_GRACE,
        log_threads,
        #[cfg(windows)]
        job,
    })
}

#[cfg(unix)]
fn configure_unix(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    command.process_group(0);

    #[cfg(target_os = "linux")]
    {
        let parent = std::process::id() as libc::pid_t;
        // SAFETY: the closure only makes async-signal-safe libc calls.
        unsafe {
            command.pre_exec(move || {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(io::Error::last_os_error());
                }
                // The parent may have died before prctl took effect.
                if libc::getppid() != parent {
                    return Err(io::Error::from_raw_os_error(libc::ESRCH));
                }
                Ok(())
            });
        }
    }
}

fn capture<R: Read + Send + 'static>(
    source: R,
    stream: LogStream,
    sink: Arc<dyn LogSink>,
    pid: u32,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("engine-{pid}-{}", stream.as_str()))
        .spawn(move || {
            let mut reader = BufReader::new(source);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        sink.line(stream, line.trim_end_matches(['\n', '\r']));
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(pid, stream = stream.as_str(), error = %err, "log capture stopped");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

impl EngineProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Arguments the engine was started with, without the executable.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn state(&self) -> EngineState {
        self.state.current()
    }

    pub fn transition(&mut self, next: EngineState) -> Result<()> {
        self.state.transition(next)
    }

    /// States the engine has been in, oldest first.
    pub fn state_history(&self) -> &[EngineState] {
        self.state.history()
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    pub fn set_kill_grace(&mut self, grace: Duration) {
        self.kill_grace = grace;
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Whether the engine process itself is still running. Reaps it if not.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = self.pid, error = %err, "could not query engine status");
                false
            }
        }
    }

    /// Wait up to `timeout` for the engine to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.exit_status {
                return Ok(Some(status));
            }
            if let Some(status) = self.child.try_wait()? {
                self.record_exit(status);
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Give up on an engine that never finished starting: mark it shutting
    /// down, then kill its tree.
    pub fn abort(&mut self) -> Result<()> {
        if self.state.current().can_transition_to(EngineState::ShuttingDown) {
            self.state.transition(EngineState::ShuttingDown)?;
        }
        self.kill_tree()
    }

    /// Forcefully end the engine and every process it started.
    ///
    /// Safe to call more than once and after the engine already exited.
    pub fn kill_tree(&mut self) -> Result<()> {
        self.kill_tree_platform()?;
        self.reap()?;
        self.state.terminate();
        Ok(())
    }

    #[cfg(unix)]
    fn kill_tree_platform(&mut self) -> Result<()> {
        let grace = self.kill_grace;
        // Enumerate before the root dies; orphans lose their parent link.
        let descendants = tree::descendants(self.pid);
        let forced = tree::terminate_all(&descendants, grace);

        if self.is_alive() {
            tree::signal(self.pid, libc::SIGTERM)?;
            if self.wait_timeout(grace)?.is_none() {
                debug!(pid = self.pid, "engine ignored SIGTERM");
                tree::signal(self.pid, libc::SIGKILL)?;
            }
        }

        // Sweep the engine's process group for anything forked after the scan.
        if let Err(err) = tree::signal_group(self.pid, libc::SIGKILL) {
            debug!(pgid = self.pid, error = %err, "process group sweep failed");
        }

        info!(
            pid = self.pid,
            descendants = descendants.len(),
            forced = forced.len(),
            "engine tree killed"
        );
        Ok(())
    }

    #[cfg(windows)]
    fn kill_tree_platform(&mut self) -> Result<()> {
        if let Err(err) = self.job.terminate(1) {
            warn!(pid = self.pid, error = %err, "job termination failed");
            if self.is_alive() {
                self.child.kill()?;
            }
        }
        info!(pid = self.pid, "engine job terminated");
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn kill_tree_platform(&mut self) -> Result<()> {
        if self.is_alive() {
            self.child.kill()?;
        }
        Ok(())
    }

    /// Ask nicely by waiting `grace`, then kill the tree regardless.
    ///
    /// The caller is expected to have sent the engine its shutdown call.
    pub fn shutdown(&mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        if self.state.current().can_transition_to(EngineState::ShuttingDown) {
            self.state.transition(EngineState::ShuttingDown)?;
        }
        if self.wait_timeout(grace)?.is_none() {
            warn!(pid = self.pid, ?grace, "engine did not exit in time; forcing");
        }
        self.kill_tree()?;
        self.join_logs();
        Ok(self.exit_status)
    }

    fn reap(&mut self) -> Result<()> {
        if self.exit_status.is_none() {
            let status = self.child.wait()?;
            self.record_exit(status);
        }
        Ok(())
    }

    fn record_exit(&mut self, status: ExitStatus) {
        if self.exit_status.is_none() {
            info!(pid = self.pid, %status, "engine exited");
            self.exit_status = Some(status);
            self.state.terminate();
        }
    }

    /// Log threads end once every holder of the pipes is gone; don't hang on
    /// one that outlived the tree.
    fn join_logs(&mut self) {
        let deadline = Instant::now() + LOG_JOIN_TIMEOUT;
        for handle in self.log_threads.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(EXIT_POLL_INTERVAL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            if let Err(err) = self.kill_tree() {
                warn!(pid = self.pid, error = %err, "kill on drop failed");
            }
        }
    }
}

/// Forcefully end `process` and its descendants.
pub fn kill_tree(process: &mut EngineProcess) -> Result<()> {
    process.kill_tree()
}

pub fn is_alive(process: &mut EngineProcess) -> bool {
    process.is_alive()
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Lines(Mutex<Vec<(LogStream, String)>>);

    impl LogSink for Lines {
        fn line(&self, stream: LogStream, line: &str) {
            self.0.lock().unwrap().push((stream, line.to_string()));
        }
    }

    fn sh(script: &str, sink: Arc<dyn LogSink>) -> EngineProcess {
        spawn("sh", &["-c".to_string(), script.to_string()], None, sink).expect("spawn sh")
    }

    #[test]
    fn forwards_raw_lines_from_both_pipes() {
        let lines = Arc::new(Lines::default());
        let mut process = sh(
            r#"echo '{"@m":"hi"}'; echo 'plain text'; echo oops >&2"#,
            lines.clone(),
        );
        assert!(process.wait_timeout(Duration::from_secs(5)).unwrap().is_some());
        process.join_logs();

        let seen = lines.0.lock().unwrap().clone();
        assert!(seen.contains(&(LogStream::Stdout, r#"{"@m":"hi"}"#.to_string())));
        assert!(seen.contains(&(LogStream::Stdout, "plain text".to_string())));
        assert!(seen.contains(&(LogStream::Stderr, "oops".to_string())));
        assert_eq!(process.state(), EngineState::Terminated);
    }

    #[test]
    fn missing_executable_is_spawn_failed() {
        let err = spawn(
            "/nonexistent/enginewire-engine",
            &[],
            None,
            Arc::new(crate::logs::NullLogSink),
        )
        .expect_err("should fail");
        assert!(matches!(err, ProcessError::ProcessSpawnFailed { .. }));
    }

    #[test]
    fn engine_leads_its_own_process_group() {
        let mut process = sh("sleep 30", Arc::new(crate::logs::NullLogSink));
        // SAFETY: getpgid on a pid we own.
        let pgid = unsafe { libc::getpgid(process.pid() as libc::pid_t) };
        assert_eq!(pgid as u32, process.pid());
        process.kill_tree().unwrap();
    }

    #[test]
    fn kill_tree_takes_children_along() {
        let mut process = sh("sleep 30 & sleep 30 & wait", Arc::new(crate::logs::NullLogSink));
        process.set_kill_grace(Duration::from_millis(500));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut children = tree::descendants(process.pid());
        while children.len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
            children = tree::descendants(process.pid());
        }
        assert_eq!(children.len(), 2);

        kill_tree(&mut process).unwrap();
        assert!(!is_alive(&mut process));
        for pid in children {
            assert!(tree::wait_gone(pid, Duration::from_secs(1)), "child {pid} survived");
        }
        // Idempotent.
        process.kill_tree().unwrap();
    }

    #[test]
    fn abort_passes_through_shutting_down() {
        let mut process = sh("sleep 30", Arc::new(crate::logs::NullLogSink));
        process.set_kill_grace(Duration::from_millis(500));
        let pid = process.pid();

        process.abort().unwrap();
        assert_eq!(
            process.state_history(),
            &[EngineState::Spawned, EngineState::ShuttingDown, EngineState::Terminated]
        );
        assert!(tree::wait_gone(pid, Duration::from_secs(1)));
        // Aborting a dead engine changes nothing.
        process.abort().unwrap();
        assert_eq!(process.state_history().len(), 3);
    }

    #[test]
    fn shutdown_after_clean_exit_still_sweeps() {
        let mut process = sh("exit 0", Arc::new(crate::logs::NullLogSink));
        let status = process.shutdown(Duration::from_secs(5)).unwrap();
        assert!(status.expect("exit status").success());
        assert_eq!(process.state(), EngineState::Terminated);
    }
}
