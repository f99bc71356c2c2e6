//! Process spawning for child engines.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::name::EngineName;

/// TeX input that loads the package in child-process mode and starts listening.
pub const LISTEN_DIRECTIVE: &str = r"\RequirePackage[child-process]{pythonimmediate}\pythonimmediatelisten\stop";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a spawner needs to start one interpreter.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub name: EngineName,
    pub args: &'a [OsString],
    pub env: &'a [(OsString, OsString)],
    pub directory: &'a Path,
}

impl SpawnRequest<'_> {
    /// Piped stdio, working directory, extra environment and a fresh process
    /// group, so that terminal interrupts do not reach the interpreter.
    pub fn prepare(&self, command: &mut Command) {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(self.directory)
            .envs(self.env.iter().map(|(k, v)| (k, v)));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
    }
}

/// Starts interpreter processes. Swappable so tests can run a stand-in.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest<'_>) -> io::Result<Child>;
}

/// Runs the engine's LaTeX executable with shell escape and the listen directive.
pub struct LatexSpawner;

impl ProcessSpawner for LatexSpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> io::Result<Child> {
        let mut command = Command::new(request.name.latex_executable());
        command
            .arg("--shell-escape")
            .args(request.args)
            .arg(LISTEN_DIRECTIVE);
        request.prepare(&mut command);
        command.spawn()
    }
}

/// Wait for `child` up to `timeout`. `None` if it is still running.
pub(crate) fn wait_timeout(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Kill the interpreter together with anything it spawned.
pub(crate) fn kill_tree(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let group = Pid::from_raw(child.id() as i32);
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => return Ok(()),
            Err(nix::errno::Errno::ESRCH) => return Ok(()),
            Err(e) => {
                tracing::debug!(pid = child.id(), error = %e, "killpg failed, killing process only");
            }
        }
    }
    match child.kill() {
        Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_directive_loads_child_mode() {
        insta::assert_snapshot!(
            LISTEN_DIRECTIVE,
            @r"\RequirePackage[child-process]{pythonimmediate}\pythonimmediatelisten\stop"
        );
    }

    #[cfg(unix)]
    #[test]
    fn wait_timeout_reports_running_then_kill_reaps() {
        let dir = tempfile::tempdir().unwrap();
        let request = SpawnRequest {
            name: EngineName::PdfTex,
            args: &[],
            env: &[],
            directory: dir.path(),
        };
        let mut command = Command::new("sleep");
        command.arg("30");
        request.prepare(&mut command);
        let mut child = command.spawn().unwrap();

        assert!(wait_timeout(&mut child, Duration::from_millis(50)).unwrap().is_none());
        kill_tree(&mut child).unwrap();
        let status = wait_timeout(&mut child, Duration::from_secs(5)).unwrap();
        assert!(status.is_some_and(|s| !s.success()));
    }

    #[cfg(unix)]
    #[test]
    fn prepared_command_runs_in_directory_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = [(OsString::from("TEXLINK_PROBE"), OsString::from("42"))];
        let request = SpawnRequest {
            name: EngineName::XeTex,
            args: &[],
            env: &env,
            directory: dir.path(),
        };
        let mut command = Command::new("sh");
        command.args(["-c", "printf '%s' \"$TEXLINK_PROBE\" > probe.txt"]);
        request.prepare(&mut command);
        let status = command.spawn().unwrap().wait().unwrap();
        assert!(status.success());
        assert_eq!(std::fs::read_to_string(dir.path().join("probe.txt")).unwrap(), "42");
    }
}
