use log::info;
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;

/// Variables a containerized CI environment may inject to redirect build output.
/// The build tool must write where we expect, so these never reach it.
const OUTPUT_OVERRIDES: &[&str] = &[
    "TARGET_OUT",
    "TARGET_OUT_LINUX",
    "ISTIO_OUT",
    "ISTIO_OUT_LINUX",
    "TAG",
    "VERSION",
    "HUB",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("`{command}` in {dir} exited with {status}{}", stderr_suffix(.stderr))]
    Failed {
        command: String,
        dir: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("`{command}` could not be started: {err}")]
    Spawn { command: String, err: std::io::Error },
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// An external process invocation that logs itself and reports failures with the
/// command line and working directory attached.
pub struct Cmd {
    inner: std::process::Command,
    display: String,
    dir: Option<PathBuf>,
    input: Option<String>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            inner: std::process::Command::new(program),
            display: program.to_string(),
            dir: None,
            input: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.display.push(' ');
        self.display.push_str(&arg.as_ref().to_string_lossy());
        self.inner.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.inner.env(key, value);
        self
    }

    pub fn env_remove<K: AsRef<OsStr>>(mut self, key: K) -> Self {
        self.inner.env_remove(key);
        self
    }

    /// Start from an empty environment, keeping only the named variables.
    pub fn env_isolated(mut self, keep: &[&str]) -> Self {
        self.inner.env_clear();
        for key in keep {
            if let Ok(value) = std::env::var(key) {
                self.inner.env(key, value);
            }
        }
        self
    }

    /// Strip build output overrides inherited from the ambient environment.
    pub fn without_output_overrides(mut self) -> Self {
        for key in OUTPUT_OVERRIDES {
            self.inner.env_remove(key);
        }
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.inner.current_dir(dir.as_ref());
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Feed `input` to the process on stdin. It is not logged.
    pub fn stdin(mut self, input: &str) -> Self {
        self.input = Some(input.to_string());
        self
    }

    fn dir_display(&self) -> String {
        match &self.dir {
            Some(dir) => dir.display().to_string(),
            None => ".".to_string(),
        }
    }

    /// Run with inherited stdout/stderr.
    pub fn run(mut self) -> Result<(), Error> {
        info!("Running command: {} (in {})", self.display, self.dir_display());
        let spawn_err = |err| Error::Spawn {
            command: self.display.clone(),
            err,
        };
        let stdin = match self.input {
            Some(_) => Stdio::piped(),
            None => Stdio::inherit(),
        };
        let mut child = self
            .inner
            .stdin(stdin)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_err)?;
        if let (Some(input), Some(mut pipe)) = (&self.input, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).map_err(spawn_err)?;
        }
        let status = child.wait().map_err(spawn_err)?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Failed {
                dir: self.dir_display(),
                command: self.display,
                status,
                stderr: String::new(),
            })
        }
    }

    /// Run and capture stdout. Stderr is captured and attached to the error on failure.
    pub fn output(mut self) -> Result<String, Error> {
        info!("Running command: {} (in {})", self.display, self.dir_display());
        let spawn_err = |err| Error::Spawn {
            command: self.display.clone(),
            err,
        };
        let stdin = match self.input {
            Some(_) => Stdio::piped(),
            None => Stdio::null(),
        };
        let mut child = self
            .inner
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;
        if let (Some(input), Some(mut pipe)) = (&self.input, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).map_err(spawn_err)?;
        }
        let output = child.wait_with_output().map_err(spawn_err)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::Failed {
                dir: self.dir_display(),
                command: self.display,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    /// Run and capture stdout, treating a non-zero exit as `None`.
    pub fn try_output(self) -> Result<Option<String>, Error> {
        match self.output() {
            Ok(out) => Ok(Some(out)),
            Err(Error::Failed { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Run and report only whether the command succeeded.
    pub fn succeeds(mut self) -> Result<bool, Error> {
        let status = self
            .inner
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| Error::Spawn {
                command: self.display.clone(),
                err,
            })?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_captured() {
        let out = Cmd::new("echo").arg("hello").output().unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn failure_records_command_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .current_dir(dir.path())
            .output()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sh -c echo broken >&2; exit 3"), "{msg}");
        assert!(msg.contains(&dir.path().display().to_string()), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }

    #[test]
    fn stdin_is_fed_to_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("secret");
        Cmd::new("sh")
            .arg("-c")
            .arg(format!("cat > {}", target.display()))
            .stdin("hunter2")
            .run()
            .unwrap();
        assert_eq!(std::fs::read_to_string(target).unwrap(), "hunter2");
    }

    #[test]
    fn captured_output_reads_stdin() {
        let out = Cmd::new("cat").stdin("piped\n").output().unwrap();
        assert_eq!(out, "piped\n");
    }

    #[test]
    fn output_overrides_are_stripped() {
        let out = Cmd::new("sh")
            .args(["-c", "echo ${TARGET_OUT_LINUX:-unset}"])
            .env("TARGET_OUT_LINUX", "/somewhere/else")
            .without_output_overrides()
            .output()
            .unwrap();
        assert_eq!(out.trim(), "unset");
    }
}
