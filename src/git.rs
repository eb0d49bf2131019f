use crate::command::{self, Cmd};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] command::Error),

    #[error("{0} has no HEAD commit")]
    NoHead(PathBuf),
}

/// Environment variables passed through to git. Everything else is dropped.
const GIT_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "SSH_AUTH_SOCK",
    "GIT_SSH_COMMAND",
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
    "NO_PROXY",
    "no_proxy",
];

/// Carries the token for remote operations. It is read from the environment so it
/// never shows up in a logged command line.
const TOKEN_ENV: &str = "RB_GIT_TOKEN";

/// Answers `get` requests with the token as an `x-access-token` basic auth password.
const CREDENTIAL_HELPER: &str = r#"!f() { test "$1" = get && echo username=x-access-token && echo "password=$RB_GIT_TOKEN"; }; f"#;

/// A git working tree operated on through the system `git` binary.
pub struct Git {
    dir: PathBuf,
    token: Option<String>,
}

impl Git {
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            token: None,
        }
    }

    /// Authenticate pushes and remote queries over https with a GitHub token.
    /// An empty token leaves remote operations unauthenticated.
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = (!token.is_empty()).then(|| token.to_string());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Clone `url` into `dest`. With a branch the clone is shallow.
    pub fn clone(url: &str, dest: &Path, branch: Option<&str>) -> Result<Self, Error> {
        let mut cmd = base_cmd().arg("clone").arg(url).arg(dest);
        if let Some(branch) = branch {
            cmd = cmd.args(["-b", branch, "--depth=1"]);
        }
        cmd.run()?;
        Ok(Self::open(dest))
    }

    fn cmd(&self) -> Cmd {
        base_cmd().arg("-C").arg(&self.dir)
    }

    /// A command that talks to the remote, never prompting for credentials.
    fn remote_cmd(&self) -> Cmd {
        let cmd = self.cmd().env("GIT_TERMINAL_PROMPT", "0");
        match &self.token {
            Some(token) => cmd
                .args(["-c", "credential.helper="])
                .arg("-c")
                .arg(format!("credential.helper={CREDENTIAL_HELPER}"))
                .env(TOKEN_ENV, token),
            None => cmd,
        }
    }

    pub fn checkout(&self, reference: &str) -> Result<(), Error> {
        Ok(self.cmd().args(["checkout", reference]).run()?)
    }

    /// Commit a reference points at, or `None` if it does not exist.
    pub fn rev_parse(&self, reference: &str) -> Result<Option<String>, Error> {
        let out = self
            .cmd()
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{reference}^{{commit}}"))
            .try_output()?;
        Ok(out
            .map(|sha| sha.trim().to_string())
            .filter(|sha| !sha.is_empty()))
    }

    pub fn head(&self) -> Result<String, Error> {
        self.rev_parse("HEAD")?
            .ok_or_else(|| Error::NoHead(self.dir.clone()))
    }

    /// Create a lightweight tag at HEAD.
    pub fn tag(&self, name: &str) -> Result<(), Error> {
        Ok(self.cmd().args(["tag", name]).run()?)
    }

    /// `git status --porcelain`; empty when the tree is clean.
    pub fn status_porcelain(&self) -> Result<String, Error> {
        Ok(self.cmd().args(["status", "--porcelain"]).output()?)
    }

    /// Discard working tree changes under `path`.
    pub fn restore(&self, path: &str) -> Result<(), Error> {
        Ok(self.cmd().args(["checkout", "HEAD", "--", path]).run()?)
    }

    pub fn checkout_new_branch(&self, branch: &str) -> Result<(), Error> {
        Ok(self.cmd().args(["checkout", "-b", branch]).run()?)
    }

    pub fn add_all(&self) -> Result<(), Error> {
        Ok(self.cmd().args(["add", "-A"]).run()?)
    }

    pub fn commit(&self, message: &str, name: &str, email: &str) -> Result<(), Error> {
        Ok(self
            .cmd()
            .arg("-c")
            .arg(format!("user.name={name}"))
            .arg("-c")
            .arg(format!("user.email={email}"))
            .args(["commit", "-m", message])
            .arg(format!("--author={name} <{email}>"))
            .run()?)
    }

    pub fn push_upstream(&self, branch: &str) -> Result<(), Error> {
        Ok(self
            .remote_cmd()
            .args(["push", "--set-upstream", "origin", branch])
            .run()?)
    }

    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool, Error> {
        Ok(self
            .remote_cmd()
            .args(["ls-remote", "--exit-code", "--heads", "origin", branch])
            .succeeds()?)
    }
}

fn base_cmd() -> Cmd {
    Cmd::new("git")
        .env_isolated(GIT_ENV)
        .args(["-c", "advice.detachedHead=false"])
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::process::Command;

    pub fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=Test User", "-c", "user.email=test@example.com"])
            .args(["-c", "commit.gpgsign=false", "-c", "tag.gpgsign=false"])
            .args(args)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    /// Initialize a repository with one commit touching `file`.
    pub fn init_repo(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        git(dir, &["init", "--initial-branch=main"]);
        commit_file(dir, "README.md", "initial\n");
    }

    pub fn commit_file(dir: &Path, name: &str, contents: &str) -> String {
        std::fs::write(dir.join(name), contents).unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", &format!("update {name}")]);
        git(dir, &["rev-parse", "HEAD"])
    }
}
