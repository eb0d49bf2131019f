//! Release branch cut, run one operator-chosen step at a time.
//!
//! Every step edits the working trees of the resolved repositories. Afterwards each
//! repository with changes gets a branch, a commit and a pull request.
mod steps;

use crate::command::{self, Cmd};
use crate::config;
use crate::git::{self, Git};
use crate::makevar;
use crate::manifest;
use crate::model::{Manifest, Repo};
use crate::publish::github::{self, GitHub};
use log::info;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown branch step {0}, expected 1 to 5")]
    UnknownStep(u32),

    #[error("{step}: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<Error>,
    },

    #[error("pull request for {repo}: {source}")]
    PullRequest {
        repo: Repo,
        #[source]
        source: Box<Error>,
    },

    #[error("{repo}: {source}")]
    Git {
        repo: Repo,
        #[source]
        source: git::Error,
    },

    #[error("{0} has no git url to open a pull request against")]
    NoRemote(Repo),

    #[error("a github token is required unless running dry")]
    MissingToken,

    #[error("no build-tools image found for release-{release}")]
    NoBuildToolsTag { release: String },

    #[error("fetch build-tools tags: {0}")]
    Request(#[source] reqwest::Error),

    #[error("{path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error(transparent)]
    Command(#[from] command::Error),

    #[error(transparent)]
    Makevar(#[from] makevar::Error),

    #[error(transparent)]
    Manifest(#[from] manifest::Error),

    #[error(transparent)]
    GitHub(#[from] github::Error),
}

/// One step of the branch cut. Steps are run in order by an operator, who checks the
/// result of each before starting the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Refresh dependency pins on master.
    UpdateDependencies = 1,
    /// Create the release branches.
    CreateBranches = 2,
    /// Generate CI jobs for the release branches.
    SetupProw = 3,
    /// Point build images, common files and owners at the release branches.
    BranchPointers = 4,
    /// Prepare the common-files repository.
    CommonFiles = 5,
}

impl TryFrom<u32> for Step {
    type Error = Error;

    fn try_from(step: u32) -> Result<Self, Self::Error> {
        match step {
            1 => Ok(Step::UpdateDependencies),
            2 => Ok(Step::CreateBranches),
            3 => Ok(Step::SetupProw),
            4 => Ok(Step::BranchPointers),
            5 => Ok(Step::CommonFiles),
            step => Err(Error::UnknownStep(step)),
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Step::UpdateDependencies => "update dependencies",
            Step::CreateBranches => "create branches",
            Step::SetupProw => "setup prow",
            Step::BranchPointers => "update branch pointers",
            Step::CommonFiles => "update common-files",
        })
    }
}

impl Step {
    fn number(self) -> u32 {
        self as u32
    }

    /// Work branch the step's changes are pushed to.
    pub fn branch_name(self) -> String {
        format!("automatedBranchStep{}", self.number())
    }

    /// Pull request title. Once the release branches exist, titles name the release.
    pub fn title(self, version: &str) -> String {
        let title = format!("Automated branching step {}", self.number());
        if self.number() > 2 {
            format!("[release-{version}] {title}")
        } else {
            title
        }
    }
}

/// Run `step` against resolved sources, then open pull requests for whatever changed.
///
/// With `dry_run` nothing leaves the machine: no pushes and no pull requests.
pub async fn branch(
    manifest: &Manifest,
    step: Step,
    dry_run: bool,
    token: &str,
    cfg: &config::Branch,
) -> Result<(), Error> {
    if !dry_run && token.is_empty() {
        return Err(Error::MissingToken);
    }
    manifest.write(&manifest.out_dir())?;

    info!("Running branch step {} ({step})", step.number());
    run_step(manifest, step, dry_run, token, cfg)
        .await
        .map_err(|source| Error::Step {
            step,
            source: Box::new(source),
        })?;

    let identity = if dry_run {
        None
    } else {
        let user = GitHub::new(token)?.user().await?;
        info!("Committing as {}", user.login);
        Some(user.identity())
    };

    for (repo, dependency) in manifest.dependencies.slots() {
        let Some(dependency) = dependency else {
            info!("Skipping missing dependency {repo}");
            continue;
        };
        info!("Checking {repo} for changes");
        let pr = PullRequest {
            repo,
            dir: manifest.repo_dir(repo),
            remote: dependency.git.as_deref(),
            base: dependency.branch.as_deref().unwrap_or("master"),
            branch: step.branch_name(),
            title: step.title(&manifest.version),
        };
        pr.create(identity.as_ref(), token)
            .map_err(|source| Error::PullRequest {
                repo,
                source: Box::new(source),
            })?;
    }
    info!(
        "Branch step {} for release-{} done in {}",
        step.number(),
        manifest.version,
        manifest.work_dir().display()
    );
    Ok(())
}

async fn run_step(
    manifest: &Manifest,
    step: Step,
    dry_run: bool,
    token: &str,
    cfg: &config::Branch,
) -> Result<(), Error> {
    match step {
        Step::UpdateDependencies => steps::update_dependencies(manifest),
        Step::CreateBranches => {
            steps::create_branches(manifest, dry_run, token, &cfg.skip_branch_creation)
        }
        Step::SetupProw => steps::setup_prow(manifest),
        Step::BranchPointers => {
            steps::bump_tools_branch(manifest)?;
            steps::update_common_files_branch(manifest)?;
            steps::update_codeowners(manifest, &cfg.codeowners_team)?;
            steps::stop_publishing_latest(manifest)?;
            steps::release_builder_branches(manifest)
        }
        Step::CommonFiles => {
            steps::update_common_files_repo(manifest, &cfg.codeowners_team, &cfg.build_tools_tags)
                .await
        }
    }
}

struct PullRequest<'a> {
    repo: Repo,
    dir: PathBuf,
    remote: Option<&'a str>,
    base: &'a str,
    branch: String,
    title: String,
}

impl PullRequest<'_> {
    /// Commit and propose the repository's changes. A clean tree has nothing to propose.
    /// Without an identity the changes are only reported.
    fn create(&self, identity: Option<&(String, String)>, token: &str) -> Result<bool, Error> {
        let git = Git::open(&self.dir).with_token(token);
        let git_err = |source| Error::Git {
            repo: self.repo,
            source,
        };
        let changes = git.status_porcelain().map_err(git_err)?;
        if changes.trim().is_empty() {
            info!("No changes in {}", self.repo);
            return Ok(false);
        }
        info!("Changes found in {}:\n{changes}", self.repo);
        let Some((name, email)) = identity else {
            return Ok(true);
        };

        let remote = self.remote.ok_or(Error::NoRemote(self.repo))?;
        git.checkout_new_branch(&self.branch).map_err(git_err)?;
        git.add_all().map_err(git_err)?;
        git.commit(&self.title, name, email).map_err(git_err)?;
        git.push_upstream(&self.branch).map_err(git_err)?;

        let mut gh = Cmd::new("gh")
            .args(["pr", "create", "--repo", remote, "--fill"])
            .args(["--head", self.branch.as_str(), "--base", self.base])
            .env("GH_TOKEN", token)
            .current_dir(&self.dir);
        if self.repo != Repo::Envoy {
            gh = gh.args(["--label", "release-notes-none"]);
        }
        gh.run()?;
        Ok(true)
    }
}
