//! The repository edits made by each branch-cut step.
use super::Error;
use crate::build::make;
use crate::command::Cmd;
use crate::git::Git;
use crate::makevar;
use crate::model::{Manifest, Repo};
use log::{info, warn};
use regex::{NoExpand, Regex};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

static BRANCH_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\bBRANCH=.*$").unwrap());
static UPDATE_BRANCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)UPDATE_BRANCH \?=.*$").unwrap());
static IMAGE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)IMAGE_VERSION=.*$").unwrap());

/// Repositories that do not share the common-files Makefile.
const NO_COMMON_FILES: [Repo; 4] = [
    Repo::CommonFiles,
    Repo::Envoy,
    Repo::TestInfra,
    Repo::Enhancements,
];

const RELEASE_BUILDER_FILES: [&str; 4] = [
    "example/manifest.yaml",
    "release/build.sh",
    "test/publish.sh",
    "release/build-base-images.sh",
];

fn edit(path: &Path, f: impl FnOnce(&str) -> String) -> Result<(), Error> {
    let io = |err| Error::Io {
        path: path.to_path_buf(),
        err,
    };
    let contents = std::fs::read_to_string(path).map_err(io)?;
    std::fs::write(path, f(&contents)).map_err(io)
}

fn replace(path: &Path, re: &Regex, replacement: &str) -> Result<(), Error> {
    edit(path, |contents| {
        re.replace_all(contents, NoExpand(replacement)).into_owned()
    })
}

fn codeowners(team_prefix: &str, release: &str) -> String {
    format!("* {team_prefix}{}\n", release.replace('.', "-"))
}

fn write_codeowners(dir: &Path, team_prefix: &str, release: &str) -> Result<(), Error> {
    let path = dir.join("CODEOWNERS");
    std::fs::write(&path, codeowners(team_prefix, release)).map_err(|err| Error::Io { path, err })
}

fn update_branch_line(release: &str) -> String {
    format!("UPDATE_BRANCH ?= \"release-{release}\"")
}

/// Refresh the anchor repository's dependencies on master before branching.
pub fn update_dependencies(manifest: &Manifest) -> Result<(), Error> {
    info!("Updating {} dependencies on master", Repo::ANCHOR);
    let dir = manifest.repo_dir(Repo::ANCHOR);
    Cmd::new("./bin/update_deps.sh")
        .env("UPDATE_BRANCH", "master")
        .current_dir(&dir)
        .run()?;

    let version = makevar::read_variable(&dir.join("Makefile.core.mk"), "VERSION")?;
    make(manifest, Repo::ANCHOR, &[("VERSION", version)], &["gen"])?;

    Git::open(&dir)
        .restore("common")
        .map_err(|source| Error::Git {
            repo: Repo::ANCHOR,
            source,
        })?;
    info!("{} dependencies updated", Repo::ANCHOR);
    Ok(())
}

/// Create `release-<version>` in every repository not excluded from branching.
pub fn create_branches(
    manifest: &Manifest,
    dry_run: bool,
    token: &str,
    skip: &[Repo],
) -> Result<(), Error> {
    let branch = format!("release-{}", manifest.version);
    info!("Creating release branches {branch}");
    for (repo, _) in manifest.dependencies.present() {
        if skip.contains(&repo) {
            info!("Skipping repo {repo}");
            continue;
        }
        let git = Git::open(&manifest.repo_dir(repo)).with_token(token);
        match git.remote_branch_exists(&branch) {
            Ok(true) => warn!(
                "Branch {branch} already exists in {repo}, verify it and delete it if needed"
            ),
            Ok(false) => {}
            Err(err) => warn!("Could not check for {branch} in {repo}: {err}"),
        }

        info!("Creating {branch} for {repo} in {}", git.dir().display());
        git.checkout_new_branch(&branch)
            .map_err(|source| Error::Git { repo, source })?;
        if !dry_run {
            if let Err(err) = git.push_upstream(&branch) {
                warn!("Push of {branch} to {repo} failed, it may already exist: {err}");
            }
        }
    }
    Ok(())
}

/// Generate CI job configuration for the new release branch.
pub fn setup_prow(manifest: &Manifest) -> Result<(), Error> {
    info!("Updating prow config for the new branches");
    let dir = manifest.repo_dir(Repo::TestInfra);
    let input = dir.join("prow/config/jobs");
    let output = dir.join("prow/cluster/jobs");
    let private = dir.join("prow/config/istio-private_jobs");
    let release = manifest.version.as_str();

    Cmd::new("go")
        .args(["run", "./cmd/prowgen/main.go", "--skip-gar-tagging"])
        .arg(format!("--input-dir={}", input.display()))
        .args(["branch", release])
        .current_dir(dir.join("tools/prowgen"))
        .run()?;
    Cmd::new("go")
        .args(["run", "./cmd/prowgen/main.go"])
        .arg(format!("--input-dir={}", input.display()))
        .arg(format!("--output-dir={}", output.display()))
        .arg("write")
        .current_dir(dir.join("tools/prowgen"))
        .run()?;
    Cmd::new("go")
        .args(["run", "main.go"])
        .arg(format!("--input-dir={}", private.display()))
        .args(["branch", release])
        .current_dir(dir.join("tools/generate-transform-jobs"))
        .run()?;
    Ok(())
}

/// Point the build-tools image build at the release branch.
pub fn bump_tools_branch(manifest: &Manifest) -> Result<(), Error> {
    info!("Updating the build-tools image branch");
    let path = manifest
        .repo_dir(Repo::Tools)
        .join("docker/build-tools/build-and-push.sh");
    replace(
        &path,
        &BRANCH_ASSIGNMENT,
        &format!("BRANCH=release-{}", manifest.version),
    )
}

/// Make every repository pull common files from the release branch.
pub fn update_common_files_branch(manifest: &Manifest) -> Result<(), Error> {
    info!("Updating common-files UPDATE_BRANCH");
    let line = update_branch_line(&manifest.version);
    for (repo, _) in manifest.dependencies.present() {
        if NO_COMMON_FILES.contains(&repo) {
            info!("Skipping repo {repo}");
            continue;
        }
        let path = manifest.repo_dir(repo).join("common/Makefile.common.mk");
        replace(&path, &UPDATE_BRANCH, &line)?;
    }
    Ok(())
}

/// Hand ownership of every release branch to the release managers.
pub fn update_codeowners(manifest: &Manifest, team_prefix: &str) -> Result<(), Error> {
    info!("Updating CODEOWNERS");
    for (repo, _) in manifest.dependencies.present() {
        if repo == Repo::TestInfra {
            info!("Skipping repo {repo}");
            continue;
        }
        write_codeowners(&manifest.repo_dir(repo), team_prefix, &manifest.version)?;
    }
    Ok(())
}

/// Stop the release branch from publishing the floating `latest` artifacts.
pub fn stop_publishing_latest(manifest: &Manifest) -> Result<(), Error> {
    info!("Dropping latest from the published artifacts");
    let path = manifest
        .repo_dir(Repo::ANCHOR)
        .join("prow/release-commit.sh");
    edit(&path, |contents| contents.replace("-dev,latest", "-dev"))
}

/// Point release-builder's `branch: master` references at the release branch, except
/// next to test-infra, which is never branched.
pub fn release_builder_branches(manifest: &Manifest) -> Result<(), Error> {
    info!("Updating release-builder to use release-{}", manifest.version);
    let dir = manifest.repo_dir(Repo::ReleaseBuilder);
    let branch = format!("release-{}", manifest.version);
    for file in RELEASE_BUILDER_FILES {
        edit(&dir.join(file), |contents| {
            retarget_branches(contents, &branch)
        })?;
    }
    Ok(())
}

fn retarget_branches(contents: &str, branch: &str) -> String {
    const MASTER: &str = "branch: master";
    let mut previous: Option<&str> = None;
    let mut out = String::with_capacity(contents.len());
    for line in contents.split_inclusive('\n') {
        let near_test_infra =
            line.contains("test-infra") || previous.is_some_and(|p| p.contains("test-infra"));
        match line.rfind(MASTER) {
            Some(at) if previous.is_some() && !near_test_infra => {
                out.push_str(&line[..at]);
                out.push_str("branch: ");
                out.push_str(branch);
                out.push_str(&line[at + MASTER.len()..]);
            }
            _ => out.push_str(line),
        }
        previous = Some(line);
    }
    out
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    manifest: BTreeMap<String, ImageTags>,
}

#[derive(Deserialize)]
struct ImageTags {
    #[serde(default)]
    tag: Vec<String>,
}

/// Newest multi-arch build-tools tag cut from the release branch.
fn newest_build_tools_tag(tags: &TagList, release: &str) -> Option<String> {
    let branch = format!("release-{release}");
    tags.manifest
        .values()
        .flat_map(|image| image.tag.iter())
        .filter(|tag| {
            tag.contains(&branch)
                && !tag.contains("latest")
                && !tag.contains("amd64")
                && !tag.contains("arm64")
        })
        .max()
        .cloned()
}

/// Prepare the common-files repository for the release: branch, build image, owners.
pub async fn update_common_files_repo(
    manifest: &Manifest,
    team_prefix: &str,
    tags_url: &str,
) -> Result<(), Error> {
    let dir = manifest.repo_dir(Repo::CommonFiles);
    info!("Updating common-files in {}", dir.display());
    replace(
        &dir.join("files/common/Makefile.common.mk"),
        &UPDATE_BRANCH,
        &update_branch_line(&manifest.version),
    )?;

    let tags: TagList = reqwest::get(tags_url)
        .await
        .map_err(Error::Request)?
        .error_for_status()
        .map_err(Error::Request)?
        .json()
        .await
        .map_err(Error::Request)?;
    let tag = newest_build_tools_tag(&tags, &manifest.version).ok_or_else(|| {
        Error::NoBuildToolsTag {
            release: manifest.version.clone(),
        }
    })?;
    info!("Using build-tools image {tag}");
    replace(
        &dir.join("files/common/scripts/setup_env.sh"),
        &IMAGE_VERSION,
        &format!("IMAGE_VERSION={tag}"),
    )?;

    write_codeowners(&dir, team_prefix, &manifest.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dependency;

    fn manifest(dir: &Path, repos: &[Repo]) -> Manifest {
        let mut manifest = Manifest {
            version: "1.24".into(),
            directory: dir.to_path_buf(),
            ..Default::default()
        };
        for repo in repos {
            manifest.dependencies.set(*repo, Dependency::default());
            std::fs::create_dir_all(manifest.repo_dir(*repo)).unwrap();
        }
        manifest
    }

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn release_branches_are_pushed_with_the_token() {
        use crate::git::testing::{git, init_repo};

        let dir = tempfile::tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        init_repo(&upstream);
        let mut manifest = manifest(dir.path(), &[]);
        Git::clone(
            upstream.to_str().unwrap(),
            &manifest.repo_dir(Repo::Api),
            None,
        )
        .unwrap();
        manifest.dependencies.set(Repo::Api, Dependency::default());

        create_branches(&manifest, false, "ghp_secret", &[Repo::TestInfra]).unwrap();
        assert_eq!(
            git(&upstream, &["rev-parse", "release-1.24"]),
            git(&upstream, &["rev-parse", "main"])
        );
    }

    #[test]
    fn tools_branch_leaves_other_branch_variables() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest(dir.path(), &[Repo::Tools]);
        let script = manifest
            .repo_dir(Repo::Tools)
            .join("docker/build-tools/build-and-push.sh");
        write(&script, "UPDATE_BRANCH=master\nBRANCH=master\nexport BRANCH=master\n");

        bump_tools_branch(&manifest).unwrap();
        assert_eq!(
            read(&script),
            "UPDATE_BRANCH=master\nBRANCH=release-1.24\nexport BRANCH=release-1.24\n"
        );
    }

    #[test]
    fn common_files_branch_skips_repos_without_common_files() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest(dir.path(), &[Repo::Istio, Repo::Api, Repo::Envoy]);
        for repo in [Repo::Istio, Repo::Api] {
            write(
                &manifest.repo_dir(repo).join("common/Makefile.common.mk"),
                "FOO = 1\nUPDATE_BRANCH ?= \"master\"\n",
            );
        }

        update_common_files_branch(&manifest).unwrap();
        assert_eq!(
            read(&manifest.repo_dir(Repo::Api).join("common/Makefile.common.mk")),
            "FOO = 1\nUPDATE_BRANCH ?= \"release-1.24\"\n"
        );
        assert!(!manifest
            .repo_dir(Repo::Envoy)
            .join("common/Makefile.common.mk")
            .exists());
    }

    #[test]
    fn codeowners_name_the_release_managers() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest(dir.path(), &[Repo::Istio, Repo::TestInfra]);
        update_codeowners(&manifest, "@istio/release-managers-").unwrap();
        assert_eq!(
            read(&manifest.repo_dir(Repo::Istio).join("CODEOWNERS")),
            "* @istio/release-managers-1-24\n"
        );
        assert!(!manifest.repo_dir(Repo::TestInfra).join("CODEOWNERS").exists());
    }

    #[test]
    fn latest_is_no_longer_published() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest(dir.path(), &[Repo::Istio]);
        let script = manifest.repo_dir(Repo::Istio).join("prow/release-commit.sh");
        write(&script, "DOCKER_TAGS=${VERSION}-dev,latest\n");
        stop_publishing_latest(&manifest).unwrap();
        assert_eq!(read(&script), "DOCKER_TAGS=${VERSION}-dev\n");
    }

    #[test]
    fn release_builder_keeps_test_infra_on_master() {
        let input = "\
dependencies:
  istio:
    git: https://github.com/istio/istio
    branch: master
  test-infra:
    branch: master
  api:
    git: https://github.com/istio/api
    branch: master
";
        let expected = "\
dependencies:
  istio:
    git: https://github.com/istio/istio
    branch: release-1.24
  test-infra:
    branch: master
  api:
    git: https://github.com/istio/api
    branch: release-1.24
";
        assert_eq!(retarget_branches(input, "release-1.24"), expected);
        assert_eq!(
            retarget_branches("branch: master\n", "release-1.24"),
            "branch: master\n"
        );
    }

    #[test]
    fn newest_release_build_tools_tag() {
        let tags: TagList = serde_json::from_str(
            r#"{"manifest": {
                "sha256:a": {"tag": ["release-1.24-2024-10-01T00-00-00"]},
                "sha256:b": {"tag": ["release-1.24-2024-11-02T00-00-00", "release-1.24-latest"]},
                "sha256:c": {"tag": ["release-1.24-2024-12-03T00-00-00-amd64"]},
                "sha256:d": {"tag": ["master-2025-01-01T00-00-00"]}
            }}"#,
        )
        .unwrap();
        assert_eq!(
            newest_build_tools_tag(&tags, "1.24").as_deref(),
            Some("release-1.24-2024-11-02T00-00-00")
        );
        assert_eq!(newest_build_tools_tag(&tags, "1.25"), None);
    }
}
