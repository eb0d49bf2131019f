use crate::files;
use crate::git::{self, Git};
use crate::model::{AutoStrategy, Dependency, IstioDep, Manifest, Repo};
use log::info;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Hashes in the pinned dependency list are shortened to the length go pseudo-versions use.
const SHORT_SHA_LEN: usize = 12;

static ENVOY_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"ENVOY_SHA = "([a-z0-9]{40})""#).unwrap());

#[derive(Error, Debug)]
pub enum Error {
    #[error("set up working directory {path}: {err}")]
    WorkDir { path: PathBuf, err: std::io::Error },

    #[error("resolve {repo} ({dependency}): {source}")]
    Resolve {
        repo: Repo,
        dependency: String,
        #[source]
        source: Box<Error>,
    },

    #[error("tag {repo}: {source}")]
    Tag {
        repo: Repo,
        #[source]
        source: Box<Error>,
    },

    #[error("tag {tag} already exists, retagging would move from {existing} to {head}")]
    TagConflict {
        tag: String,
        existing: String,
        head: String,
    },

    #[error("{0} has no git source")]
    NoGit(Repo),

    #[error("failed to automatically resolve source for {repo} using {strategy}")]
    AutoUnresolved { repo: Repo, strategy: AutoStrategy },

    #[error("read {path}: {err}")]
    ReadPin { path: PathBuf, err: std::io::Error },

    #[error("parse {path}: {err}")]
    ParseDeps {
        path: PathBuf,
        err: serde_json::Error,
    },

    #[error(transparent)]
    Git(#[from] git::Error),

    #[error(transparent)]
    Files(#[from] files::Error),
}

/// Create `sources/`, `work/` and `out/` under the base directory.
///
/// `sources/` holds pristine checkouts, `work/` a copy build steps may modify, and
/// `out/` the final artifacts.
pub fn setup_work_dir(dir: &Path) -> Result<(), Error> {
    for sub in ["sources", "work", "out"] {
        let path = dir.join(sub);
        std::fs::create_dir_all(&path).map_err(|err| Error::WorkDir { path, err })?;
    }
    Ok(())
}

/// Fetch every dependency, copy it into the working tree and tag it with the release version.
pub fn resolve_sources(manifest: &Manifest) -> Result<(), Error> {
    for (repo, dep) in manifest.dependencies.slots() {
        let Some(dep) = dep else {
            info!("Skipping {repo}: not part of this release");
            continue;
        };
        let src = manifest.repo_source_dir(repo);
        acquire(manifest, repo, dep, &src).map_err(|err| Error::Resolve {
            repo,
            dependency: format!("{dep:?}"),
            source: Box::new(err),
        })?;
        info!("Resolved {repo}");

        let work = manifest.repo_dir(repo);
        files::copy_dir(&src, &work)?;

        // The build reads version information from the tag
        tag_repo(&work, &manifest.version).map_err(|err| Error::Tag {
            repo,
            source: Box::new(err),
        })?;
    }
    Ok(())
}

fn acquire(manifest: &Manifest, repo: Repo, dep: &Dependency, dest: &Path) -> Result<(), Error> {
    if let Some(local) = &dep.local_path {
        return Ok(files::copy_dir(local, dest)?);
    }

    let mut dep = dep.clone();
    if let Some(strategy) = dep.auto {
        let sha = resolve_auto(manifest, repo, strategy)?;
        info!("Resolved {repo} to {sha} using {strategy}");
        dep.sha = Some(sha);
    }

    let url = dep.git.as_deref().ok_or(Error::NoGit(repo))?;
    // A named branch only needs its tip
    let checkout = Git::clone(url, dest, dep.branch.as_deref())?;
    if let Some(reference) = dep.git_ref() {
        checkout.checkout(reference)?;
    }
    Ok(())
}

/// Find the commit an `auto` dependency should use by reading version pins out of
/// repositories that are already resolved.
pub fn resolve_auto(manifest: &Manifest, repo: Repo, strategy: AutoStrategy) -> Result<String, Error> {
    let unresolved = || Error::AutoUnresolved { repo, strategy };
    match strategy {
        AutoStrategy::Deps => {
            let deps = read_istio_deps(&manifest.repo_source_dir(Repo::ANCHOR))?;
            deps.into_iter()
                .filter(|d| d.repo_name == repo.name() && !d.last_stable_sha.is_empty())
                .last()
                .map(|d| d.last_stable_sha)
                .ok_or_else(unresolved)
        }
        AutoStrategy::Modules => {
            let go_mod = read_pin(&manifest.repo_source_dir(Repo::ANCHOR).join("go.mod"))?;
            let module = format!("istio.io/{}", repo.name());
            go_mod_requires(&go_mod)
                .into_iter()
                .find(|(path, _)| *path == module)
                .map(|(_, version)| module_commit(&version).to_string())
                .ok_or_else(unresolved)
        }
        AutoStrategy::ProxyWorkspace => {
            let workspace = read_pin(&manifest.repo_source_dir(Repo::Proxy).join("WORKSPACE"))?;
            ENVOY_SHA
                .captures(&workspace)
                .map(|c| c[1].to_string())
                .ok_or_else(unresolved)
        }
    }
}

/// Tag HEAD of `dir` as `tag`. An existing tag at HEAD is accepted; an existing tag
/// anywhere else is a conflict and is left untouched.
pub fn tag_repo(dir: &Path, tag: &str) -> Result<(), Error> {
    let repo = Git::open(dir);
    let head = repo.head()?;
    match repo.rev_parse(tag)? {
        Some(existing) if existing == head => {
            info!("Tag {tag} already exists, but points to the right place.");
            Ok(())
        }
        Some(existing) => Err(Error::TagConflict {
            tag: tag.to_string(),
            existing,
            head,
        }),
        None => Ok(repo.tag(tag)?),
    }
}

/// Pin every dependency to the commit its working tree is at, then record transitive
/// dependency versions.
pub fn standardize_manifest(manifest: &mut Manifest) -> Result<(), Error> {
    let present: Vec<(Repo, Dependency)> = manifest
        .dependencies
        .present()
        .map(|(repo, dep)| (repo, dep.clone()))
        .collect();
    for (repo, dep) in present {
        let sha = Git::open(&manifest.repo_dir(repo)).head()?;
        manifest.dependencies.set(
            repo,
            Dependency {
                git: dep.git,
                sha: Some(sha),
                go_version_enabled: dep.go_version_enabled,
                ..Default::default()
            },
        );
    }
    fetch_transitive_dependencies(manifest)
}

fn fetch_transitive_dependencies(manifest: &mut Manifest) -> Result<(), Error> {
    let mut all = std::mem::take(&mut manifest.all_dependencies);
    for (repo, dep) in manifest.dependencies.present() {
        if let Some(sha) = &dep.sha {
            all.insert(repo.name().to_string(), short_sha(sha));
        }
    }

    let anchor = manifest.repo_dir(Repo::ANCHOR);
    for (path, version) in go_mod_requires(&read_pin(&anchor.join("go.mod"))?) {
        let Some(name) = path.strip_prefix("istio.io/") else {
            continue;
        };
        let name = name.split('/').next().unwrap_or(name).to_string();
        all.entry(name)
            .or_insert_with(|| module_commit(&version).to_string());
    }

    for dep in read_istio_deps(&anchor)? {
        if dep.repo_name.is_empty() {
            continue;
        }
        all.entry(dep.repo_name)
            .or_insert_with(|| short_sha(&dep.last_stable_sha));
    }

    manifest.all_dependencies = all;
    Ok(())
}

fn short_sha(sha: &str) -> String {
    sha.chars().take(SHORT_SHA_LEN).collect()
}

fn read_pin(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| Error::ReadPin {
        path: path.to_path_buf(),
        err,
    })
}

fn read_istio_deps(anchor: &Path) -> Result<Vec<IstioDep>, Error> {
    let path = anchor.join("istio.deps");
    let contents = read_pin(&path)?;
    serde_json::from_str(&contents).map_err(|err| Error::ParseDeps { path, err })
}

/// `(module path, version)` pairs from the `require` directives of a go.mod file.
pub fn go_mod_requires(go_mod: &str) -> Vec<(String, String)> {
    let mut requires = Vec::new();
    let mut in_block = false;
    for line in go_mod.lines() {
        let line = match line.find("//") {
            Some(i) => &line[..i],
            None => line,
        }
        .trim();
        if in_block {
            if line == ")" {
                in_block = false;
            } else if let Some(require) = parse_require(line) {
                requires.push(require);
            }
        } else if let Some(rest) = line.strip_prefix("require") {
            let rest = rest.trim();
            if rest == "(" {
                in_block = true;
            } else if let Some(require) = parse_require(rest) {
                requires.push(require);
            }
        }
    }
    requires
}

fn parse_require(line: &str) -> Option<(String, String)> {
    let mut fields = line.split_whitespace();
    let path = fields.next()?;
    let version = fields.next()?;
    Some((path.to_string(), version.to_string()))
}

/// The commit hash of a pseudo-version such as `v0.0.0-20240101000000-abcdef123456`;
/// any other version is returned as is.
pub fn module_commit(version: &str) -> &str {
    let parts: Vec<&str> = version.split('-').collect();
    if parts.len() == 3 {
        parts[2]
    } else {
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::{commit_file, git, init_repo};
    use crate::model::Dependencies;

    const GO_MOD: &str = r#"module istio.io/istio

go 1.23

require (
	github.com/cheggaaa/pb/v3 v3.1.5
	istio.io/api v1.24.0-alpha.0.0.20241015192034-63f29ae02d35
	istio.io/client-go v1.24.0-alpha.0.0.20241015192547-a7f0bc0e7ac7 // indirect
)

require istio.io/proxy v0.0.0-20241010-0123456789ab
"#;

    const ISTIO_DEPS: &str = r#"[
  {
    "_comment": "",
    "name": "PROXY_REPO_SHA",
    "repoName": "proxy",
    "file": "",
    "lastStableSHA": "e0d5bdb1a3f3ab1d0d9c2b4d2a2f3b19e51ff47c"
  },
  {
    "_comment": "",
    "name": "ZTUNNEL_REPO_SHA",
    "repoName": "ztunnel",
    "file": "",
    "lastStableSHA": "2b9a0f1c4ab3e3d0de61c8d0c98d3b1b6d9e5a11"
  }
]"#;

    fn manifest_in(dir: &Path) -> Manifest {
        Manifest {
            version: "1.2.3".into(),
            directory: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn write_anchor_pins(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("go.mod"), GO_MOD).unwrap();
        std::fs::write(dir.join("istio.deps"), ISTIO_DEPS).unwrap();
    }

    #[test]
    fn parses_go_mod_requires() {
        let requires = go_mod_requires(GO_MOD);
        assert_eq!(requires.len(), 4);
        assert_eq!(
            requires[3],
            ("istio.io/proxy".to_string(), "v0.0.0-20241010-0123456789ab".to_string())
        );
    }

    #[test]
    fn pseudo_versions_unwrap_to_commit() {
        assert_eq!(
            module_commit("v1.24.0-alpha.0.0.20241015192034-63f29ae02d35"),
            "63f29ae02d35"
        );
        assert_eq!(module_commit("v0.0.0-20241010-0123456789ab"), "0123456789ab");
        assert_eq!(module_commit("v1.2.3"), "v1.2.3");
    }

    #[test]
    fn auto_resolution_strategies() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(dir.path());
        write_anchor_pins(&manifest.repo_source_dir(Repo::Istio));
        let proxy = manifest.repo_source_dir(Repo::Proxy);
        std::fs::create_dir_all(&proxy).unwrap();
        std::fs::write(
            proxy.join("WORKSPACE"),
            "ENVOY_SHA = \"0123456789abcdef0123456789abcdef01234567\"\n",
        )
        .unwrap();

        assert_eq!(
            resolve_auto(&manifest, Repo::Proxy, AutoStrategy::Modules).unwrap(),
            "0123456789ab"
        );
        assert_eq!(
            resolve_auto(&manifest, Repo::Ztunnel, AutoStrategy::Deps).unwrap(),
            "2b9a0f1c4ab3e3d0de61c8d0c98d3b1b6d9e5a11"
        );
        assert_eq!(
            resolve_auto(&manifest, Repo::Envoy, AutoStrategy::ProxyWorkspace).unwrap(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert!(matches!(
            resolve_auto(&manifest, Repo::Tools, AutoStrategy::Deps),
            Err(Error::AutoUnresolved { repo: Repo::Tools, .. })
        ));
    }

    #[test]
    fn tagging_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        tag_repo(dir.path(), "1.2.3").unwrap();
        tag_repo(dir.path(), "1.2.3").unwrap();
        assert_eq!(git(dir.path(), &["tag", "--list"]), "1.2.3");
        assert_eq!(
            git(dir.path(), &["rev-parse", "1.2.3^{commit}"]),
            git(dir.path(), &["rev-parse", "HEAD"])
        );
    }

    #[test]
    fn tag_conflict_leaves_tag_in_place() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let first = git(dir.path(), &["rev-parse", "HEAD"]);
        git(dir.path(), &["tag", "v1.2.3"]);
        let second = commit_file(dir.path(), "next", "b\n");

        let err = tag_repo(dir.path(), "v1.2.3").unwrap_err();
        match err {
            Error::TagConflict { existing, head, .. } => {
                assert_eq!(existing, first);
                assert_eq!(head, second);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(git(dir.path(), &["rev-parse", "v1.2.3^{commit}"]), first);
    }

    #[test]
    fn optional_slots_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("istio-checkout");
        init_repo(&local);
        write_anchor_pins(&local);
        git(&local, &["add", "."]);
        git(&local, &["commit", "-m", "pins"]);
        let head = git(&local, &["rev-parse", "HEAD"]);

        let release = dir.path().join("release");
        let mut manifest = manifest_in(&release);
        manifest.dependencies = Dependencies::from_iter([(
            Repo::Istio,
            Dependency {
                local_path: Some(local.clone()),
                ..Default::default()
            },
        )]);
        setup_work_dir(&release).unwrap();
        resolve_sources(&manifest).unwrap();
        assert_eq!(
            git(&manifest.repo_dir(Repo::Istio), &["rev-parse", "1.2.3^{commit}"]),
            head
        );

        standardize_manifest(&mut manifest).unwrap();
        assert_eq!(
            manifest.dependencies.get(Repo::Istio).unwrap().sha.as_deref(),
            Some(head.as_str())
        );
        assert!(manifest.dependencies.get(Repo::Api).is_none());
        let yaml = serde_yaml::to_string(&manifest.dependencies).unwrap();
        assert!(!yaml.contains("api"));
    }

    #[test]
    fn transitive_dependencies_first_seen_wins() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("istio-checkout");
        init_repo(&local);
        write_anchor_pins(&local);
        git(&local, &["add", "."]);
        git(&local, &["commit", "-m", "pins"]);
        let head = git(&local, &["rev-parse", "HEAD"]);

        let mut manifest = manifest_in(&dir.path().join("release"));
        files::copy_dir(&local, &manifest.repo_dir(Repo::Istio)).unwrap();
        manifest.dependencies = Dependencies::from_iter([(
            Repo::Istio,
            Dependency {
                branch: Some("main".into()),
                git: Some("https://github.com/istio/istio".into()),
                ..Default::default()
            },
        )]);
        standardize_manifest(&mut manifest).unwrap();

        let all = &manifest.all_dependencies;
        assert_eq!(all["istio"], &head[..12]);
        // go.mod is read before istio.deps
        assert_eq!(all["proxy"], "0123456789ab");
        assert_eq!(all["ztunnel"], "2b9a0f1c4ab3");
        assert_eq!(all["client-go"], "a7f0bc0e7ac7");
        assert_eq!(all["api"], "63f29ae02d35");
        assert!(!all.contains_key("cheggaaa"));
        assert_eq!(manifest.dependencies.get(Repo::Istio).unwrap().branch, None);
    }

    #[test]
    fn resolution_errors_name_the_repo() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = manifest_in(dir.path());
        manifest.dependencies = Dependencies::from_iter([(
            Repo::Api,
            Dependency {
                git: Some(dir.path().join("missing").display().to_string()),
                branch: Some("master".into()),
                ..Default::default()
            },
        )]);
        setup_work_dir(dir.path()).unwrap();
        let err = resolve_sources(&manifest).unwrap_err();
        assert!(matches!(err, Error::Resolve { repo: Repo::Api, .. }));
        assert!(err.to_string().starts_with("resolve api"));
    }
}
