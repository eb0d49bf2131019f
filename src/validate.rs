//! Sanity checks on a built release directory.
use crate::build::{archive, debian::Package};
use crate::command::{self, Cmd};
use crate::config;
use crate::files;
use crate::manifest::{self, MANIFEST_FILE};
use crate::model::{DockerOutput, Manifest, Repo};
use crate::publish::docker::{self, ImageFile};
use log::{debug, error, info};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("read release: {0}")]
    Manifest(#[from] manifest::Error),

    #[error("release validation failed: {failed} of {total} checks failed")]
    Failed { failed: usize, total: usize },
}

/// Why a single check failed.
#[derive(Error, Debug)]
pub enum Problem {
    #[error("missing {}", .0.display())]
    Missing(PathBuf),

    #[error("missing dependency {0}")]
    MissingDependency(Repo),

    #[error("{0} has no pinned commit")]
    Unpinned(Repo),

    #[error("manifest exposes the internal field {0}")]
    InternalField(&'static str),

    #[error("no {0} in release")]
    Empty(&'static str),

    #[error("chart {0} is not packaged at the release version")]
    ChartVersion(String),

    #[error("dashboards out of sync, release contains {release:?}, manifest contains {manifest:?}")]
    Dashboards {
        release: BTreeSet<String>,
        manifest: BTreeSet<String>,
    },

    #[error(transparent)]
    Image(#[from] docker::Error),

    #[error(transparent)]
    Command(#[from] command::Error),

    #[error(transparent)]
    Files(#[from] files::Error),

    #[error("{path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
}

struct Release<'a> {
    dir: &'a Path,
    manifest: Manifest,
    archive: &'a config::Archive,
}

type Check = fn(&Release) -> Result<(), Problem>;

const CHECKS: [(&str, Check); 8] = [
    ("Manifest", check_manifest),
    ("Docker", check_docker),
    ("Helm", check_helm),
    ("Grafana", check_grafana),
    ("Licenses", check_licenses),
    ("Debian", check_debian),
    ("Rpm", check_rpm),
    ("Archives", check_archives),
];

/// Run every check against the release in `dir`. Each check is logged; the release is
/// rejected if any of them fails.
pub fn validate(dir: &Path, cfg: &config::File) -> Result<(), Error> {
    let release = Release {
        dir,
        manifest: Manifest::read_release(dir)?,
        archive: &cfg.archive,
    };
    info!("Validating release {} at {}", release.manifest.version, dir.display());

    let mut failed = 0;
    for (name, check) in CHECKS {
        match check(&release) {
            Ok(()) => info!("Check passed: {name}"),
            Err(err) => {
                error!("Check failed: {name}: {err}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(Error::Failed {
            failed,
            total: CHECKS.len(),
        });
    }
    info!("Release validation passed");
    Ok(())
}

fn require(path: PathBuf) -> Result<PathBuf, Problem> {
    if path.exists() {
        Ok(path)
    } else {
        Err(Problem::Missing(path))
    }
}

/// A file and its checksum.
fn require_with_sha(path: PathBuf) -> Result<(), Problem> {
    require(files::sha_path(&path))?;
    require(path).map(|_| ())
}

fn check_manifest(r: &Release) -> Result<(), Problem> {
    let anchor = r
        .manifest
        .dependencies
        .get(Repo::ANCHOR)
        .ok_or(Problem::MissingDependency(Repo::ANCHOR))?;
    if anchor.sha.is_none() {
        return Err(Problem::Unpinned(Repo::ANCHOR));
    }
    for (repo, dependency) in r.manifest.dependencies.present() {
        if dependency.sha.is_none() {
            return Err(Problem::Unpinned(repo));
        }
    }

    let path = r.dir.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|err| Problem::Io { path, err })?;
    for field in ["directory", "proxyOverride", "outputs"] {
        if raw.lines().any(|line| line.starts_with(&format!("{field}:"))) {
            return Err(Problem::InternalField(field));
        }
    }
    Ok(())
}

fn check_docker(r: &Release) -> Result<(), Problem> {
    if r.manifest.docker_output == DockerOutput::Context {
        debug!("Images were loaded into the docker daemon, none to check");
        return Ok(());
    }
    let names = files::read_dir_names(&require(r.dir.join("docker"))?)?;
    if names.is_empty() {
        return Err(Problem::Empty("docker images"));
    }
    for name in names {
        ImageFile::parse(&name)?;
    }
    Ok(())
}

fn check_helm(r: &Release) -> Result<(), Problem> {
    let charts: Vec<String> = files::read_dir_names(&require(r.dir.join("helm"))?)?
        .into_iter()
        .filter(|name| name.ends_with(".tgz"))
        .collect();
    if charts.is_empty() {
        return Err(Problem::Empty("helm charts"));
    }
    let suffix = format!("-{}.tgz", r.manifest.version);
    match charts.into_iter().find(|chart| !chart.ends_with(&suffix)) {
        Some(chart) => Err(Problem::ChartVersion(chart)),
        None => Ok(()),
    }
}

fn check_grafana(r: &Release) -> Result<(), Problem> {
    let release = files::read_dir_names(&require(r.dir.join("grafana"))?)?
        .into_iter()
        .filter_map(|name| name.strip_suffix(".json").map(str::to_string))
        .collect::<BTreeSet<_>>();
    let manifest = r
        .manifest
        .grafana_dashboards
        .keys()
        .cloned()
        .collect::<BTreeSet<_>>();
    if release != manifest {
        return Err(Problem::Dashboards { release, manifest });
    }
    Ok(())
}

fn check_licenses(r: &Release) -> Result<(), Problem> {
    let dir = require(r.dir.join("licenses"))?;
    require(dir.join(format!("{}.tar.gz", Repo::ANCHOR))).map(|_| ())
}

fn check_packages(r: &Release, package: Package) -> Result<(), Problem> {
    let dir = r.dir.join(package.extension());
    for arch in r.manifest.arch_names() {
        require_with_sha(dir.join(package.file_name(&arch)))?;
    }
    Ok(())
}

fn check_debian(r: &Release) -> Result<(), Problem> {
    check_packages(r, Package::Deb)
}

fn check_rpm(r: &Release) -> Result<(), Problem> {
    check_packages(r, Package::Rpm)
}

/// Every platform archive exists with its checksum, and tarballs hold the expected files.
fn check_archives(r: &Release) -> Result<(), Problem> {
    let root = format!("istio-{}", r.manifest.version);
    for platform in &r.archive.platforms {
        let name = archive::archive_name(&r.manifest.version, platform);
        let path = r.dir.join(&name);
        require_with_sha(path.clone())?;
        if !name.ends_with(".tar.gz") {
            continue;
        }

        let listing = Cmd::new("tar").arg("-tzf").arg(&path).output()?;
        let entries: BTreeSet<PathBuf> = listing
            .lines()
            .map(|line| PathBuf::from(line.trim_end_matches('/')))
            .collect();
        for expected in archive::expected_contents(platform) {
            let expected = Path::new(&root).join(expected);
            if !entries.contains(&expected) {
                return Err(Problem::Missing(path.join(expected)));
            }
        }
    }
    Ok(())
}
