//! Drives the external build tooling for every selected output, then assembles the
//! release directory.
use crate::command::{self, Cmd};
use crate::config;
use crate::files;
use crate::manifest::{self, MANIFEST_FILE};
use crate::model::{BuildOutput, Manifest, Repo};
use log::{info, warn};
use thiserror::Error;

pub mod archive;
pub mod debian;
pub mod docker;
pub mod grafana;
pub mod helm;
pub mod sbom;
pub mod scanner;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{output}: {source}")]
    Output {
        output: BuildOutput,
        #[source]
        source: Box<Error>,
    },

    #[error("charts: {0}")]
    Charts(#[from] helm::Error),

    #[error("grafana: {0}")]
    Grafana(#[from] grafana::Error),

    #[error("image scan: {0}")]
    Scanner(#[from] scanner::Error),

    #[error("bundle sources: {0}")]
    Sources(#[source] command::Error),

    #[error("package licenses for {repo}: {source}")]
    Licenses {
        repo: Repo,
        #[source]
        source: command::Error,
    },

    #[error("generate bill of materials: {0}")]
    BillOfMaterials(#[source] command::Error),

    #[error("{path}: {err}")]
    Io {
        path: std::path::PathBuf,
        err: std::io::Error,
    },

    #[error("invalid archive pattern {pattern}: {err}")]
    Pattern { pattern: String, err: regex::Error },

    #[error(transparent)]
    Command(#[from] command::Error),

    #[error(transparent)]
    Files(#[from] files::Error),

    #[error(transparent)]
    Manifest(#[from] manifest::Error),
}

/// Run `make` in a repository's working tree.
///
/// The environment is the ambient one minus output overrides, with the working root
/// and release version forced, plus `extra`.
pub fn make(
    manifest: &Manifest,
    repo: Repo,
    extra: &[(&str, String)],
    targets: &[&str],
) -> Result<(), command::Error> {
    let mut cmd = Cmd::new("make")
        .without_output_overrides()
        .env("GOPATH", manifest.work_dir())
        .env("TAG", &manifest.version)
        .env("VERSION", &manifest.version)
        .current_dir(manifest.repo_dir(repo));
    if let Some(proxy) = &manifest.proxy_override {
        cmd = cmd.env("ISTIO_ENVOY_BASE_URL", proxy);
    }
    for (key, value) in extra {
        cmd = cmd.env(key, value);
    }
    cmd.args(targets).run()
}

/// Build every output the manifest selects and finish the release directory.
///
/// Sources must already be resolved and the manifest standardized.
pub async fn build(manifest: &Manifest, cfg: &config::File) -> Result<(), Error> {
    if manifest.builds(BuildOutput::Scanner) {
        match scanner::scan(manifest, &cfg.scanner).await {
            Ok(()) => {}
            Err(err) if manifest.ignore_vulnerability => {
                warn!("Ignoring vulnerability scanning error: {err}")
            }
            Err(err) => return Err(err.into()),
        }
    }

    let step = |output: BuildOutput, result: Result<(), Error>| {
        result.map_err(|err| Error::Output {
            output,
            source: Box::new(err),
        })
    };

    if manifest.builds(BuildOutput::Docker) {
        step(BuildOutput::Docker, docker::build(manifest, &cfg.docker))?;
    }

    // Helm packages and the archive both ship the stamped charts
    if manifest.builds(BuildOutput::Helm) || manifest.builds(BuildOutput::Archive) {
        helm::sanitize_all_charts(manifest, &cfg.charts)?;
    }

    if manifest.builds(BuildOutput::Helm) {
        step(
            BuildOutput::Helm,
            helm::package(manifest, &cfg.charts).map_err(Error::from),
        )?;
    }
    if manifest.builds(BuildOutput::Debian) {
        step(BuildOutput::Debian, debian::build(manifest, debian::Package::Deb))?;
    }
    if manifest.builds(BuildOutput::Rpm) {
        step(BuildOutput::Rpm, debian::build(manifest, debian::Package::Rpm))?;
    }
    if manifest.builds(BuildOutput::Archive) {
        step(BuildOutput::Archive, archive::build(manifest, &cfg.archive))?;
    }
    if manifest.builds(BuildOutput::Grafana) {
        step(
            BuildOutput::Grafana,
            grafana::build(manifest).map_err(Error::from),
        )?;
    }

    finish(manifest)
}

/// Bundle sources, record the manifest, package licenses and generate SBOMs.
fn finish(manifest: &Manifest) -> Result<(), Error> {
    Cmd::new("tar")
        .args(["-czf", "out/sources.tar.gz", "sources"])
        .current_dir(&manifest.directory)
        .run()
        .map_err(Error::Sources)?;

    manifest.write(&manifest.out_dir())?;
    info!("Wrote {}", manifest.out_dir().join(MANIFEST_FILE).display());

    write_licenses(manifest)?;

    if manifest.skip_generate_bill_of_materials {
        info!("Skipping bill of materials");
    } else {
        sbom::generate(manifest).map_err(Error::BillOfMaterials)?;
    }
    Ok(())
}

fn write_licenses(manifest: &Manifest) -> Result<(), Error> {
    let dir = manifest.out_dir().join("licenses");
    std::fs::create_dir_all(&dir).map_err(|err| Error::Io {
        path: dir.clone(),
        err,
    })?;
    for (repo, _) in manifest.dependencies.present() {
        let src = manifest.repo_dir(repo).join("licenses");
        // Validation reports repos that were expected to carry licenses
        if !src.exists() {
            warn!("Skipping license for {repo}");
            continue;
        }
        Cmd::new("tar")
            .arg("-czf")
            .arg(dir.join(format!("{repo}.tar.gz")))
            .arg(&src)
            .current_dir(&manifest.directory)
            .run()
            .map_err(|source| Error::Licenses { repo, source })?;
    }
    Ok(())
}
