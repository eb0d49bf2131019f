use crate::model::{BuildOutput, Dependencies, DockerOutput, Manifest, Repo};
use chrono::Local;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use Error::*;

pub const MANIFEST_FILE: &str = "manifest.yaml";

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: PathBuf },

    #[error("write {path}: {err}")]
    WriteFile { err: std::io::Error, path: PathBuf },

    #[error("parse {path}: {err}")]
    Parse { err: serde_yaml::Error, path: PathBuf },

    #[error("serialize manifest: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error(transparent)]
    UnknownOutput(#[from] crate::model::UnknownBuildOutput),

    #[error("{0} has branch/sha/auto selected without git source")]
    MissingGit(Repo),

    #[error("{0} must select exactly one of branch, sha, localpath or auto")]
    RefSelector(Repo),

    #[error("create working directory: {0}")]
    WorkDir(std::io::Error),
}

/// The user facing release description.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct InputManifest {
    #[serde(default)]
    pub dependencies: Dependencies,
    pub version: String,
    #[serde(default)]
    pub docker: String,
    #[serde(default)]
    pub docker_output: Option<DockerOutput>,
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Base working directory. A fresh temporary directory is used when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub proxy_override: Option<String>,
    /// Outputs to build; all of them when unset or empty.
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
    #[serde(default)]
    pub dashboards: BTreeMap<String, u32>,
    #[serde(default)]
    pub skip_generate_bill_of_materials: bool,
    #[serde(default, rename = "billOfMaterialsURI")]
    pub bill_of_materials_uri: Option<String>,
    #[serde(default)]
    pub ignore_vulnerability: bool,
}

impl InputManifest {
    pub fn parse(yaml: &str, path: &Path) -> Result<Self, Error> {
        let manifest: Self = serde_yaml::from_str(yaml).map_err(|err| Parse {
            err,
            path: path.to_path_buf(),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and validate an input manifest file.
    pub fn read(path: &Path) -> Result<Self, Error> {
        Self::parse(&read_file(path)?, path)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (repo, dep) in self.dependencies.slots() {
            let Some(dep) = dep else {
                // Many slots are optional repositories that are only tagged
                warn!("missing dependency: {repo}");
                continue;
            };
            if (dep.branch.is_some() || dep.sha.is_some() || dep.auto.is_some()) && dep.git.is_none() {
                return Err(MissingGit(repo));
            }
            if dep.selectors() != 1 {
                return Err(RefSelector(repo));
            }
        }
        Ok(())
    }
}

impl Manifest {
    /// Derive a release manifest from user input, applying defaults.
    ///
    /// Creates a temporary working directory if none was given.
    pub fn from_input(input: InputManifest) -> Result<Self, Error> {
        let build_outputs = match &input.outputs {
            Some(outputs) if !outputs.is_empty() => outputs
                .iter()
                .map(|o| o.parse::<BuildOutput>())
                .collect::<Result<BTreeSet<_>, _>>()?,
            _ => BuildOutput::ALL.into_iter().collect(),
        };

        let directory = match input.directory {
            Some(directory) => directory,
            None => tempfile::Builder::new()
                .prefix(&format!("istio-release-{}-", Local::now().format("%Y%m%d")))
                .tempdir()
                .map_err(WorkDir)?
                .keep(),
        };
        debug!("Working directory: {}", directory.display());

        Ok(Manifest {
            dependencies: input.dependencies,
            all_dependencies: BTreeMap::new(),
            version: input.version,
            docker: input.docker,
            docker_output: input.docker_output.unwrap_or_default(),
            architectures: input.architectures,
            directory,
            proxy_override: input.proxy_override,
            build_outputs,
            grafana_dashboards: input.dashboards,
            skip_generate_bill_of_materials: input.skip_generate_bill_of_materials,
            bill_of_materials_uri: input.bill_of_materials_uri,
            ignore_vulnerability: input.ignore_vulnerability,
        })
    }

    /// Read a built release's `manifest.yaml`. The release directory becomes the
    /// manifest's base directory.
    pub fn read_release(release: &Path) -> Result<Self, Error> {
        let path = release.join(MANIFEST_FILE);
        let mut manifest: Manifest =
            serde_yaml::from_str(&read_file(&path)?).map_err(|err| Parse { err, path })?;
        manifest.directory = release.to_path_buf();
        Ok(manifest)
    }

    /// Write `manifest.yaml` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<(), Error> {
        let yaml = serde_yaml::to_string(self)?;
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, yaml).map_err(|err| WriteFile { err, path })
    }
}

fn read_file(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| ReadFile {
        err,
        path: path.to_path_buf(),
    })
}
