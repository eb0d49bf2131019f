use crate::command::{self, Cmd};
use crate::config;
use crate::model::{Manifest, Repo};
use log::info;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use walkdir::WalkDir;

/// Floating development tags: `release-1.x-latest-daily`, `latest` and `1.x-dev`.
static TAG_PLACEHOLDERS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"(?m)tag: .*-latest-daily$").unwrap(),
        Regex::new(r"(?m)tag: latest$").unwrap(),
        Regex::new(r"(?m)tag: \d+\.\d+-dev$").unwrap(),
    ]
});

/// Images embedded directly in manifests are enumerated one by one.
static OPERATOR_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"image: gcr\.io/istio-testing/operator:.*").unwrap());

#[derive(Error, Debug)]
pub enum Error {
    #[error("{path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error("parse {path}: {err}")]
    Parse { path: PathBuf, err: serde_yaml::Error },

    #[error("{0} is not a chart descriptor")]
    NotAChart(PathBuf),

    #[error("walk {0}: {1}")]
    Walk(PathBuf, walkdir::Error),

    #[error("package {chart}: {source}")]
    Package {
        chart: PathBuf,
        #[source]
        source: command::Error,
    },
}

/// Stamp the release version and hub into every configured chart.
///
/// Both the helm packages and the release archive read the stamped files.
pub fn sanitize_all_charts(manifest: &Manifest, cfg: &config::Charts) -> Result<(), Error> {
    let anchor = manifest.repo_dir(Repo::ANCHOR);
    for chart in &cfg.paths {
        sanitize_chart(manifest, cfg, &anchor.join(chart))?;
        info!("Sanitized chart {}", chart.display());
    }
    Ok(())
}

fn sanitize_chart(manifest: &Manifest, cfg: &config::Charts, dir: &Path) -> Result<(), Error> {
    let top = dir.join("Chart.yaml");
    if !top.is_file() {
        return Err(Error::NotAChart(top));
    }

    // Subcharts under charts/ are packaged with their parent and carry the same version.
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|err| Error::Walk(dir.to_path_buf(), err))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name() == "Chart.yaml" {
            stamp_descriptor_file(manifest, cfg, entry.path())?;
            continue;
        }
        if !is_template(dir, entry.path()) {
            continue;
        }
        let contents = read(entry.path())?;
        let stamped = stamp_template(
            &contents,
            &cfg.placeholder_hubs,
            &manifest.docker,
            &manifest.version,
        );
        if stamped != contents {
            write(entry.path(), &stamped)?;
        }
    }
    Ok(())
}

fn stamp_descriptor_file(
    manifest: &Manifest,
    cfg: &config::Charts,
    descriptor: &Path,
) -> Result<(), Error> {
    let stamped = stamp_descriptor(&read(descriptor)?, &manifest.version, &cfg.repository)
        .map_err(|err| match err {
            StampError::Parse(err) => Error::Parse {
                path: descriptor.to_path_buf(),
                err,
            },
            StampError::NotAChart => Error::NotAChart(descriptor.to_path_buf()),
        })?;
    write(descriptor, &stamped)
}

fn is_template(chart: &Path, path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    if name.starts_with("values") && name.ends_with(".yaml") {
        return true;
    }
    path.strip_prefix(chart)
        .map(|rel| rel.starts_with("templates"))
        .unwrap_or(false)
}

#[derive(Debug)]
enum StampError {
    Parse(serde_yaml::Error),
    NotAChart,
}

/// Set `version` and `appVersion` to the release and point local `file://` chart
/// dependencies at the public repository.
fn stamp_descriptor(chart: &str, version: &str, repository: &str) -> Result<String, StampError> {
    let mut chart: Value = serde_yaml::from_str(chart).map_err(StampError::Parse)?;
    let map = chart.as_mapping_mut().ok_or(StampError::NotAChart)?;
    map.insert("version".into(), version.into());
    map.insert("appVersion".into(), version.into());

    if let Some(Value::Sequence(dependencies)) = map.get_mut("dependencies") {
        for dependency in dependencies.iter_mut().filter_map(Value::as_mapping_mut) {
            if is_local(dependency) {
                dependency.insert("repository".into(), repository.into());
                dependency.insert("version".into(), version.into());
            }
        }
    }
    serde_yaml::to_string(&chart).map_err(StampError::Parse)
}

fn is_local(dependency: &Mapping) -> bool {
    dependency
        .get("repository")
        .and_then(Value::as_str)
        .is_some_and(|repository| repository.starts_with("file://"))
}

/// Rewrite development hubs and floating tags. Anything not on the placeholder list
/// is left alone.
pub fn stamp_template(contents: &str, hubs: &[String], docker: &str, version: &str) -> String {
    let mut contents = contents.to_string();
    for hub in hubs {
        contents = contents.replace(&format!("hub: {hub}"), &format!("hub: {docker}"));
    }
    let tag = format!("tag: {version}");
    for placeholder in TAG_PLACEHOLDERS.iter() {
        contents = placeholder
            .replace_all(&contents, regex::NoExpand(&tag))
            .into_owned();
    }
    let operator = format!("image: {docker}/operator:{version}");
    OPERATOR_IMAGE
        .replace_all(&contents, regex::NoExpand(&operator))
        .into_owned()
}

/// Package every configured chart into `out/helm`.
pub fn package(manifest: &Manifest, cfg: &config::Charts) -> Result<(), Error> {
    let anchor = manifest.repo_dir(Repo::ANCHOR);
    let destination = manifest.out_dir().join("helm");
    std::fs::create_dir_all(&destination).map_err(|err| Error::Io {
        path: destination.clone(),
        err,
    })?;
    for chart in &cfg.paths {
        let chart = anchor.join(chart);
        Cmd::new("helm")
            .arg("package")
            .arg(&chart)
            .arg("--destination")
            .arg(&destination)
            .run()
            .map_err(|source| Error::Package { chart, source })?;
    }
    Ok(())
}

fn read(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| Error::Io {
        path: path.to_path_buf(),
        err,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), Error> {
    std::fs::write(path, contents).map_err(|err| Error::Io {
        path: path.to_path_buf(),
        err,
    })
}
