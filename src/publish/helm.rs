use super::gcs::{self, ObjectStore, WriteOptions};
use crate::command::{self, Cmd};
use crate::files;
use crate::model::Manifest;
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INDEX: &str = "index.yaml";

#[derive(Error, Debug)]
pub enum Error {
    #[error("helm index: {0}")]
    Gcs(#[from] gcs::Error),

    #[error(transparent)]
    Command(#[from] command::Error),

    #[error("read charts of release: {0}")]
    Files(#[from] files::Error),

    #[error("{path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
}

#[derive(Deserialize, Default)]
struct Index {
    #[serde(default)]
    entries: BTreeMap<String, Vec<Entry>>,
}

#[derive(Deserialize)]
struct Entry {
    #[serde(default, rename = "appVersion")]
    app_version: Option<String>,
}

/// App versions of the `base` chart listed in a repository index.
fn app_versions(index: &str) -> Result<Vec<String>, serde_yaml::Error> {
    let index: Index = serde_yaml::from_str(index)?;
    Ok(index
        .entries
        .get("base")
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.app_version.clone())
                .collect()
        })
        .unwrap_or_default())
}

fn log_app_versions(label: &str, index: &str) {
    match app_versions(index) {
        Ok(versions) => info!("Helm index {label}: {}", versions.join(", ")),
        Err(err) => warn!("Helm index {label} is unreadable: {err}"),
    }
}

fn log_app_versions_of(label: &str, path: &Path) {
    match std::fs::read_to_string(path) {
        Ok(index) => log_app_versions(label, &index),
        Err(_) => info!("Helm index {label}: none"),
    }
}

fn charts(manifest: &Manifest) -> Result<Vec<PathBuf>, Error> {
    Ok(files::list_files(&manifest.directory.join("helm"))?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "tgz"))
        .collect())
}

/// Merge the release's charts into the shared `index.yaml` of `location` and upload
/// the chart packages next to it.
pub async fn publish_repository<S: ObjectStore>(
    store: &S,
    manifest: &Manifest,
    location: &str,
    attempts: u32,
) -> Result<(), Error> {
    let (bucket, prefix) = gcs::split_bucket(location);
    let helm_dir = manifest.directory.join("helm");
    let url = format!("https://{bucket}.storage.googleapis.com/{prefix}");
    let url = url.trim_end_matches('/');

    gcs::mutate_object(store, &helm_dir, bucket, prefix, INDEX, attempts, |index| {
        log_app_versions_of("before merge", index);
        Cmd::new("helm")
            .args(["repo", "index", ".", "--url", url, "--merge", INDEX])
            .current_dir(&helm_dir)
            .run()?;
        log_app_versions_of("after merge", index);
        Ok::<_, command::Error>(())
    })
    .await?;

    match store.read(bucket, &gcs::object_name(&[prefix, INDEX])).await {
        Ok(Some(live)) => log_app_versions("live", &String::from_utf8_lossy(&live.data)),
        Ok(None) => warn!("Helm index is missing from gs://{bucket}/{prefix} after publishing"),
        Err(err) => warn!("Could not read back live helm index: {err}"),
    }

    for chart in charts(manifest)? {
        let Some(name) = chart.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let object = gcs::object_name(&[prefix, &name]);
        let data = std::fs::read(&chart).map_err(|err| Error::Io {
            path: chart.clone(),
            err,
        })?;
        store
            .write(bucket, &object, data, &WriteOptions::default())
            .await?;
        info!("Published chart {name} to gs://{bucket}/{object}");
    }
    Ok(())
}

/// Push every packaged chart to the OCI registry `hub`.
pub fn push_oci(manifest: &Manifest, hub: &str) -> Result<(), Error> {
    let destination = format!("oci://{}", hub.trim_end_matches('/'));
    for chart in charts(manifest)? {
        info!("Pushing {} to {destination}", chart.display());
        Cmd::new("helm")
            .arg("push")
            .arg(&chart)
            .arg(&destination)
            .run()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_app_versions() {
        let index = r#"
apiVersion: v1
entries:
  base:
  - appVersion: 1.24.0
    version: 1.24.0
  - appVersion: 1.23.2
    version: 1.23.2
  istiod:
  - appVersion: 1.24.0
"#;
        assert_eq!(app_versions(index).unwrap(), vec!["1.24.0", "1.23.2"]);
        assert!(app_versions("apiVersion: v1\n").unwrap().is_empty());
    }

    #[test]
    fn only_packages_are_charts() {
        let dir = tempfile::tempdir().unwrap();
        let helm = dir.path().join("helm");
        std::fs::create_dir_all(&helm).unwrap();
        std::fs::write(helm.join("base-1.2.3.tgz"), "chart").unwrap();
        std::fs::write(helm.join("index.yaml"), "entries: {}").unwrap();
        let manifest = Manifest {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert_eq!(charts(&manifest).unwrap(), vec![helm.join("base-1.2.3.tgz")]);
    }
}
