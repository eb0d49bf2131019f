use crate::files;
use crate::model::{Manifest, Repo};
use log::info;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DASHBOARDS: &str = "manifests/addons/dashboards";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error("parse {path}: {err}")]
    Parse { path: PathBuf, err: serde_json::Error },

    #[error("{path}: already has a description: {description}")]
    HasDescription { path: PathBuf, description: Value },

    #[error("{0}: no title")]
    NoTitle(PathBuf),

    #[error(transparent)]
    Files(#[from] files::Error),
}

pub fn is_dashboard(name: &str) -> bool {
    name.ends_with("-dashboard.json") || name.ends_with("-dashboard.gen.json")
}

/// Convert the dashboards shipped with the charts into the form grafana.com
/// accepts and place them in `out/grafana`.
pub fn build(manifest: &Manifest) -> Result<(), Error> {
    let work = manifest.work_dir().join("grafana");
    files::copy_dir(&manifest.repo_dir(Repo::Istio).join(DASHBOARDS), &work)?;
    for name in files::read_dir_names(&work)? {
        if !is_dashboard(&name) {
            info!("Skipping non-dashboard file {name}");
            continue;
        }
        externalize_file(&manifest.version, &work.join(&name))?;
    }
    files::copy_dir(&work, &manifest.out_dir().join("grafana"))?;
    Ok(())
}

fn externalize_file(version: &str, path: &Path) -> Result<(), Error> {
    let io = |err| Error::Io {
        path: path.to_path_buf(),
        err,
    };
    let contents = std::fs::read_to_string(path).map_err(io)?;
    let dashboard: Map<String, Value> =
        serde_json::from_str(&contents).map_err(|err| Error::Parse {
            path: path.to_path_buf(),
            err,
        })?;
    let externalized = externalize(version, dashboard).map_err(|err| match err {
        Invalid::Description(description) => Error::HasDescription {
            path: path.to_path_buf(),
            description,
        },
        Invalid::Title => Error::NoTitle(path.to_path_buf()),
    })?;
    std::fs::write(path, externalized).map_err(io)
}

#[derive(Debug)]
enum Invalid {
    Description(Value),
    Title,
}

/// Add `__inputs` and `__requires`, stamp the description with the release and replace
/// the hardcoded datasource with the input variable.
fn externalize(version: &str, mut dashboard: Map<String, Value>) -> Result<String, Invalid> {
    dashboard.insert(
        "__inputs".into(),
        json!([{
            "name": "DS_PROMETHEUS",
            "label": "Prometheus",
            "description": "",
            "type": "datasource",
            "pluginId": "prometheus",
            "pluginName": "Prometheus"
        }]),
    );
    dashboard.insert(
        "__requires".into(),
        json!([
            {"type": "grafana", "id": "grafana", "name": "Grafana", "version": "6.4.3"},
            {"type": "panel", "id": "graph", "name": "Graph", "version": ""},
            {"type": "datasource", "id": "prometheus", "name": "Prometheus", "version": "5.0.0"},
            {"type": "panel", "id": "table", "name": "Table", "version": ""}
        ]),
    );

    match dashboard.get("description") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if s.is_empty() => {}
        Some(other) => return Err(Invalid::Description(other.clone())),
    }
    let title = match dashboard.get("title") {
        Some(Value::String(title)) if !title.is_empty() => title.clone(),
        _ => return Err(Invalid::Title),
    };
    dashboard.insert(
        "description".into(),
        Value::String(format!("{title} version {version}")),
    );

    // serde_json::to_string_pretty cannot fail on a Map of Values
    let pretty = serde_json::to_string_pretty(&dashboard).unwrap_or_default();
    Ok(pretty.replace(
        r#""datasource": "Prometheus""#,
        r#""datasource": "${DS_PROMETHEUS}""#,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dashboard(json: &str) -> Map<String, Value> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn dashboard_is_externalized() {
        let out = externalize(
            "1.2.3",
            dashboard(r#"{"title": "Istio Mesh", "panels": [{"datasource": "Prometheus"}]}"#),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["description"], "Istio Mesh version 1.2.3");
        assert_eq!(parsed["__inputs"][0]["name"], "DS_PROMETHEUS");
        assert_eq!(parsed["__requires"].as_array().unwrap().len(), 4);
        assert_eq!(parsed["panels"][0]["datasource"], "${DS_PROMETHEUS}");
    }

    #[test]
    fn existing_description_is_rejected() {
        let result = externalize(
            "1.2.3",
            dashboard(r#"{"title": "Istio Mesh", "description": "custom"}"#),
        );
        assert!(matches!(result, Err(Invalid::Description(_))));

        let result = externalize("1.2.3", dashboard(r#"{"title": "x", "description": null}"#));
        assert!(result.is_ok());
    }

    #[test]
    fn missing_title_is_rejected() {
        assert!(matches!(
            externalize("1.2.3", dashboard(r#"{"title": ""}"#)),
            Err(Invalid::Title)
        ));
    }

    #[test]
    fn only_dashboards_are_processed() {
        assert!(is_dashboard("istio-mesh-dashboard.json"));
        assert!(is_dashboard("pilot-dashboard.gen.json"));
        assert!(!is_dashboard("README.md"));
    }
}
