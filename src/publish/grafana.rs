use crate::model::Manifest;
use log::info;
use reqwest::multipart::{Form, Part};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("dashboard {dashboard}: {err}")]
    Request {
        dashboard: String,
        err: reqwest::Error,
    },

    #[error("{path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
}

fn revisions_url(id: u32) -> String {
    format!("https://grafana.com/api/dashboards/{id}/revisions")
}

/// Upload each externalized dashboard of the release as a new revision on grafana.com.
pub async fn publish(manifest: &Manifest, token: &str) -> Result<(), Error> {
    let client = reqwest::Client::new();
    for (dashboard, id) in &manifest.grafana_dashboards {
        let file_name = format!("{dashboard}.json");
        let path = manifest.directory.join("grafana").join(&file_name);
        let contents = std::fs::read(&path).map_err(|err| Error::Io {
            path: path.clone(),
            err,
        })?;
        let request_err = |err| Error::Request {
            dashboard: dashboard.clone(),
            err,
        };
        let part = Part::bytes(contents)
            .file_name(file_name)
            .mime_str("application/json")
            .map_err(request_err)?;
        let response = client
            .post(revisions_url(*id))
            .bearer_auth(token)
            .multipart(Form::new().part("json", part))
            .send()
            .await
            .map_err(request_err)?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!("Dashboard {dashboard} uploaded with code {status}: {body}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_endpoint() {
        assert_eq!(
            revisions_url(7639),
            "https://grafana.com/api/dashboards/7639/revisions"
        );
    }

    #[tokio::test]
    async fn missing_dashboard_fails_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            directory: dir.path().to_path_buf(),
            grafana_dashboards: [("istio-mesh-dashboard".to_string(), 7639)].into(),
            ..Default::default()
        };
        let err = publish(&manifest, "token").await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
