//! Publishing a built release to its distribution points.
pub mod docker;
pub mod gcs;
pub mod github;
pub mod grafana;
pub mod helm;
pub mod registry;

use crate::auth;
use crate::config;
use crate::model::Manifest;
use log::{info, warn};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("publish to docker: {0}")]
    Docker(#[from] docker::Error),

    #[error("log in to {registry}: {source}")]
    Login {
        registry: String,
        #[source]
        source: registry::Error,
    },

    #[error("publish to gcs: {0}")]
    Gcs(#[from] gcs::Error),

    #[error("publish helm charts: {0}")]
    Helm(#[from] helm::Error),

    #[error("publish to github: {0}")]
    GitHub(#[from] github::Error),

    #[error("publish to grafana: {0}")]
    Grafana(#[from] grafana::Error),

    #[error("credentials: {0}")]
    Auth(#[from] auth::Error),
}

/// Where to publish. Every destination is optional and skipped when unset.
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub docker_hub: Option<String>,
    pub docker_tags: Vec<String>,
    pub gcs_bucket: Option<String>,
    pub gcs_aliases: Vec<String>,
    pub helm_bucket: Option<String>,
    pub helm_hub: Option<String>,
    pub github_org: Option<String>,
    pub github_token: Option<PathBuf>,
    pub grafana_token: Option<PathBuf>,
    pub cosign_key: Option<String>,
}

/// Registries that accept a Google OAuth2 access token.
fn google_registry(hub: &str) -> Option<&str> {
    let host = hub.split('/').next()?;
    (host == "gcr.io" || host.ends_with(".gcr.io") || host.ends_with("-docker.pkg.dev"))
        .then_some(host)
}

/// Run `push` inside a registry session on `host`, logging out whether or not it
/// succeeded. A failed logout only warns.
fn logged_in<T, E>(
    host: Option<&str>,
    logout: impl FnOnce(&str) -> Result<(), registry::Error>,
    push: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    let result = push();
    if let Some(host) = host {
        if let Err(err) = logout(host) {
            warn!("Could not log out of {host}: {err}");
        }
    }
    result
}

pub async fn publish(
    manifest: &Manifest,
    options: &Options,
    cfg: &config::File,
) -> Result<(), Error> {
    if let Some(hub) = &options.docker_hub {
        let google = google_registry(hub);
        if let Some(host) = google {
            let token = auth::google_token().await?;
            registry::login(host, &token).map_err(|source| Error::Login {
                registry: host.to_string(),
                source,
            })?;
        }
        info!("Publishing images to {hub}");
        logged_in(google, registry::logout, || {
            docker::publish_images(
                &registry::DockerCli,
                manifest,
                hub,
                &options.docker_tags,
                options.cosign_key.as_deref(),
            )
        })?;
    }

    if options.gcs_bucket.is_some() || options.helm_bucket.is_some() {
        let store = gcs::GcsClient::new().await?;
        if let Some(location) = &options.gcs_bucket {
            let (bucket, prefix) = gcs::split_bucket(location);
            info!("Publishing release archive to gs://{bucket}/{prefix}");
            gcs::publish_archive(&store, manifest, bucket, prefix, &options.gcs_aliases).await?;
        }
        if let Some(location) = &options.helm_bucket {
            info!("Publishing helm charts to gs://{location}");
            helm::publish_repository(&store, manifest, location, cfg.publish.mutate_attempts)
                .await?;
        }
    }

    if let Some(hub) = &options.helm_hub {
        info!("Publishing helm charts to oci://{hub}");
        helm::push_oci(manifest, hub)?;
    }

    if let Some(org) = &options.github_org {
        let token = auth::token_from_file_or_env(options.github_token.as_deref(), "GITHUB_TOKEN")?;
        info!("Publishing release to github org {org}");
        github::publish(manifest, org, &token, &cfg.publish.github_artifact_pattern).await?;
    }

    let grafana_token =
        auth::token_from_file_or_env(options.grafana_token.as_deref(), "GRAFANA_TOKEN")?;
    if !grafana_token.is_empty() {
        info!("Publishing grafana dashboards");
        grafana::publish(manifest, &grafana_token).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_push_still_logs_out() {
        let logged_out = std::cell::RefCell::new(Vec::new());
        let logout = |host: &str| {
            logged_out.borrow_mut().push(host.to_string());
            Ok(())
        };
        let result: Result<(), docker::Error> = logged_in(Some("gcr.io"), logout, || {
            Err(docker::Error::InvalidImage("notes.txt".into()))
        });
        assert!(matches!(result, Err(docker::Error::InvalidImage(_))));
        assert_eq!(*logged_out.borrow(), vec!["gcr.io".to_string()]);
    }

    #[test]
    fn no_session_no_logout() {
        let result: Result<u32, docker::Error> =
            logged_in(None, |_| panic!("logged out without a session"), || Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn google_registries_get_a_token_login() {
        assert_eq!(google_registry("gcr.io/istio-release"), Some("gcr.io"));
        assert_eq!(google_registry("eu.gcr.io/istio"), Some("eu.gcr.io"));
        assert_eq!(
            google_registry("us-docker.pkg.dev/istio-release/releases"),
            Some("us-docker.pkg.dev")
        );
        assert_eq!(google_registry("docker.io/istio"), None);
        assert_eq!(google_registry("localhost:5000"), None);
    }
}
