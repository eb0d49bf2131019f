//! GitHub REST calls: release tags, the release itself with its assets, and the
//! authenticated user used as commit identity.
use crate::files;
use crate::model::{Manifest, Repo};
use log::{debug, info};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const API: &str = "https://api.github.com";
const UPLOADS: &str = "https://uploads.github.com";

#[derive(Error, Debug)]
pub enum Error {
    #[error("github request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{what}: unexpected status {status}: {body}")]
    Status {
        what: String,
        status: u16,
        body: String,
    },

    #[error("cannot tag {repo} with invalid semantic version {version}: {err}")]
    InvalidVersion {
        repo: Repo,
        version: String,
        err: semver::Error,
    },

    #[error("tag {repo}: {source}")]
    Tag {
        repo: Repo,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid artifact pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Files(#[from] files::Error),

    #[error("{path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
}

#[derive(Serialize)]
struct NewTag<'a> {
    tag: &'a str,
    message: &'a str,
    object: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct NewRef<'a> {
    #[serde(rename = "ref")]
    reference: &'a str,
    sha: &'a str,
}

#[derive(Deserialize, Debug)]
struct Created {
    sha: Option<String>,
    #[serde(default)]
    object: Option<CreatedObject>,
}

#[derive(Deserialize, Debug)]
struct CreatedObject {
    sha: String,
}

#[derive(Serialize)]
struct NewRelease<'a> {
    tag_name: &'a str,
    name: &'a str,
    body: &'a str,
    draft: bool,
    prerelease: bool,
}

#[derive(Deserialize, Debug)]
struct Release {
    id: u64,
    html_url: Option<String>,
}

/// The authenticated user.
#[derive(Deserialize, Debug, Clone)]
pub struct User {
    pub login: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl User {
    /// Name and email to commit as. Users hiding their email get the noreply address.
    pub fn identity(&self) -> (String, String) {
        let name = self.name.clone().unwrap_or_else(|| self.login.clone());
        let email = self
            .email
            .clone()
            .unwrap_or_else(|| format!("{}@users.noreply.github.com", self.login));
        (name, email)
    }
}

pub struct GitHub {
    client: reqwest::Client,
    token: String,
}

impl GitHub {
    pub fn new(token: &str) -> Result<Self, Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("rb/", env!("CARGO_PKG_VERSION")))
                .build()?,
            token: token.to_string(),
        })
    }

    async fn send<R: DeserializeOwned>(
        &self,
        what: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<R, Error> {
        let response = request
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                what: what.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    pub async fn user(&self) -> Result<User, Error> {
        self.send("get user", self.client.get(format!("{API}/user")))
            .await
    }

    /// Create an annotated tag object for `sha` and the `refs/tags/` reference to it.
    pub async fn create_tag(
        &self,
        org: &str,
        repo: Repo,
        tag: &str,
        sha: &str,
    ) -> Result<(), Error> {
        let base = format!("{API}/repos/{org}/{repo}/git");
        let message = format!("Istio release {tag}");
        let created: Created = self
            .send(
                "create tag",
                self.client.post(format!("{base}/tags")).json(&NewTag {
                    tag,
                    message: &message,
                    object: sha,
                    kind: "commit",
                }),
            )
            .await?;
        let tag_sha = created.sha.as_deref().unwrap_or(sha);
        debug!("Created tag object {tag_sha} for {repo}");

        let reference = format!("refs/tags/{tag}");
        let created: Created = self
            .send(
                "create tag reference",
                self.client.post(format!("{base}/refs")).json(&NewRef {
                    reference: &reference,
                    sha: tag_sha,
                }),
            )
            .await?;
        debug!(
            "Created {reference} -> {}",
            created.object.map(|o| o.sha).unwrap_or_default()
        );
        Ok(())
    }

    /// Create a draft pre-release of the anchor repository, returning its id.
    async fn create_release(&self, org: &str, version: &str) -> Result<u64, Error> {
        let name = format!("Istio {version}");
        let body = release_body(version);
        let release: Release = self
            .send(
                "create release",
                self.client
                    .post(format!("{API}/repos/{org}/{}/releases", Repo::ANCHOR))
                    .json(&NewRelease {
                        tag_name: version,
                        name: &name,
                        body: &body,
                        draft: true,
                        prerelease: true,
                    }),
            )
            .await?;
        info!(
            "Created release {name} ({})",
            release.html_url.as_deref().unwrap_or("draft")
        );
        Ok(release.id)
    }

    async fn upload_asset(
        &self,
        org: &str,
        release: u64,
        path: &Path,
        name: &str,
    ) -> Result<(), Error> {
        let data = std::fs::read(path).map_err(|err| Error::Io {
            path: path.to_path_buf(),
            err,
        })?;
        let url = format!(
            "{UPLOADS}/repos/{org}/{}/releases/{release}/assets",
            Repo::ANCHOR
        );
        let _: serde_json::Value = self
            .send(
                &format!("upload {name}"),
                self.client
                    .post(url)
                    .query(&[("name", name)])
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(data),
            )
            .await?;
        Ok(())
    }
}

/// Tag name for a repository. Go module repositories need a `v` prefixed semantic version.
pub fn tag_name(repo: Repo, version: &str, go_version_enabled: bool) -> Result<String, Error> {
    if !go_version_enabled || version.starts_with('v') {
        return Ok(version.to_string());
    }
    semver::Version::parse(version).map_err(|err| Error::InvalidVersion {
        repo,
        version: version.to_string(),
        err,
    })?;
    Ok(format!("v{version}"))
}

fn release_body(version: &str) -> String {
    let minor = version
        .rsplit_once('.')
        .map(|(minor, _)| format!("{minor}.x"))
        .unwrap_or_else(|| version.to_string());
    format!(
        "[Artifacts](http://gcsweb.istio.io/gcs/istio-release/releases/{version}/)\n\
         [Release Notes](https://istio.io/news/releases/{minor}/announcing-{version}/)"
    )
}

/// Top-level release files to attach to the GitHub release.
fn artifacts(release: &Path, pattern: &Regex) -> Result<Vec<String>, Error> {
    Ok(files::read_dir_names(release)?
        .into_iter()
        .filter(|name| {
            let keep = release.join(name).is_file() && pattern.is_match(name);
            if !keep {
                debug!("Not uploading {name} to github");
            }
            keep
        })
        .collect())
}

/// Tag every dependency at its pinned commit in `org`, then publish a draft release with
/// the matching artifacts.
pub async fn publish(
    manifest: &Manifest,
    org: &str,
    token: &str,
    artifact_pattern: &str,
) -> Result<(), Error> {
    let pattern = Regex::new(artifact_pattern)?;
    let github = GitHub::new(token)?;

    for (repo, dependency) in manifest.dependencies.slots() {
        let Some(dependency) = dependency else {
            info!("Skipping missing dependency {repo}");
            continue;
        };
        let Some(sha) = dependency.sha.as_deref() else {
            info!("Skipping {repo}, it has no pinned commit");
            continue;
        };
        let tag = tag_name(repo, &manifest.version, dependency.go_version_enabled)?;
        info!("Tagging {org}/{repo} at {sha} as {tag}");
        github
            .create_tag(org, repo, &tag, sha)
            .await
            .map_err(|source| Error::Tag {
                repo,
                source: Box::new(source),
            })?;
    }

    let release = github.create_release(org, &manifest.version).await?;
    for name in artifacts(&manifest.directory, &pattern)? {
        info!("Uploading {name} to github release");
        github
            .upload_asset(org, release, &manifest.directory.join(&name), &name)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_repositories_get_a_v_prefix() {
        assert_eq!(tag_name(Repo::Istio, "1.2.3", false).unwrap(), "1.2.3");
        assert_eq!(tag_name(Repo::Api, "1.2.3", true).unwrap(), "v1.2.3");
        assert_eq!(tag_name(Repo::Api, "v1.2.3", true).unwrap(), "v1.2.3");
        assert_eq!(
            tag_name(Repo::Api, "1.2.3-beta.1", true).unwrap(),
            "v1.2.3-beta.1"
        );
    }

    #[test]
    fn invalid_versions_are_not_tagged_for_go() {
        for version in ["1.2", "1.2.3.4", "01.2.3"] {
            assert!(
                matches!(
                    tag_name(Repo::ClientGo, version, true),
                    Err(Error::InvalidVersion { .. })
                ),
                "{version}"
            );
        }
        assert_eq!(tag_name(Repo::Istio, "1.2", false).unwrap(), "1.2");
    }

    #[test]
    fn release_notes_link_to_the_minor_release() {
        let body = release_body("1.24.1");
        assert!(body.contains("istio-release/releases/1.24.1/"));
        assert!(body.contains("/news/releases/1.24.x/announcing-1.24.1/"));
    }

    #[test]
    fn only_matching_top_level_files_are_attached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("istio-1.2.3-linux-amd64.tar.gz"), "").unwrap();
        std::fs::write(dir.path().join("istioctl-1.2.3-win.zip"), "").unwrap();
        std::fs::write(dir.path().join("manifest.yaml"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("istio-docs")).unwrap();

        let pattern = Regex::new("^istio.*").unwrap();
        assert_eq!(
            artifacts(dir.path(), &pattern).unwrap(),
            vec!["istio-1.2.3-linux-amd64.tar.gz", "istioctl-1.2.3-win.zip"]
        );
    }

    #[test]
    fn commit_identity_falls_back_to_login() {
        let user = User {
            login: "istio-release-robot".into(),
            name: None,
            email: None,
        };
        assert_eq!(
            user.identity(),
            (
                "istio-release-robot".to_string(),
                "istio-release-robot@users.noreply.github.com".to_string()
            )
        );
    }
}
