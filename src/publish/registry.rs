//! Container registry operations used by the image publisher.
use crate::command::{self, Cmd};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] command::Error),

    #[error("unexpected {what} for {reference}: {err}")]
    Parse {
        what: &'static str,
        reference: String,
        err: serde_json::Error,
    },

    #[error("manifest served for {reference} does not match its digest {digest}")]
    DigestMismatch { reference: String, digest: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// One per-architecture image referenced by a manifest list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    pub platform: Platform,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MANIFEST_LIST_MEDIA_TYPE.to_string(),
            manifests,
        }
    }
}

/// The registry and the local image store, as seen by the publisher.
pub trait Registry {
    /// Load an image tarball into the local image store.
    fn load(&self, tarball: &Path) -> Result<(), Error>;

    /// Tag a local image as `remote` and push it.
    fn push_tagged(&self, local: &str, remote: &str) -> Result<(), Error>;

    /// Push the image in `tarball` to `repository` by content digest, without a tag.
    fn push_by_digest(&self, tarball: &Path, repository: &str) -> Result<Descriptor, Error>;

    /// Push a manifest list under the human readable `reference`.
    fn push_manifest_list(&self, reference: &str, list: &ManifestList) -> Result<(), Error>;

    /// Digest of `reference` as stored in the registry.
    fn digest(&self, reference: &str) -> Result<String, Error>;

    /// Sign `reference`, which must be digest qualified.
    fn sign(&self, reference: &str, key: &str) -> Result<(), Error>;
}

/// Registry access through the `docker`, `crane` and `cosign` command line tools.
pub struct DockerCli;

/// Log in to `registry` with an OAuth2 access token. Works for GAR and GCR.
pub fn login(registry: &str, token: &str) -> Result<(), Error> {
    debug!("Logging in to Docker registry {registry}");
    Ok(Cmd::new("docker")
        .args(["login", registry, "--username", "oauth2accesstoken", "--password-stdin"])
        .stdin(token)
        .run()?)
}

pub fn logout(registry: &str) -> Result<(), Error> {
    Ok(Cmd::new("docker").args(["logout", registry]).run()?)
}

fn parse<T: serde::de::DeserializeOwned>(
    what: &'static str,
    reference: &str,
    json: &str,
) -> Result<T, Error> {
    serde_json::from_str(json).map_err(|err| Error::Parse {
        what,
        reference: reference.to_string(),
        err,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    #[serde(default)]
    media_type: Option<String>,
}

impl Registry for DockerCli {
    fn load(&self, tarball: &Path) -> Result<(), Error> {
        Ok(Cmd::new("docker").arg("load").arg("-i").arg(tarball).run()?)
    }

    fn push_tagged(&self, local: &str, remote: &str) -> Result<(), Error> {
        Cmd::new("docker").args(["tag", local, remote]).run()?;
        Ok(Cmd::new("docker").args(["push", remote]).run()?)
    }

    fn push_by_digest(&self, tarball: &Path, repository: &str) -> Result<Descriptor, Error> {
        let digest = Cmd::new("crane")
            .args(["digest", "--tarball"])
            .arg(tarball)
            .output()?
            .trim()
            .to_string();
        let reference = format!("{repository}@{digest}");
        Cmd::new("crane")
            .arg("push")
            .arg(tarball)
            .arg(&reference)
            .run()?;

        let manifest = Cmd::new("crane").args(["manifest", reference.as_str()]).output()?;
        let media_type = parse::<ImageManifest>("manifest", &reference, &manifest)?
            .media_type
            .unwrap_or_else(|| MANIFEST_MEDIA_TYPE.to_string());
        let config = Cmd::new("crane").args(["config", reference.as_str()]).output()?;
        let platform: Platform = parse("image config", &reference, &config)?;

        Ok(Descriptor {
            media_type,
            size: manifest_size(&reference, &manifest, &digest)?,
            digest,
            platform,
        })
    }

    fn push_manifest_list(&self, reference: &str, list: &ManifestList) -> Result<(), Error> {
        let repository = repository_of(reference);
        let entries: Vec<String> = list
            .manifests
            .iter()
            .map(|d| format!("{repository}@{}", d.digest))
            .collect();
        Cmd::new("docker")
            .args(["manifest", "create", "--amend", reference])
            .args(&entries)
            .run()?;
        for (entry, descriptor) in entries.iter().zip(&list.manifests) {
            let platform = &descriptor.platform;
            let mut annotate = Cmd::new("docker").args([
                "manifest",
                "annotate",
                reference,
                entry.as_str(),
                "--os",
                platform.os.as_str(),
                "--arch",
                platform.architecture.as_str(),
            ]);
            if let Some(variant) = &platform.variant {
                annotate = annotate.args(["--variant", variant.as_str()]);
            }
            if let Some(os_version) = &platform.os_version {
                annotate = annotate.args(["--os-version", os_version.as_str()]);
            }
            annotate.run()?;
        }
        Ok(Cmd::new("docker")
            .args(["manifest", "push", "--purge", reference])
            .run()?)
    }

    fn digest(&self, reference: &str) -> Result<String, Error> {
        Ok(Cmd::new("crane")
            .args(["digest", reference])
            .output()?
            .trim()
            .to_string())
    }

    fn sign(&self, reference: &str, key: &str) -> Result<(), Error> {
        Ok(Cmd::new("cosign")
            .args(["sign", "--yes", "--key", key, reference])
            .run()?)
    }
}

/// Size of the manifest bytes the registry serves for `digest`. The printed manifest
/// may carry a trailing newline that is not part of the stored bytes; the digest
/// decides which one was stored.
fn manifest_size(reference: &str, manifest: &str, digest: &str) -> Result<u64, Error> {
    let trimmed = manifest.trim_end_matches('\n');
    [manifest, trimmed]
        .into_iter()
        .find(|bytes| format!("sha256:{}", sha256::digest(*bytes)) == digest)
        .map(|bytes| bytes.len() as u64)
        .ok_or_else(|| Error::DigestMismatch {
            reference: reference.to_string(),
            digest: digest.to_string(),
        })
}

/// `registry/name` of `registry/name:tag`. A port in the registry host is kept.
pub fn repository_of(reference: &str) -> &str {
    match reference.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => repository,
        _ => reference,
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Load(PathBuf),
        PushTagged { local: String, remote: String },
        PushByDigest { tarball: PathBuf, repository: String },
        PushManifestList { reference: String, list: ManifestList },
        Sign(String),
    }

    /// Records every call. Digests are derived from the tarball or reference name and
    /// the architecture from the tarball name.
    #[derive(Default)]
    pub struct FakeRegistry {
        pub calls: Mutex<Vec<Call>>,
    }

    impl FakeRegistry {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Registry for FakeRegistry {
        fn load(&self, tarball: &Path) -> Result<(), Error> {
            self.record(Call::Load(tarball.to_path_buf()));
            Ok(())
        }

        fn push_tagged(&self, local: &str, remote: &str) -> Result<(), Error> {
            self.record(Call::PushTagged {
                local: local.to_string(),
                remote: remote.to_string(),
            });
            Ok(())
        }

        fn push_by_digest(&self, tarball: &Path, repository: &str) -> Result<Descriptor, Error> {
            self.record(Call::PushByDigest {
                tarball: tarball.to_path_buf(),
                repository: repository.to_string(),
            });
            let name = tarball
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let architecture = if name.contains("arm64") { "arm64" } else { "amd64" };
            Ok(Descriptor {
                media_type: MANIFEST_MEDIA_TYPE.to_string(),
                size: 1024,
                digest: format!("sha256:{}", sha256::digest(name.as_str())),
                platform: Platform {
                    architecture: architecture.to_string(),
                    os: "linux".to_string(),
                    os_version: None,
                    variant: None,
                },
            })
        }

        fn push_manifest_list(&self, reference: &str, list: &ManifestList) -> Result<(), Error> {
            self.record(Call::PushManifestList {
                reference: reference.to_string(),
                list: list.clone(),
            });
            Ok(())
        }

        fn digest(&self, reference: &str) -> Result<String, Error> {
            Ok(format!("sha256:{}", sha256::digest(reference)))
        }

        fn sign(&self, reference: &str, _key: &str) -> Result<(), Error> {
            self.record(Call::Sign(reference.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_keeps_registry_port() {
        assert_eq!(repository_of("gcr.io/istio/pilot:1.2.3"), "gcr.io/istio/pilot");
        assert_eq!(repository_of("localhost:5000/pilot:1.2.3"), "localhost:5000/pilot");
        assert_eq!(repository_of("localhost:5000/pilot"), "localhost:5000/pilot");
    }

    #[test]
    fn manifest_list_wire_format() {
        let list = ManifestList::new(vec![Descriptor {
            media_type: MANIFEST_MEDIA_TYPE.into(),
            size: 528,
            digest: "sha256:abc".into(),
            platform: Platform {
                architecture: "arm64".into(),
                os: "linux".into(),
                os_version: None,
                variant: Some("v8".into()),
            },
        }]);
        let json: serde_json::Value = serde_json::to_value(&list).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["mediaType"], MANIFEST_LIST_MEDIA_TYPE);
        assert_eq!(json["manifests"][0]["platform"]["variant"], "v8");
        assert!(json["manifests"][0]["platform"].get("os.version").is_none());
    }

    #[test]
    fn manifest_size_counts_the_stored_bytes() {
        let stored = "{\"schemaVersion\":2}\n";
        let digest = format!("sha256:{}", sha256::digest(stored));
        assert_eq!(manifest_size("r", stored, &digest).unwrap(), stored.len() as u64);

        let stored = "{\"schemaVersion\":2}";
        let digest = format!("sha256:{}", sha256::digest(stored));
        let printed = format!("{stored}\n");
        assert_eq!(manifest_size("r", &printed, &digest).unwrap(), stored.len() as u64);

        assert!(matches!(
            manifest_size("r", "{}", "sha256:0000"),
            Err(Error::DigestMismatch { .. })
        ));
    }

    #[test]
    fn image_config_platform() {
        let config = r#"{"architecture": "arm64", "os": "linux", "variant": "v8", "rootfs": {}}"#;
        let platform: Platform = parse("image config", "x", config).unwrap();
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform.variant.as_deref(), Some("v8"));
    }
}
