use crate::model::Repo;
use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    Read { path: PathBuf, err: std::io::Error },

    #[error("parse {path}: {err}")]
    Parse {
        path: PathBuf,
        err: toml::de::Error,
    },
}

/// An rb.toml file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct File {
    pub charts: Charts,
    #[serde(default)]
    pub docker: Docker,
    pub archive: Archive,
    pub publish: Publish,
    pub scanner: Scanner,
    pub branch: Branch,
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    /// The built-in configuration with a user file merged on top. Tables merge key by
    /// key; any other value in the user file replaces the default.
    pub fn default_with_user_config_file(path: &Path) -> Result<Self, Error> {
        let user = std::fs::read_to_string(path).map_err(|err| Error::Read {
            path: path.to_path_buf(),
            err,
        })?;
        Self::merged(&user).map_err(|err| Error::Parse {
            path: path.to_path_buf(),
            err,
        })
    }

    fn merged(user: &str) -> Result<Self, toml::de::Error> {
        let mut base: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
        let user: toml::Table = toml::from_str(user)?;
        merge(&mut base, user);
        toml::Value::Table(base).try_into()
    }
}

fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(table) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge(existing, table);
                continue;
            }
            base.insert(key, toml::Value::Table(table));
        } else {
            base.insert(key, value);
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Charts {
    /// Helm repository that `file://` chart dependencies are rewritten to.
    pub repository: String,
    /// Chart directories relative to the anchor repository.
    pub paths: Vec<PathBuf>,
    pub placeholder_hubs: Vec<String>,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Docker {
    #[serde_inline_default(vec!["default".to_string(), "distroless".to_string()])]
    pub variants: Vec<String>,
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            variants: vec!["default".to_string(), "distroless".to_string()],
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Archive {
    /// istioctl platforms; one release archive is assembled per platform.
    pub platforms: Vec<String>,
    pub direct_copies: Vec<PathBuf>,
    pub filtered_dirs: Vec<PathBuf>,
    /// Regular expressions matched against file names.
    pub include_patterns: Vec<String>,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Publish {
    /// Read-modify-write cycles attempted before giving up on a contended object.
    #[serde_inline_default(10)]
    pub mutate_attempts: u32,
    /// Release directory files matching this are attached to the GitHub release.
    #[serde_inline_default("^istio.*".to_string())]
    pub github_artifact_pattern: String,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Scanner {
    pub endpoint: String,
    #[serde_inline_default(4)]
    pub attempts: u32,
    #[serde_inline_default(60)]
    pub timeout_seconds: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Branch {
    /// Prefix of the release managers team; the release with dashes is appended.
    pub codeowners_team: String,
    #[serde(default)]
    pub skip_branch_creation: Vec<Repo>,
    pub build_tools_tags: String,
}
