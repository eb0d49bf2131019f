use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Repositories that take part in a release.
///
/// The declaration order is the resolution order: the anchor repository comes first,
/// because auto-resolved dependencies read version pins out of it, and `proxy` precedes
/// `envoy` for the same reason.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Repo {
    Istio,
    Api,
    Proxy,
    Ztunnel,
    ClientGo,
    TestInfra,
    Tools,
    Envoy,
    Enhancements,
    ReleaseBuilder,
    CommonFiles,
}

impl Repo {
    pub const ALL: [Repo; 11] = [
        Repo::Istio,
        Repo::Api,
        Repo::Proxy,
        Repo::Ztunnel,
        Repo::ClientGo,
        Repo::TestInfra,
        Repo::Tools,
        Repo::Envoy,
        Repo::Enhancements,
        Repo::ReleaseBuilder,
        Repo::CommonFiles,
    ];

    /// The repository other repositories read version pins from.
    pub const ANCHOR: Repo = Repo::Istio;

    pub fn name(&self) -> &'static str {
        match self {
            Repo::Istio => "istio",
            Repo::Api => "api",
            Repo::Proxy => "proxy",
            Repo::Ztunnel => "ztunnel",
            Repo::ClientGo => "client-go",
            Repo::TestInfra => "test-infra",
            Repo::Tools => "tools",
            Repo::Envoy => "envoy",
            Repo::Enhancements => "enhancements",
            Repo::ReleaseBuilder => "release-builder",
            Repo::CommonFiles => "common-files",
        }
    }
}

impl Display for Repo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How an `auto` dependency finds the commit to check out.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutoStrategy {
    /// Look up `lastStableSHA` in the anchor repository's `istio.deps`.
    Deps,
    /// Use the version pinned in the anchor repository's `go.mod`.
    Modules,
    /// Read `ENVOY_SHA` from the proxy repository's `WORKSPACE`. Only valid for envoy.
    ProxyWorkspace,
}

impl Display for AutoStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AutoStrategy::Deps => "deps",
            AutoStrategy::Modules => "modules",
            AutoStrategy::ProxyWorkspace => "proxy_workspace",
        })
    }
}

/// A git dependency of the release.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Dependency {
    /// Git repository to pull from. Required if branch, sha or auto is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Copy a local checkout instead of cloning. Must still be a git repository.
    #[serde(default, rename = "localpath", skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<AutoStrategy>,
    /// Tag the repository as `v1.2.3` rather than `1.2.3`.
    #[serde(default, rename = "goversionenabled", skip_serializing_if = "std::ops::Not::not")]
    pub go_version_enabled: bool,
}

impl Dependency {
    /// The git reference to check out; a SHA wins over a branch.
    pub fn git_ref(&self) -> Option<&str> {
        self.sha.as_deref().or(self.branch.as_deref())
    }

    /// Number of ref selectors set on this dependency.
    pub fn selectors(&self) -> usize {
        [
            self.branch.is_some(),
            self.sha.is_some(),
            self.local_path.is_some(),
            self.auto.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// The fixed set of dependency slots. A missing slot means the repository is not part
/// of this release, which is never an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies(BTreeMap<Repo, Dependency>);

impl Dependencies {
    pub fn get(&self, repo: Repo) -> Option<&Dependency> {
        self.0.get(&repo)
    }

    pub fn set(&mut self, repo: Repo, dependency: Dependency) {
        self.0.insert(repo, dependency);
    }

    pub fn remove(&mut self, repo: Repo) -> Option<Dependency> {
        self.0.remove(&repo)
    }

    /// Every slot in resolution order, present or not.
    pub fn slots(&self) -> impl Iterator<Item = (Repo, Option<&Dependency>)> + '_ {
        Repo::ALL.into_iter().map(|repo| (repo, self.0.get(&repo)))
    }

    /// Present dependencies in resolution order.
    pub fn present(&self) -> impl Iterator<Item = (Repo, &Dependency)> + '_ {
        self.0.iter().map(|(repo, dep)| (*repo, dep))
    }
}

impl FromIterator<(Repo, Dependency)> for Dependencies {
    fn from_iter<T: IntoIterator<Item = (Repo, Dependency)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'de> Deserialize<'de> for Dependencies {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let slots = BTreeMap::<Repo, Option<Dependency>>::deserialize(deserializer)?;
        Ok(slots
            .into_iter()
            .filter_map(|(repo, dep)| dep.map(|dep| (repo, dep)))
            .collect())
    }
}

/// Written out as a bill of materials: only the pinned SHA survives.
impl Serialize for Dependencies {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (repo, dep) in &self.0 {
            let pinned = Dependency {
                sha: dep.sha.clone(),
                go_version_enabled: dep.go_version_enabled,
                ..Default::default()
            };
            map.serialize_entry(repo, &pinned)?;
        }
        map.end()
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown build output: {0}")]
pub struct UnknownBuildOutput(pub String);

/// Artifact kinds a release can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuildOutput {
    Docker,
    Helm,
    Debian,
    Rpm,
    Archive,
    Grafana,
    Scanner,
}

impl BuildOutput {
    pub const ALL: [BuildOutput; 7] = [
        BuildOutput::Docker,
        BuildOutput::Helm,
        BuildOutput::Debian,
        BuildOutput::Rpm,
        BuildOutput::Archive,
        BuildOutput::Grafana,
        BuildOutput::Scanner,
    ];
}

impl FromStr for BuildOutput {
    type Err = UnknownBuildOutput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(BuildOutput::Docker),
            "helm" => Ok(BuildOutput::Helm),
            "debian" => Ok(BuildOutput::Debian),
            "rpm" => Ok(BuildOutput::Rpm),
            "archive" => Ok(BuildOutput::Archive),
            "grafana" => Ok(BuildOutput::Grafana),
            "scanner" => Ok(BuildOutput::Scanner),
            _ => Err(UnknownBuildOutput(s.to_string())),
        }
    }
}

impl Display for BuildOutput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BuildOutput::Docker => "docker",
            BuildOutput::Helm => "helm",
            BuildOutput::Debian => "debian",
            BuildOutput::Rpm => "rpm",
            BuildOutput::Archive => "archive",
            BuildOutput::Grafana => "grafana",
            BuildOutput::Scanner => "scanner",
        })
    }
}

/// Where docker images end up after the build.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DockerOutput {
    /// Image tarballs on disk.
    #[default]
    Tar,
    /// Images loaded into the local docker daemon.
    Context,
}

/// A release, as built. Constructed from an input manifest, pinned by
/// `source::standardize_manifest`, and written out as `manifest.yaml`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub dependencies: Dependencies,
    /// Every dependency including ones that are not cloned, with 12 character hashes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub all_dependencies: BTreeMap<String, String>,
    pub version: String,
    /// Docker hub used in the helm charts, e.g. `gcr.io/istio-release`.
    pub docker: String,
    #[serde(default)]
    pub docker_output: DockerOutput,
    /// e.g. `linux/amd64`, `linux/arm64`.
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(skip)]
    pub directory: PathBuf,
    /// Envoy binary location used instead of the default proxy.
    #[serde(skip)]
    pub proxy_override: Option<String>,
    #[serde(skip)]
    pub build_outputs: BTreeSet<BuildOutput>,
    /// Dashboard name to grafana.com dashboard ID.
    #[serde(default, rename = "dashboards")]
    pub grafana_dashboards: BTreeMap<String, u32>,
    #[serde(default)]
    pub skip_generate_bill_of_materials: bool,
    #[serde(default, rename = "billOfMaterialsURI", skip_serializing_if = "Option::is_none")]
    pub bill_of_materials_uri: Option<String>,
    #[serde(skip)]
    pub ignore_vulnerability: bool,
}

impl Manifest {
    pub fn work_dir(&self) -> PathBuf {
        self.directory.join("work")
    }

    pub fn source_dir(&self) -> PathBuf {
        self.directory.join("sources")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.directory.join("out")
    }

    /// Working tree of a repository. Build steps may modify it.
    pub fn repo_dir(&self, repo: Repo) -> PathBuf {
        self.work_dir().join("src").join("istio.io").join(repo.name())
    }

    /// Pristine checkout of a repository.
    pub fn repo_source_dir(&self, repo: Repo) -> PathBuf {
        self.source_dir().join(repo.name())
    }

    /// Build output of a repository for one linux architecture.
    pub fn repo_arch_out_dir(&self, repo: Repo, arch: &str) -> PathBuf {
        self.repo_dir(repo)
            .join("out")
            .join(format!("linux_{arch}"))
            .join("release")
    }

    /// Shared go build output for the host platform.
    pub fn go_out_dir(&self) -> PathBuf {
        self.work_dir()
            .join("out")
            .join(format!("{}_{}", host_os(), host_arch()))
            .join("release")
    }

    pub fn builds(&self, output: BuildOutput) -> bool {
        self.build_outputs.contains(&output)
    }

    /// Architecture names without the OS prefix, amd64 when none are configured.
    pub fn arch_names(&self) -> Vec<String> {
        if self.architectures.is_empty() {
            return vec!["amd64".to_string()];
        }
        self.architectures
            .iter()
            .map(|a| a.rsplit('/').next().unwrap_or(a).to_string())
            .collect()
    }
}

fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        os => os,
    }
}

pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        arch => arch,
    }
}

/// Entry of the anchor repository's `istio.deps` file.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IstioDep {
    #[serde(default, rename = "_comment")]
    pub comment: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub repo_name: String,
    #[serde(default, rename = "lastStableSHA")]
    pub last_stable_sha: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn dependencies_serialize_only_the_sha() {
        let mut deps = Dependencies::default();
        deps.set(
            Repo::Istio,
            Dependency {
                git: Some("https://github.com/istio/istio".into()),
                branch: Some("master".into()),
                sha: Some("abc123".into()),
                ..Default::default()
            },
        );
        let yaml = serde_yaml::to_string(&deps).unwrap();
        assert_eq!(yaml, "istio:\n  sha: abc123\n");
    }

    #[test]
    fn null_slots_are_absent() {
        let deps: Dependencies =
            serde_yaml::from_str("istio:\n  git: x\n  branch: master\napi: null\n").unwrap();
        assert!(deps.get(Repo::Istio).is_some());
        assert!(deps.get(Repo::Api).is_none());
        assert_eq!(deps.present().count(), 1);
        assert_eq!(deps.slots().count(), Repo::ALL.len());
    }

    #[test]
    fn unknown_repo_is_rejected() {
        let deps = serde_yaml::from_str::<Dependencies>("not-a-repo:\n  sha: abc\n");
        assert!(deps.is_err());
    }

    #[test]
    fn anchor_resolves_first() {
        let deps: Dependencies =
            serde_yaml::from_str("envoy:\n  sha: b\nproxy:\n  sha: c\nistio:\n  sha: a\n")
                .unwrap();
        let order: Vec<_> = deps.present().map(|(repo, _)| repo).collect();
        assert_eq!(order, vec![Repo::Istio, Repo::Proxy, Repo::Envoy]);
    }

    #[test]
    fn build_output_names() {
        assert_eq!("Docker".parse::<BuildOutput>(), Ok(BuildOutput::Docker));
        assert_eq!("rpm".parse::<BuildOutput>(), Ok(BuildOutput::Rpm));
        assert_eq!(
            "tarball".parse::<BuildOutput>(),
            Err(UnknownBuildOutput("tarball".into()))
        );
    }

    #[test]
    fn derived_paths() {
        let manifest = Manifest {
            directory: PathBuf::from("/tmp/release"),
            ..Default::default()
        };
        assert_eq!(
            manifest.repo_dir(Repo::ClientGo),
            Path::new("/tmp/release/work/src/istio.io/client-go")
        );
        assert_eq!(
            manifest.repo_arch_out_dir(Repo::Istio, "arm64"),
            Path::new("/tmp/release/work/src/istio.io/istio/out/linux_arm64/release")
        );
        assert_eq!(manifest.source_dir(), Path::new("/tmp/release/sources"));
        assert_eq!(manifest.out_dir(), Path::new("/tmp/release/out"));
    }

    #[test]
    fn arch_names_strip_os() {
        let manifest = Manifest {
            architectures: vec!["linux/amd64".into(), "linux/arm64".into()],
            ..Default::default()
        };
        assert_eq!(manifest.arch_names(), vec!["amd64", "arm64"]);
        assert_eq!(Manifest::default().arch_names(), vec!["amd64"]);
    }
}
