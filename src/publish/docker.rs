use super::registry::{self, ManifestList, Registry};
use crate::build::docker::DEFAULT_ARCH;
use crate::files;
use crate::model::Manifest;
use log::info;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const TARBALL_SUFFIX: &str = ".tar.gz";
const ARCH_SUFFIXES: [&str; 2] = ["amd64", "arm64"];
const VARIANT_SUFFIXES: [&str; 2] = ["distroless", "debug"];

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid image found in docker folder: {0}")]
    InvalidImage(String),

    #[error("read docker output of release: {0}")]
    ReadDir(#[source] files::Error),

    #[error("{image}: {source}")]
    Registry {
        image: String,
        #[source]
        source: registry::Error,
    },
}

/// What an image tarball's file name says about its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub name: String,
    pub variant: Option<String>,
    pub arch: String,
}

impl ImageFile {
    /// Parse `<name>[-<variant>][-<arch>].tar.gz`. No arch suffix means the default arch.
    pub fn parse(file: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidImage(file.to_string());
        let mut stem = file.strip_suffix(TARBALL_SUFFIX).ok_or_else(invalid)?;

        let mut arch = DEFAULT_ARCH;
        if let Some((rest, found)) = split_suffix(stem, &ARCH_SUFFIXES) {
            stem = rest;
            arch = found;
        }
        let mut variant = None;
        if let Some((rest, found)) = split_suffix(stem, &VARIANT_SUFFIXES) {
            stem = rest;
            variant = Some(found.to_string());
        }
        if stem.is_empty() || stem.contains('.') {
            return Err(invalid());
        }
        Ok(Self {
            name: stem.to_string(),
            variant,
            arch: arch.to_string(),
        })
    }

    /// `-distroless` style tag suffix, empty for the default variant.
    fn tag_suffix(&self) -> String {
        self.variant
            .as_ref()
            .map(|variant| format!("-{variant}"))
            .unwrap_or_default()
    }
}

fn split_suffix<'a, 'b>(stem: &'a str, suffixes: &[&'b str]) -> Option<(&'a str, &'b str)> {
    suffixes.iter().find_map(|suffix| {
        stem.strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('-'))
            .map(|rest| (rest, *suffix))
    })
}

/// One published reference, shared by every architecture of an image.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Image {
    pub name: String,
    pub variant: Option<String>,
    /// Reference the build loaded the image under.
    pub original: String,
    /// `hub/name` in the destination registry.
    pub repository: String,
    pub tag: String,
}

impl Image {
    pub fn destination(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Architecture to tarball, per published reference.
pub type Groups = BTreeMap<Image, BTreeMap<String, PathBuf>>;

/// Group image tarballs by the reference they will be published under.
pub fn group_images(
    manifest: &Manifest,
    images: &[(ImageFile, PathBuf)],
    hub: &str,
    tags: &[String],
) -> Groups {
    let mut groups = Groups::new();
    for tag in tags {
        for (image, path) in images {
            let suffix = image.tag_suffix();
            let key = Image {
                name: image.name.clone(),
                variant: image.variant.clone(),
                original: format!(
                    "{}/{}:{}{suffix}",
                    manifest.docker, image.name, manifest.version
                ),
                repository: format!("{hub}/{}", image.name),
                tag: format!("{tag}{suffix}"),
            };
            groups
                .entry(key)
                .or_default()
                .insert(image.arch.clone(), path.clone());
        }
    }
    groups
}

/// Push every image in the release's `docker/` directory to `hub` under each tag.
///
/// A single architecture is retagged and pushed directly. Several architectures are
/// pushed by digest and joined under the tag with a manifest list. Signatures always
/// bind to the digest the registry reports.
pub fn publish_images(
    registry: &dyn Registry,
    manifest: &Manifest,
    hub: &str,
    tags: &[String],
    signing_key: Option<&str>,
) -> Result<(), Error> {
    let dir = manifest.directory.join("docker");
    let mut images = Vec::new();
    for name in files::read_dir_names(&dir).map_err(Error::ReadDir)? {
        images.push((ImageFile::parse(&name)?, dir.join(&name)));
    }

    for (_, path) in &images {
        registry.load(path).map_err(registry_err(path))?;
    }

    let tags = if tags.is_empty() {
        vec![manifest.version.clone()]
    } else {
        tags.to_vec()
    };

    for (image, arches) in group_images(manifest, &images, hub, &tags) {
        let destination = image.destination();
        let err = |source| Error::Registry {
            image: destination.clone(),
            source,
        };
        if let [(arch, _)] = arches.iter().collect::<Vec<_>>().as_slice() {
            info!("Pushing {destination} ({arch})");
            registry
                .push_tagged(&image.original, &destination)
                .map_err(err)?;
        } else {
            info!(
                "Pushing {destination} for {}",
                arches.keys().cloned().collect::<Vec<_>>().join(", ")
            );
            let mut descriptors = Vec::new();
            for tarball in arches.values() {
                descriptors.push(
                    registry
                        .push_by_digest(tarball, &image.repository)
                        .map_err(err)?,
                );
            }
            registry
                .push_manifest_list(&destination, &ManifestList::new(descriptors))
                .map_err(err)?;
        }

        if let Some(key) = signing_key {
            let digest = registry.digest(&destination).map_err(err)?;
            registry
                .sign(&format!("{}@{digest}", image.repository), key)
                .map_err(err)?;
        }
    }
    Ok(())
}

fn registry_err(path: &Path) -> impl FnOnce(registry::Error) -> Error + '_ {
    move |source| Error::Registry {
        image: path.display().to_string(),
        source,
    }
}
