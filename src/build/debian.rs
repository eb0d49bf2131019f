use super::{make, Error};
use crate::files;
use crate::model::{Manifest, Repo};
use log::info;

/// OS package formats for the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Package {
    Deb,
    Rpm,
}

impl Package {
    pub fn extension(&self) -> &'static str {
        match self {
            Package::Deb => "deb",
            Package::Rpm => "rpm",
        }
    }

    fn target(&self) -> &'static str {
        match self {
            Package::Deb => "deb/fpm",
            Package::Rpm => "rpm/fpm",
        }
    }

    /// Name of the package in the release, e.g. `istio-sidecar-arm64.deb`.
    pub fn file_name(&self, arch: &str) -> String {
        if arch == super::docker::DEFAULT_ARCH {
            format!("istio-sidecar.{}", self.extension())
        } else {
            format!("istio-sidecar-{arch}.{}", self.extension())
        }
    }
}

/// Build the sidecar package for every architecture into `out/deb` or `out/rpm`.
pub fn build(manifest: &Manifest, package: Package) -> Result<(), Error> {
    let ext = package.extension();
    for arch in manifest.arch_names() {
        make(
            manifest,
            Repo::Istio,
            &[("TARGET_ARCH", arch.clone())],
            &[package.target()],
        )?;
        let built = manifest
            .repo_arch_out_dir(Repo::Istio, &arch)
            .join(format!("istio-sidecar.{ext}"));
        let dest = manifest.out_dir().join(ext).join(package.file_name(&arch));
        files::copy_file(&built, &dest)?;
        files::create_sha(&dest)?;
        info!("Packaged {}", dest.display());
    }
    Ok(())
}
