use super::{make, Error};
use crate::config;
use crate::files;
use crate::model::{DockerOutput, Manifest, Repo};
use log::info;
use std::path::Path;

const TARBALL_SUFFIX: &str = ".tar.gz";

/// Architecture published without a filename suffix.
pub const DEFAULT_ARCH: &str = "amd64";

/// Build every image variant for every architecture.
///
/// In tarball mode the saved images are copied to `out/docker`, named
/// `<image>[-<variant>][-<arch>].tar.gz` with the default architecture left bare.
/// In context mode the images stay in the local daemon.
pub fn build(manifest: &Manifest, cfg: &config::Docker) -> Result<(), Error> {
    let variants = cfg.variants.join(" ");
    for arch in manifest.arch_names() {
        info!("Building docker images for {arch}");
        let env = [
            ("DOCKER_BUILD_VARIANTS", variants.clone()),
            ("DOCKER_ARCHITECTURES", format!("linux/{arch}")),
            ("TARGET_ARCH", arch.clone()),
        ];
        match manifest.docker_output {
            DockerOutput::Tar => {
                make(manifest, Repo::Istio, &env, &["docker.save"])?;
                let built = manifest.repo_arch_out_dir(Repo::Istio, &arch).join("docker");
                copy_tarballs(&built, &manifest.out_dir().join("docker"), &arch)?;
            }
            DockerOutput::Context => make(manifest, Repo::Istio, &env, &["docker"])?,
        }
    }
    Ok(())
}

fn copy_tarballs(src: &Path, dst: &Path, arch: &str) -> Result<(), Error> {
    for name in files::read_dir_names(src)? {
        let target = arch_file_name(&name, arch);
        files::copy_file(&src.join(&name), &dst.join(target))?;
    }
    Ok(())
}

/// `pilot.tar.gz` built for arm64 becomes `pilot-arm64.tar.gz`. Names without the
/// tarball suffix are kept so publishing rejects them.
pub fn arch_file_name(name: &str, arch: &str) -> String {
    match name.strip_suffix(TARBALL_SUFFIX) {
        Some(stem) if arch != DEFAULT_ARCH => format!("{stem}-{arch}{TARBALL_SUFFIX}"),
        _ => name.to_string(),
    }
}
