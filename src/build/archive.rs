use super::{make, Error};
use crate::command::Cmd;
use crate::config;
use crate::files;
use crate::model::{Manifest, Repo};
use log::info;
use regex::Regex;
use std::path::PathBuf;

pub const COMPLETION_FILES: [&str; 2] = ["istioctl.bash", "_istioctl"];

fn is_windows(platform: &str) -> bool {
    platform.starts_with("win")
}

/// File name of the istioctl binary built for `platform`.
pub fn istioctl_binary(platform: &str) -> String {
    if is_windows(platform) {
        format!("istioctl-{platform}.exe")
    } else {
        format!("istioctl-{platform}")
    }
}

/// File name of the release archive for `platform`. Windows gets a zip.
pub fn archive_name(version: &str, platform: &str) -> String {
    if is_windows(platform) {
        format!("istio-{version}-{platform}.zip")
    } else {
        format!("istio-{version}-{platform}.tar.gz")
    }
}

/// Assemble and compress the downloadable release for every platform.
///
/// Each archive holds the same files except for the istioctl binary.
pub fn build(manifest: &Manifest, cfg: &config::Archive) -> Result<(), Error> {
    make(
        manifest,
        Repo::Istio,
        &[],
        &["istioctl-all", "istioctl.completion"],
    )?;

    let patterns = cfg
        .include_patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| Error::Pattern {
                pattern: pattern.clone(),
                err,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let anchor = manifest.repo_dir(Repo::Istio);
    let release_name = format!("istio-{}", manifest.version);
    for platform in &cfg.platforms {
        let staging = manifest.work_dir().join("archive").join(platform);
        let out = staging.join(&release_name);
        std::fs::create_dir_all(&out).map_err(|err| Error::Io {
            path: out.clone(),
            err,
        })?;

        for file in &cfg.direct_copies {
            files::copy_file(&anchor.join(file), &out.join(file))?;
        }
        for dir in &cfg.filtered_dirs {
            files::copy_dir_matching(&anchor.join(dir), &out.join(dir), &patterns)?;
        }
        for completion in COMPLETION_FILES {
            files::copy_file(
                &manifest.go_out_dir().join(completion),
                &out.join("tools").join(completion),
            )?;
        }
        manifest.write(&out)?;

        let binary = istioctl_binary(platform);
        files::copy_file(
            &manifest.go_out_dir().join(&binary),
            &out.join("bin").join(&binary),
        )?;

        let archive = archive_name(&manifest.version, platform);
        compress(&archive, &release_name, is_windows(platform))
            .current_dir(&staging)
            .run()?;

        let dest = manifest.out_dir().join(&archive);
        files::copy_file(&staging.join(&archive), &dest)?;
        files::create_sha(&dest)?;
        info!("Packaged {}", dest.display());
    }
    Ok(())
}

fn compress(archive: &str, dir: &str, zip: bool) -> Cmd {
    if zip {
        Cmd::new("zip").args(["-rq", archive, dir])
    } else {
        Cmd::new("tar").args(["-czf", archive, dir])
    }
}

/// Paths every platform archive is expected to contain, relative to its root.
pub fn expected_contents(platform: &str) -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("bin").join(istioctl_binary(platform)),
        PathBuf::from("manifest.yaml"),
    ];
    paths.extend(
        COMPLETION_FILES
            .iter()
            .map(|file| PathBuf::from("tools").join(file)),
    );
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_archives_are_zipped() {
        assert_eq!(archive_name("1.2.3", "win"), "istio-1.2.3-win.zip");
        assert_eq!(archive_name("1.2.3", "linux-arm64"), "istio-1.2.3-linux-arm64.tar.gz");
        assert_eq!(istioctl_binary("win"), "istioctl-win.exe");
        assert_eq!(istioctl_binary("osx"), "istioctl-osx");
    }

    #[test]
    fn expected_archive_contents() {
        let paths = expected_contents("osx-arm64");
        assert!(paths.contains(&PathBuf::from("bin/istioctl-osx-arm64")));
        assert!(paths.contains(&PathBuf::from("tools/_istioctl")));
    }
}
