use crate::command::{self, Cmd};
use crate::files;
use crate::model::{DockerOutput, Manifest, Repo};
use log::{info, warn};

const DEFAULT_NAMESPACE: &str = "https://storage.googleapis.com/istio-release/releases";

fn namespace(manifest: &Manifest, file: &str) -> String {
    let base = manifest
        .bill_of_materials_uri
        .as_deref()
        .unwrap_or(DEFAULT_NAMESPACE)
        .trim_end_matches('/');
    format!("{base}/{}/{file}", manifest.version)
}

/// Generate SPDX documents for the release artifacts and the anchor sources.
///
/// The release document needs image tarballs, so it is skipped when images were
/// loaded into the local daemon instead.
pub fn generate(manifest: &Manifest) -> Result<(), command::Error> {
    let out = manifest.out_dir();
    if manifest.docker_output == DockerOutput::Tar {
        info!("Generating bill of materials for release artifacts");
        let file = format!("istio-release-{}.spdx", manifest.version);
        let images = files::list_files(&out.join("docker"))
            .unwrap_or_else(|err| {
                warn!("No docker images for the bill of materials: {err}");
                Vec::new()
            })
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        bom(&format!("Istio Release {}", manifest.version), &namespace(manifest, &file))
            .args(["--ignore", "licenses,'*.sha256',docker", "--dirs"])
            .arg(&out)
            .args(["--image-archive", images.as_str(), "--output"])
            .arg(out.join(&file))
            .run()?;
    }

    info!("Generating bill of materials for istio source code");
    let file = format!("istio-source-{}.spdx", manifest.version);
    bom(&format!("Istio Source {}", manifest.version), &namespace(manifest, &file))
        .arg("--dirs")
        .arg(manifest.repo_dir(Repo::Istio))
        .arg("--output")
        .arg(out.join(&file))
        .run()
}

fn bom(name: &str, namespace: &str) -> Cmd {
    Cmd::new("bom").args([
        "--log-level",
        "error",
        "generate",
        "--name",
        name,
        "--namespace",
        namespace,
    ])
}
