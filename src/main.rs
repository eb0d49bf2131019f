/// Release builder
use clap::{ArgAction, Parser, Subcommand};
use log::{error, info};
use rb::manifest::InputManifest;
use rb::model::Manifest;
use rb::{auth, branch, build, config, manifest, publish, source, validate};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Build, validate, publish and branch releases assembled from many repositories.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the release builder configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve every dependency of a manifest and build the release.
    Build {
        /// The manifest to build.
        #[arg(long)]
        manifest: PathBuf,

        /// Report vulnerability scanning failures without failing the build.
        #[arg(long)]
        ignore_vulnerability: bool,
    },
    /// Publish a built release.
    Publish {
        /// Directory of the release to publish.
        #[arg(long)]
        release: PathBuf,

        /// Docker hub to push images to, e.g. docker.io/istio.
        #[arg(long = "dockerhub")]
        docker_hub: Option<String>,

        /// Tags to push images with. Defaults to the release version.
        #[arg(long = "dockertags", value_delimiter = ',')]
        docker_tags: Vec<String>,

        /// GCS bucket and prefix to upload the release archive to, e.g. istio-release/releases.
        #[arg(long = "gcsbucket")]
        gcs_bucket: Option<String>,

        /// Aliases such as `latest` that point at this release inside the GCS bucket.
        #[arg(long = "gcsaliases", value_delimiter = ',')]
        gcs_aliases: Vec<String>,

        /// GCS bucket and prefix holding the helm repository.
        #[arg(long = "helmbucket")]
        helm_bucket: Option<String>,

        /// OCI registry to push helm charts to.
        #[arg(long = "helmhub")]
        helm_hub: Option<String>,

        /// GitHub organization to tag and release in.
        #[arg(long = "github")]
        github_org: Option<String>,

        /// File containing a GitHub token. Falls back to GITHUB_TOKEN.
        #[arg(long = "githubtoken")]
        github_token: Option<PathBuf>,

        /// File containing a Grafana token. Falls back to GRAFANA_TOKEN.
        #[arg(long = "grafanatoken")]
        grafana_token: Option<PathBuf>,

        /// Cosign key to sign pushed images with.
        #[arg(long = "cosignkey")]
        cosign_key: Option<String>,
    },
    /// Check that a built release is complete.
    Validate {
        /// Directory of the release to validate.
        #[arg(long)]
        release: PathBuf,
    },
    /// Run one step of cutting release branches.
    Branch {
        /// The manifest naming the repositories to branch.
        #[arg(long)]
        manifest: PathBuf,

        /// Branch step to run, 1 to 5.
        #[arg(long)]
        step: u32,

        /// Only make local changes; push nothing and open no pull requests.
        #[arg(long = "dryrun", default_value_t = true, action = ArgAction::Set)]
        dry_run: bool,

        /// File containing a GitHub token. Falls back to GITHUB_TOKEN.
        #[arg(long = "githubtoken")]
        github_token: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    Config(#[from] config::Error),

    #[error("manifest: {0}")]
    Manifest(#[from] manifest::Error),

    #[error("sources: {0}")]
    Source(#[from] source::Error),

    #[error("build: {0}")]
    Build(#[from] build::Error),

    #[error("publish: {0}")]
    Publish(#[from] publish::Error),

    #[error("validate: {0}")]
    Validate(#[from] validate::Error),

    #[error("branch: {0}")]
    Branch(#[from] branch::Error),

    #[error("credentials: {0}")]
    Auth(#[from] auth::Error),
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// If a configuration file name is not set explicitly, `rb.toml` in the
/// current directory is used when it exists.
fn read_config(args: &Cli) -> Result<config::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "rb.toml";

    let config_file = match &args.config {
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            path.is_file().then(|| path.to_path_buf())
        }
        Some(c) => Some(c.clone()),
    };

    Ok(match config_file {
        Some(config_file) => config::File::default_with_user_config_file(&config_file)?,
        None => config::File::default(),
    })
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {err}");
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    let args = Cli::parse();
    let cfg = read_config(&args)?;

    match args.command {
        Commands::Build {
            manifest,
            ignore_vulnerability,
        } => {
            let mut manifest = prepare(&manifest)?;
            manifest.ignore_vulnerability |= ignore_vulnerability;
            source::standardize_manifest(&mut manifest)?;
            build::build(&manifest, &cfg).await?;
            info!("Built release at {}", manifest.out_dir().display());
            Ok(())
        }
        Commands::Publish {
            release,
            docker_hub,
            docker_tags,
            gcs_bucket,
            gcs_aliases,
            helm_bucket,
            helm_hub,
            github_org,
            github_token,
            grafana_token,
            cosign_key,
        } => {
            let manifest = Manifest::read_release(&release)?;
            info!("Publishing release {} from {}", manifest.version, release.display());
            let options = publish::Options {
                docker_hub,
                docker_tags,
                gcs_bucket,
                gcs_aliases,
                helm_bucket,
                helm_hub,
                github_org,
                github_token,
                grafana_token,
                cosign_key,
            };
            publish::publish(&manifest, &options, &cfg).await?;
            info!("Published release {}", manifest.version);
            Ok(())
        }
        Commands::Validate { release } => {
            validate::validate(&release, &cfg)?;
            Ok(())
        }
        Commands::Branch {
            manifest,
            step,
            dry_run,
            github_token,
        } => {
            let step = branch::Step::try_from(step)?;
            let manifest = prepare(&manifest)?;
            let token = auth::token_from_file_or_env(github_token.as_deref(), "GITHUB_TOKEN")?;
            branch::branch(&manifest, step, dry_run, &token, &cfg.branch).await?;
            Ok(())
        }
    }
}

/// Read an input manifest, then fetch its sources into a fresh working directory.
fn prepare(path: &Path) -> Result<Manifest, Error> {
    let input = InputManifest::read(path)?;
    let manifest = Manifest::from_input(input)?;
    source::setup_work_dir(&manifest.directory)?;
    source::resolve_sources(&manifest)?;
    info!(
        "Fetched all sources and set up working directory at {}",
        manifest.work_dir().display()
    );
    Ok(manifest)
}
