use crate::config;
use crate::makevar;
use crate::model::{Manifest, Repo};
use crate::retry::{retry, Attempt, RetryError};
use log::info;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum Error {
    #[error("base image version: {0}")]
    BaseVersion(#[from] makevar::Error),

    #[error("scanning error ({image}): {progress}")]
    Server { image: String, progress: String },

    #[error("scanning error ({image}): {status}")]
    Status { image: String, status: u16 },

    #[error("image {image} has vulnerabilities:\n{body}")]
    Vulnerable { image: String, body: String },

    #[error("scanner request: {0}")]
    Request(#[source] reqwest::Error),

    #[error("scanner did not answer after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },
}

#[derive(Deserialize, Default)]
struct Response {
    #[serde(default)]
    progress: String,
    #[serde(default)]
    results: Results,
}

#[derive(Deserialize, Default)]
struct Results {
    #[serde(default)]
    status: String,
}

/// Scan the base image the release builds on for known vulnerabilities.
pub async fn scan(manifest: &Manifest, cfg: &config::Scanner) -> Result<(), Error> {
    let makefile = manifest.repo_dir(Repo::Istio).join("Makefile.core.mk");
    let base_version = makevar::read_variable(&makefile, "BASE_VERSION")?;
    let image = format!("istio/base:{base_version}");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_seconds))
        .build()
        .map_err(Error::Request)?;

    let (status, body) = retry(cfg.attempts, RETRY_DELAY, |_| {
        let request = client.get(&cfg.endpoint).query(&[("image", image.as_str())]);
        async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) if err.is_timeout() => return Attempt::Retry(Error::Request(err)),
                Err(err) => return Attempt::Abort(Error::Request(err)),
            };
            let status = response.status().as_u16();
            match response.text().await {
                Ok(body) => Attempt::Done((status, body)),
                Err(err) if err.is_timeout() => Attempt::Retry(Error::Request(err)),
                Err(err) => Attempt::Abort(Error::Request(err)),
            }
        }
    })
    .await
    .map_err(|err| match err {
        RetryError::Aborted(err) => err,
        RetryError::Exhausted { attempts, last } => Error::Exhausted {
            attempts,
            last: Box::new(last),
        },
    })?;

    evaluate(&image, status, &body)?;
    info!("Base image scan of {image} was successful");
    Ok(())
}

/// Interpret a scanner response.
fn evaluate(image: &str, status: u16, body: &str) -> Result<(), Error> {
    let response: Response = serde_json::from_str(body).unwrap_or_default();
    match status {
        200 if response.results.status == "OK" => Ok(()),
        200 => Err(Error::Vulnerable {
            image: image.to_string(),
            body: body.to_string(),
        }),
        500 => Err(Error::Server {
            image: image.to_string(),
            progress: response.progress,
        }),
        status => Err(Error::Status {
            image: image.to_string(),
            status,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &str = "istio/base:1.24-2024-10-01T00-00-00";

    #[test]
    fn clean_image_passes() {
        let body = r#"{"progress": "done", "results": {"status": "OK"}}"#;
        assert!(evaluate(IMAGE, 200, body).is_ok());
    }

    #[test]
    fn findings_include_the_report() {
        let body = r#"{"progress": "done", "results": {"status": "FAIL", "cves": ["CVE-1"]}}"#;
        let err = evaluate(IMAGE, 200, body).unwrap_err();
        assert!(matches!(err, Error::Vulnerable { .. }));
        assert!(err.to_string().contains("CVE-1"));
    }

    #[test]
    fn server_error_reports_progress() {
        let err = evaluate(IMAGE, 500, r#"{"progress": "pulling image"}"#).unwrap_err();
        assert_eq!(err.to_string(), format!("scanning error ({IMAGE}): pulling image"));
    }

    #[test]
    fn other_status_is_reported() {
        let err = evaluate(IMAGE, 404, "not found").unwrap_err();
        assert!(matches!(err, Error::Status { status: 404, .. }));
    }

    #[test]
    fn unparseable_body_is_a_finding() {
        assert!(matches!(
            evaluate(IMAGE, 200, "<html>"),
            Err(Error::Vulnerable { .. })
        ));
    }
}
