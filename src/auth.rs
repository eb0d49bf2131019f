use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("auth error: {0}")]
    AuthError(#[from] google_cloud_auth::error::Error),

    #[error("auth token error: {0}")]
    AuthTokenError(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("unexpected token response ({0}): {1}")]
    Deserialize(u16, String),

    #[error("read token file {path}: {err}")]
    TokenFile { path: PathBuf, err: std::io::Error },
}

/// Read a token from `file`, or from the environment variable `var` when no file is given.
/// A missing variable yields an empty token.
pub fn token_from_file_or_env(file: Option<&Path>, var: &str) -> Result<String, Error> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .map(|token| token.trim().to_string())
            .map_err(|err| Error::TokenFile {
                path: path.to_path_buf(),
                err,
            }),
        None => Ok(std::env::var(var).unwrap_or_default()),
    }
}

/// OAuth2 access token for Google Cloud Storage and registries.
///
/// Inside GitHub Actions with `WORKLOAD_IDENTITY_POOL` set, the job's OIDC token is exchanged
/// through workload identity federation. Otherwise the default credential chain is used.
pub async fn google_token() -> Result<String, Error> {
    let workload_identity_pool = std::env::var("WORKLOAD_IDENTITY_POOL").ok();
    let github_id_token_url = std::env::var("ACTIONS_ID_TOKEN_REQUEST_URL").ok();
    let github_token = std::env::var("ACTIONS_ID_TOKEN_REQUEST_TOKEN").ok();

    match (workload_identity_pool, github_id_token_url, github_token) {
        (Some(workload_identity_pool), Some(github_id_token_url), Some(github_token)) => {
            let id_token =
                github_id_token(&github_id_token_url, &github_token, &workload_identity_pool).await?;
            exchange_federated_token(&workload_identity_pool, &id_token.value)
                .await
                .map(|token| token.access_token)
        }
        (_, _, _) => default_credentials_token().await,
    }
}

async fn default_credentials_token() -> Result<String, Error> {
    debug!("Exchanging Google credential file for an oauth2 token");

    use google_cloud_auth::{project::Config, token::DefaultTokenSourceProvider};
    use google_cloud_token::TokenSourceProvider as _;

    let audience = "https://oauth2.googleapis.com/token/";
    let scopes = ["https://www.googleapis.com/auth/cloud-platform"];

    let config = Config::default()
        .with_audience(audience)
        .with_scopes(&scopes);
    let tsp = DefaultTokenSourceProvider::new(config)
        .await
        .map_err(Error::AuthError)?;
    let ts = tsp.token_source();
    let token = ts.token().await.map_err(Error::AuthTokenError)?;
    Ok(strip_bearer(&token).to_string())
}

fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenExchangeRequest<'a> {
    grant_type: &'a str,
    audience: &'a str,
    scope: &'a str,
    requested_token_type: &'a str,
    subject_token: &'a str,
    subject_token_type: &'a str,
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GitHubTokenResponse {
    value: String,
}

async fn exchange_federated_token(
    workload_identity_pool: &str,
    github_id_token: &str,
) -> Result<TokenExchangeResponse, Error> {
    debug!("Exchanging federated GitHub token for an oauth2 token");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    let request = TokenExchangeRequest {
        audience: &format!("//iam.googleapis.com/{workload_identity_pool}"),
        grant_type: "urn:ietf:params:oauth:grant-type:token-exchange",
        requested_token_type: "urn:ietf:params:oauth:token-type:access_token",
        scope: "https://www.googleapis.com/auth/cloud-platform",
        subject_token_type: "urn:ietf:params:oauth:token-type:jwt",
        subject_token: github_id_token,
    };

    let resp = client
        .post("https://sts.googleapis.com/v1/token")
        .json(&request)
        .send()
        .await?;
    decode(resp).await
}

async fn github_id_token(
    url: &str,
    bearer_token: &str,
    workload_identity_pool: &str,
) -> Result<GitHubTokenResponse, Error> {
    debug!("Getting GitHub actions id_token");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;

    let resp = client
        .get(url)
        .bearer_auth(bearer_token)
        .query(&[(
            "audience",
            format!("https://iam.googleapis.com/{workload_identity_pool}"),
        )])
        .send()
        .await?;
    decode(resp).await
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|_| Error::Deserialize(status, String::from_utf8_lossy(&bytes).to_string()))
}
