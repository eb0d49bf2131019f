//! Google Cloud Storage: release archive upload and the optimistic concurrency
//! read-modify-write cycle for shared index objects.
use crate::auth;
use crate::files;
use crate::model::Manifest;
use log::{info, warn};
use reqwest::StatusCode;
use std::path::Path;
use thiserror::Error;

const API: &str = "https://storage.googleapis.com/storage/v1/b";
const UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1/b";

/// Clients must see a new index immediately, even for releases published minutes apart.
pub const NO_CACHE: &str = "no-cache, max-age=0, no-transform";

#[derive(Error, Debug)]
pub enum Error {
    #[error("gs://{bucket}/{object}: {err}")]
    Request {
        bucket: String,
        object: String,
        err: reqwest::Error,
    },

    #[error("gs://{bucket}/{object}: unexpected status {status}: {body}")]
    Status {
        bucket: String,
        object: String,
        status: u16,
        body: String,
    },

    #[error("gs://{bucket}/{object} changed since it was read")]
    PreconditionFailed { bucket: String, object: String },

    #[error("gs://{bucket}/{object}: max conflicts attempted ({attempts})")]
    MaxConflicts {
        bucket: String,
        object: String,
        attempts: u32,
    },

    #[error("mutate {object}: {source}")]
    Mutate {
        object: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{path}: {err}")]
    Io {
        path: std::path::PathBuf,
        err: std::io::Error,
    },

    #[error("authenticate: {0}")]
    Auth(#[from] auth::Error),

    #[error(transparent)]
    Files(#[from] files::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub generation: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
    /// Write only if the object is at this generation. Zero means it must not exist.
    pub if_generation_match: Option<i64>,
    pub cache_control: Option<String>,
    pub content_type: Option<String>,
}

#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    /// Read an object. A missing object is `None`.
    async fn read(&self, bucket: &str, name: &str) -> Result<Option<Object>, Error>;

    /// Write an object. A failed generation precondition is `Error::PreconditionFailed`.
    async fn write(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
        options: &WriteOptions,
    ) -> Result<(), Error>;
}

/// The GCS JSON API.
pub struct GcsClient {
    client: reqwest::Client,
    token: String,
}

impl GcsClient {
    pub async fn new() -> Result<Self, Error> {
        Ok(Self {
            client: reqwest::Client::new(),
            token: auth::google_token().await?,
        })
    }

    fn object_url(base: &str, bucket: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{base}/{}/o/{}", encode(bucket), encode(name)),
            None => format!("{base}/{}/o", encode(bucket)),
        }
    }

    fn request_err<'a>(bucket: &'a str, name: &'a str) -> impl FnOnce(reqwest::Error) -> Error + 'a {
        move |err| Error::Request {
            bucket: bucket.to_string(),
            object: name.to_string(),
            err,
        }
    }

    async fn status_err(bucket: &str, name: &str, response: reqwest::Response) -> Error {
        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Error::PreconditionFailed {
                bucket: bucket.to_string(),
                object: name.to_string(),
            };
        }
        Error::Status {
            bucket: bucket.to_string(),
            object: name.to_string(),
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }
    }

    /// One `uploadType=multipart` request: metadata and data land together.
    fn upload_request(
        &self,
        bucket: &str,
        name: &str,
        data: &[u8],
        options: &WriteOptions,
    ) -> Result<reqwest::Request, Error> {
        let mut query = vec![("uploadType", "multipart".to_string())];
        if let Some(generation) = options.if_generation_match {
            query.push(("ifGenerationMatch", generation.to_string()));
        }
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let mut metadata = serde_json::json!({ "name": name, "contentType": content_type });
        if let Some(cache_control) = &options.cache_control {
            metadata["cacheControl"] = cache_control.as_str().into();
        }
        let (multipart_type, body) = related_body(&metadata, content_type, data);
        self.client
            .post(Self::object_url(UPLOAD_API, bucket, None))
            .query(&query)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, multipart_type)
            .body(body)
            .build()
            .map_err(Self::request_err(bucket, name))
    }
}

impl ObjectStore for GcsClient {
    async fn read(&self, bucket: &str, name: &str) -> Result<Option<Object>, Error> {
        let url = Self::object_url(API, bucket, Some(name));
        let response = self
            .client
            .get(url)
            .query(&[("alt", "media")])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::request_err(bucket, name))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::status_err(bucket, name, response).await);
        }
        let generation = response
            .headers()
            .get("x-goog-generation")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let data = response
            .bytes()
            .await
            .map_err(Self::request_err(bucket, name))?;
        Ok(Some(Object {
            generation,
            data: data.to_vec(),
        }))
    }

    async fn write(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
        options: &WriteOptions,
    ) -> Result<(), Error> {
        let request = self.upload_request(bucket, name, &data, options)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(Self::request_err(bucket, name))?;
        if !response.status().is_success() {
            return Err(Self::status_err(bucket, name, response).await);
        }
        Ok(())
    }
}


/// A `multipart/related` body: JSON metadata first, then the media.
fn related_body(metadata: &serde_json::Value, content_type: &str, data: &[u8]) -> (String, Vec<u8>) {
    let boundary = format!("rb-{}", sha256::digest(data));
    let mut body = format!(
        "--{boundary}\r\n\
         Content-Type: application/json; charset=UTF-8\r\n\r\n\
         {metadata}\r\n\
         --{boundary}\r\n\
         Content-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/related; boundary={boundary}"), body)
}

/// Percent-encode a path segment. Object names keep their `/` only as `%2F`.
fn encode(segment: &str) -> String {
    segment
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

/// Split `bucket/some/prefix` into the bucket and the object prefix.
pub fn split_bucket(location: &str) -> (&str, &str) {
    let location = location.trim_start_matches("gs://");
    location.split_once('/').unwrap_or((location, ""))
}

/// Join object name parts with `/`, skipping empty ones.
pub fn object_name(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Pull `name` into `local_dir`, run `mutate` on the local copy and write it back,
/// conditioned on the generation that was read.
///
/// A concurrent writer restarts the cycle. After `attempts` conflicts the object is
/// given up on with `Error::MaxConflicts`. A missing object counts as generation zero
/// with no local file, and is created only if it still does not exist.
pub async fn mutate_object<S, F, E>(
    store: &S,
    local_dir: &Path,
    bucket: &str,
    prefix: &str,
    name: &str,
    attempts: u32,
    mut mutate: F,
) -> Result<(), Error>
where
    S: ObjectStore,
    F: FnMut(&Path) -> Result<(), E>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let object = object_name(&[prefix, name]);
    let local = local_dir.join(name);
    let io = |err| Error::Io {
        path: local.clone(),
        err,
    };

    for attempt in 1..=attempts {
        let generation = match store.read(bucket, &object).await? {
            Some(existing) => {
                info!("Object {object} currently has generation {}", existing.generation);
                std::fs::write(&local, &existing.data).map_err(io)?;
                existing.generation
            }
            None => {
                warn!("Object {object} does not exist yet");
                if local.exists() {
                    std::fs::remove_file(&local).map_err(io)?;
                }
                0
            }
        };

        mutate(&local).map_err(|err| Error::Mutate {
            object: object.clone(),
            source: err.into(),
        })?;

        let data = std::fs::read(&local).map_err(io)?;
        let options = WriteOptions {
            if_generation_match: Some(generation),
            cache_control: Some(NO_CACHE.to_string()),
            content_type: Some(content_type(name).to_string()),
        };
        match store.write(bucket, &object, data, &options).await {
            Ok(()) => {
                info!("Wrote gs://{bucket}/{object}");
                return Ok(());
            }
            Err(Error::PreconditionFailed { .. }) => {
                warn!("Write conflict on {object} (attempt {attempt}/{attempts}), trying again");
            }
            Err(err) => return Err(err),
        }
    }
    Err(Error::MaxConflicts {
        bucket: bucket.to_string(),
        object,
        attempts,
    })
}

fn content_type(name: &str) -> &'static str {
    if name.ends_with(".yaml") || name.ends_with(".yml") {
        // https://helm.sh/docs/topics/chart_repository/#ordinary-web-servers
        "text/yaml"
    } else {
        "application/octet-stream"
    }
}

/// Upload every file of the release to `{prefix}/{version}/...` and point each alias
/// object at the version.
pub async fn publish_archive<S: ObjectStore>(
    store: &S,
    manifest: &Manifest,
    bucket: &str,
    prefix: &str,
    aliases: &[String],
) -> Result<(), Error> {
    let release = &manifest.directory;
    for path in files::list_files(release)? {
        let Ok(rel) = path.strip_prefix(release) else {
            continue;
        };
        let rel = rel.to_string_lossy();
        let object = object_name(&[prefix, &manifest.version, &rel]);
        let data = std::fs::read(&path).map_err(|err| Error::Io {
            path: path.clone(),
            err,
        })?;
        store
            .write(bucket, &object, data, &WriteOptions::default())
            .await?;
        info!("Wrote {} to gs://{bucket}/{object}", path.display());
    }

    for alias in aliases {
        let object = object_name(&[prefix, alias]);
        let options = WriteOptions {
            cache_control: Some(NO_CACHE.to_string()),
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        store
            .write(bucket, &object, manifest.version.as_bytes().to_vec(), &options)
            .await?;
        info!("Wrote {alias} to gs://{bucket}/{object}");
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fake::FakeStore;
    use super::*;

    #[test]
    fn upload_carries_cache_control_in_the_same_request() {
        let client = GcsClient {
            client: reqwest::Client::new(),
            token: "token".into(),
        };
        let options = WriteOptions {
            if_generation_match: Some(0),
            cache_control: Some(NO_CACHE.into()),
            content_type: Some("text/yaml".into()),
        };
        let request = client
            .upload_request("istio-release", "charts/index.yaml", b"apiVersion: v1\n", &options)
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        let query: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert!(query.contains(&("uploadType".into(), "multipart".into())));
        assert!(query.contains(&("ifGenerationMatch".into(), "0".into())));
        let content_type = request.headers()[reqwest::header::CONTENT_TYPE]
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("multipart/related; boundary="), "{content_type}");

        let body = String::from_utf8(request.body().unwrap().as_bytes().unwrap().to_vec()).unwrap();
        assert!(body.contains(r#""cacheControl":"no-cache, max-age=0, no-transform""#), "{body}");
        assert!(body.contains(r#""name":"charts/index.yaml""#), "{body}");
        assert!(body.contains("Content-Type: text/yaml\r\n\r\napiVersion: v1\n\r\n"), "{body}");
    }

    fn append(line: &'static str) -> impl FnMut(&Path) -> Result<(), std::io::Error> {
        move |path| {
            let mut contents = std::fs::read_to_string(path).unwrap_or_default();
            contents.push_str(line);
            std::fs::write(path, contents)
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_with_a_fresh_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FakeStore::with_conflicts(3);
        store.insert("istio-release", "charts/index.yaml", 7, "entries:\n");

        mutate_object(
            &store,
            dir.path(),
            "istio-release",
            "charts",
            "index.yaml",
            10,
            append("  base: []\n"),
        )
        .await
        .unwrap();

        assert_eq!(store.reads(), 4);
        let object = store.get("istio-release", "charts/index.yaml").unwrap();
        assert_eq!(object.generation, 8);
        assert_eq!(object.data, b"entries:\n  base: []\n");

        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.len(), 4);
        for (_, options) in writes.iter() {
            assert_eq!(options.if_generation_match, Some(7));
            assert_eq!(options.cache_control.as_deref(), Some(NO_CACHE));
            assert_eq!(options.content_type.as_deref(), Some("text/yaml"));
        }
    }

    #[tokio::test]
    async fn persistent_conflicts_give_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = FakeStore::with_conflicts(u32::MAX);
        let result = mutate_object(
            &store,
            dir.path(),
            "istio-release",
            "",
            "index.yaml",
            10,
            append("x"),
        )
        .await;
        assert!(matches!(
            result,
            Err(Error::MaxConflicts { attempts: 10, .. })
        ));
        assert_eq!(store.reads(), 10);
    }

    #[tokio::test]
    async fn missing_object_is_created() {
        let dir = tempfile::tempdir().unwrap();
        // A stale local copy must not leak into the new object
        std::fs::write(dir.path().join("index.yaml"), "stale\n").unwrap();
        let store = FakeStore::default();

        let mut seen = None;
        mutate_object(
            &store,
            dir.path(),
            "istio-release",
            "charts",
            "index.yaml",
            10,
            |path: &Path| {
                seen = Some(path.exists());
                std::fs::write(path, "entries: {}\n")
            },
        )
        .await
        .unwrap();

        assert_eq!(seen, Some(false));
        let writes = store.writes.lock().unwrap();
        assert_eq!(writes[0].1.if_generation_match, Some(0));
        assert_eq!(
            store.get("istio-release", "charts/index.yaml").unwrap().data,
            b"entries: {}\n"
        );
    }

    #[tokio::test]
    async fn mutate_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = FakeStore::default();
        let result = mutate_object(
            &store,
            dir.path(),
            "b",
            "",
            "index.yaml",
            10,
            |_: &Path| Err(std::io::Error::other("helm exploded")),
        )
        .await;
        assert!(matches!(result, Err(Error::Mutate { .. })));
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn archive_and_aliases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("deb")).unwrap();
        std::fs::write(dir.path().join("manifest.yaml"), "version: 1.2.3\n").unwrap();
        std::fs::write(dir.path().join("deb/istio-sidecar.deb"), "deb").unwrap();
        let manifest = Manifest {
            version: "1.2.3".into(),
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = FakeStore::default();
        publish_archive(&store, &manifest, "istio-build", "releases", &["latest".into()])
            .await
            .unwrap();

        assert!(store.get("istio-build", "releases/1.2.3/manifest.yaml").is_some());
        assert!(store
            .get("istio-build", "releases/1.2.3/deb/istio-sidecar.deb")
            .is_some());
        assert_eq!(
            store.get("istio-build", "releases/latest").unwrap().data,
            b"1.2.3"
        );
    }

    #[test]
    fn object_urls_encode_the_name() {
        assert_eq!(
            GcsClient::object_url(API, "istio-release", Some("charts/index.yaml")),
            "https://storage.googleapis.com/storage/v1/b/istio-release/o/charts%2Findex.yaml"
        );
        assert_eq!(
            GcsClient::object_url(UPLOAD_API, "istio-release", None),
            "https://storage.googleapis.com/upload/storage/v1/b/istio-release/o"
        );
    }

    #[test]
    fn bucket_and_prefix() {
        assert_eq!(split_bucket("istio-release/charts"), ("istio-release", "charts"));
        assert_eq!(split_bucket("gs://istio-build/dev/a"), ("istio-build", "dev/a"));
        assert_eq!(split_bucket("istio-release"), ("istio-release", ""));
    }

    #[test]
    fn object_names() {
        assert_eq!(object_name(&["", "index.yaml"]), "index.yaml");
        assert_eq!(object_name(&["charts/", "index.yaml"]), "charts/index.yaml");
        assert_eq!(object_name(&["a/b", "1.0", "c/d.tgz"]), "a/b/1.0/c/d.tgz");
    }
}
