//! HTTP client for the cluster management API, used to inspect and create scopes and collections.

use reqwest::{header::CONTENT_TYPE, Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::{form_urlencoded, Url};

use crate::{
    config::Config,
    store::{ScopeSpec, StoreError},
};

#[derive(Deserialize)]
struct Manifest {
    scopes: Vec<ManifestScope>,
}

#[derive(Deserialize)]
struct ManifestScope {
    name: String,
    #[serde(default)]
    collections: Vec<ManifestCollection>,
}

#[derive(Deserialize)]
struct ManifestCollection {
    name: String,
}

impl From<ManifestScope> for ScopeSpec {
    fn from(ManifestScope { name, collections }: ManifestScope) -> Self {
        ScopeSpec {
            name,
            collections: collections.into_iter().map(|c| c.name).collect(),
        }
    }
}

pub struct ManagementClient {
    client: Client,
    base: Url,
    bucket: String,
    username: String,
    password: String,
}

impl ManagementClient {
    pub fn new(config: &Config) -> Result<Self, StoreError> {
        let host = &config.endpoint.host;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.clone()
        };
        let base = Url::parse(&format!(
            "http://{host}:{}/",
            config.endpoint.management_port
        ))
        .map_err(|e| StoreError::Protocol(format!("management url: {e}")))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Protocol(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base,
            bucket: config.bucket.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// `/pools/default/buckets/{bucket}/scopes` followed by `extra` segments.
    fn scopes_url(&self, extra: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Protocol(format!("{} can't be a base", self.base)))?
            .clear()
            .extend(["pools", "default", "buckets", self.bucket.as_str(), "scopes"])
            .extend(extra);
        Ok(url)
    }

    #[instrument(skip(self))]
    pub async fn scopes(&self) -> Result<Vec<ScopeSpec>, StoreError> {
        let response = self
            .client
            .get(self.scopes_url(&[])?)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response, "scopes").await?;

        let manifest: Manifest = response
            .json()
            .await
            .map_err(|e| StoreError::Protocol(format!("invalid scopes manifest: {e}")))?;
        Ok(manifest.scopes.into_iter().map(ScopeSpec::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn create_scope(&self, scope: &str) -> Result<(), StoreError> {
        self.create(self.scopes_url(&[])?, scope, format!("scope '{scope}'"))
            .await
    }

    #[instrument(skip(self))]
    pub async fn create_collection(&self, scope: &str, collection: &str) -> Result<(), StoreError> {
        self.create(
            self.scopes_url(&[scope, "collections"])?,
            collection,
            format!("collection '{scope}.{collection}'"),
        )
        .await
    }

    async fn create(&self, url: Url, name: &str, what: String) -> Result<(), StoreError> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("name", name)
            .finish();

        let response = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;
        check(response, &what).await?;
        debug!("Created {what}");
        Ok(())
    }
}

fn transport_error(error: reqwest::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

async fn check(response: Response, what: &str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    Err(classify(status, what, &text))
}

fn classify(status: StatusCode, what: &str, text: &str) -> StoreError {
    match status {
        StatusCode::BAD_REQUEST if text.contains("already exists") => {
            StoreError::AlreadyExists(what.to_owned())
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::PermissionDenied(format!("{what}: {text}"))
        }
        status if status.is_server_error() => {
            StoreError::Unavailable(format!("{what}: status {status}: {text}"))
        }
        status => StoreError::Protocol(format!("{what}: status {status}: {text}")),
    }
}
