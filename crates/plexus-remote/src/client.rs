//! HTTP client for the repository protocol
//!
//! Endpoints, relative to a repository's base URL:
//!
//! | Path                                  | Response                     |
//! |---------------------------------------|------------------------------|
//! | `catalog`                             | list of catalog entries      |
//! | `plugin/{pid}`                        | single catalog entry         |
//! | `plugin/{pid}/versions`               | list of versions             |
//! | `plugin/{pid}/{version}/download`     | artifact bytes               |
//! | `plugin/{pid}/{version}/signature`    | detached signature document  |
//! | `search?q=..&category=..`             | list of catalog entries      |

use crate::config::DownloadConfig;
use crate::repository::{RemotePluginMetadata, Repository};
use crate::signature::DetachedSignature;
use crate::url_policy::UrlPolicy;
use plexus_core::{PluginError, Result, Version};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

/// Map a transport error to a host error
pub fn http_error(error: reqwest::Error) -> PluginError {
    if error.is_timeout() {
        PluginError::timeout(format!("Request timed out: {error}"))
    } else if error.is_redirect() {
        PluginError::security(format!("Redirect refused: {error}"))
    } else {
        PluginError::network(format!("Request failed: {error}"))
    }
}

/// Map a non-success status to a host error
pub fn status_error(status: StatusCode, url: &Url) -> PluginError {
    match status {
        StatusCode::NOT_FOUND => PluginError::not_found(format!("{url}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PluginError::new(
            plexus_core::ErrorKind::PermissionDenied,
            format!("Repository refused access ({status}): {url}"),
        ),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => PluginError::new(
            plexus_core::ErrorKind::ResourceUnavailable,
            format!("Repository unavailable ({status}): {url}"),
        ),
        _ => PluginError::network(format!("HTTP error {status}: {url}")),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Plugins { plugins: Vec<T> },
    Versions { versions: Vec<T> },
    Results { results: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Bare(v)
            | Listing::Plugins { plugins: v }
            | Listing::Versions { versions: v }
            | Listing::Results { results: v } => v,
        }
    }
}

/// Client for the repository protocol
#[derive(Debug, Clone)]
pub struct RepositoryClient {
    http: reqwest::Client,
    policy: UrlPolicy,
    read_timeout: std::time::Duration,
}

impl RepositoryClient {
    /// Build a client honouring the download settings and URL policy
    pub fn new(config: &DownloadConfig, policy: UrlPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .redirect(policy.redirect_policy())
            .build()
            .map_err(|e| PluginError::network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            policy,
            read_timeout: config.read_timeout,
        })
    }

    /// URL admission policy
    pub fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    /// A GET request carrying the repository's credentials
    ///
    /// No overall timeout is set; callers bound transfers themselves.
    pub fn get(&self, repository: &Repository, url: &Url) -> Result<RequestBuilder> {
        self.policy.check(url)?;
        let mut request = self.http.get(url.clone());
        if let Some(token) = &repository.auth_token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    /// Send a request and require a success status
    pub async fn send(&self, request: RequestBuilder, url: &Url) -> Result<Response> {
        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, repository: &Repository, url: Url) -> Result<T> {
        debug!(repository = %repository.id, url = %url, "Repository request");
        let request = self.get(repository, &url)?.timeout(self.read_timeout);
        let response = self.send(request, &url).await?;
        let bytes = response.bytes().await.map_err(http_error)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            PluginError::invalid_format(format!("Invalid response from {url}: {e}"))
        })
    }

    /// Fetch the catalog
    pub async fn catalog(&self, repository: &Repository) -> Result<Vec<RemotePluginMetadata>> {
        let url = repository.endpoint("catalog")?;
        let listing: Listing<RemotePluginMetadata> = self.get_json(repository, url).await?;
        Ok(listing.into_vec())
    }

    /// Fetch a single catalog entry
    pub async fn plugin(&self, repository: &Repository, plugin_id: &str) -> Result<RemotePluginMetadata> {
        let url = repository.endpoint(&format!("plugin/{plugin_id}"))?;
        self.get_json(repository, url).await
    }

    /// Versions published for a plugin, ascending
    pub async fn versions(&self, repository: &Repository, plugin_id: &str) -> Result<Vec<Version>> {
        let url = repository.endpoint(&format!("plugin/{plugin_id}/versions"))?;
        let listing: Listing<Version> = self.get_json(repository, url).await?;
        let mut versions = listing.into_vec();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    /// Detached signature for an artifact
    pub async fn signature(
        &self,
        repository: &Repository,
        plugin_id: &str,
        version: &Version,
    ) -> Result<DetachedSignature> {
        let url = repository.endpoint(&format!("plugin/{plugin_id}/{version}/signature"))?;
        self.get_json(repository, url).await
    }

    /// Search the repository
    pub async fn search(
        &self,
        repository: &Repository,
        query: &str,
        category: Option<&str>,
    ) -> Result<Vec<RemotePluginMetadata>> {
        let mut url = repository.endpoint("search")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            if let Some(category) = category {
                pairs.append_pair("category", category);
            }
        }
        let listing: Listing<RemotePluginMetadata> = self.get_json(repository, url).await?;
        Ok(listing.into_vec())
    }

    /// Where an entry's artifact is downloaded from
    pub fn download_url(&self, repository: &Repository, entry: &RemotePluginMetadata) -> Result<Url> {
        match &entry.download_url {
            Some(url) => Ok(url.clone()),
            None => repository.endpoint(&format!(
                "plugin/{}/{}/download",
                entry.id(),
                entry.version()
            )),
        }
    }
}
