//! reqwest-backed client for the annotation REST API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    AnnotationApi, ApiError, ApiResult, NewSegment, SyncRequest, SyncResult, TrialAnnotations,
};
use crate::db::models::{Segment, SegmentPatch, TrialKey, VersionMeta};
use crate::settings::ApiSettings;

#[derive(Deserialize)]
struct VersionList {
    versions: Vec<VersionMeta>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

pub struct HttpAnnotationApi {
    base_url: Url,
    client: Client,
}

impl HttpAnnotationApi {
    pub fn new(settings: &ApiSettings, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(&settings.base_url)
            .with_context(|| format!("invalid API base url '{}'", settings.base_url))?;

        let mut headers = header::HeaderMap::new();
        if let Some(token) = &settings.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .context("API token contains invalid header characters")?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { base_url, client })
    }

    fn url(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            path.extend(["api", "annotations"]);
            path.extend(segments.iter().copied());
        }
        Ok(url)
    }

    /// `{base}/api/annotations/{fileId...}/trials/{n}/{tail...}`. File ids are
    /// storage paths, so every path component becomes its own URL segment.
    fn trial_url(&self, key: &TrialKey, tail: &[&str]) -> ApiResult<Url> {
        let trial_index = key.trial_index.to_string();
        let mut segments: Vec<&str> = key.file_id.split('/').filter(|s| !s.is_empty()).collect();
        segments.push("trials");
        segments.push(&trial_index);
        segments.extend_from_slice(tail);
        self.url(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> ApiResult<T> {
        let response = check_status(response).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|parsed| parsed.detail)
        .unwrap_or(body);

    Err(match status {
        StatusCode::CONFLICT => ApiError::Conflict(message),
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        _ => ApiError::Server {
            status: status.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl AnnotationApi for HttpAnnotationApi {
    async fn get_annotations(
        &self,
        key: &TrialKey,
        version_id: Option<&str>,
    ) -> ApiResult<TrialAnnotations> {
        let mut url = self.trial_url(key, &[])?;
        if let Some(version_id) = version_id {
            url.query_pairs_mut().append_pair("version_id", version_id);
        }
        let response = self.request(Method::GET, url).send().await?;
        self.handle_response(response).await
    }

    async fn list_versions(&self, key: &TrialKey) -> ApiResult<Vec<VersionMeta>> {
        let url = self.trial_url(key, &["versions"])?;
        let response = self.request(Method::GET, url).send().await?;
        let list: VersionList = self.handle_response(response).await?;
        Ok(list.versions)
    }

    async fn sync(&self, key: &TrialKey, request: &SyncRequest) -> ApiResult<SyncResult> {
        let url = self.trial_url(key, &["sync"])?;
        let response = self
            .request(Method::POST, url)
            .json(request)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn delete_version(&self, key: &TrialKey, version_id: &str) -> ApiResult<()> {
        let url = self.trial_url(key, &["versions", version_id])?;
        let response = self.request(Method::DELETE, url).send().await?;
        check_status(response).await.map(|_| ())
    }

    async fn create_segment(&self, segment: &NewSegment) -> ApiResult<Segment> {
        let url = self.url(&[])?;
        let response = self
            .request(Method::POST, url)
            .json(segment)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn update_segment(&self, segment_id: &str, patch: &SegmentPatch) -> ApiResult<Segment> {
        let url = self.url(&[segment_id])?;
        let response = self
            .request(Method::PATCH, url)
            .json(patch)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn delete_segment(&self, segment_id: &str) -> ApiResult<()> {
        let url = self.url(&[segment_id])?;
        let response = self.request(Method::DELETE, url).send().await?;
        check_status(response).await.map(|_| ())
    }
}
