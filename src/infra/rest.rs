//! 托管后端的 REST 适配器
//!
//! - 行存储：PostgREST 约定（`col=eq.v`、`order=`、`Range` 头、`Prefer: return=representation`）
//! - 媒体存储：`POST /storage/v1/object/{bucket}/{path}`

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::media::MediaStorage;
use super::query::{Filter, Query, QueryClient};
use crate::config::BackendConfig;
use crate::error::{Result, SyncError};

/// REST 客户端
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    media_bucket: String,
}

impl RestClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(SyncError::Configuration("backend.url is not set".to_string()));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Configuration(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            access_token: None,
            media_bucket: config.media_bucket.clone(),
        })
    }

    /// 使用用户会话令牌（由认证协作者提供）
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        builder
            .header("apikey", &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
    }

    fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
        filters.iter().map(Filter::to_query_param).collect()
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => SyncError::NotFound(body),
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                SyncError::Validation(format!("{}: {}", status, body))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                SyncError::Timeout(format!("{}: {}", status, body))
            }
            _ => SyncError::Network(format!("{}: {}", status, body)),
        })
    }
}

#[async_trait]
impl QueryClient for RestClient {
    async fn select(&self, query: &Query) -> Result<Vec<Value>> {
        let mut params = vec![("select".to_string(), query.columns.clone())];
        params.extend(Self::filter_params(&query.filters));
        if !query.order.is_empty() {
            let order = query
                .order
                .iter()
                .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_string(), order));
        }

        let mut request = self.authorize(self.http.get(self.rest_url(&query.table))).query(&params);
        if let Some((from, to)) = query.range {
            request = request.header(header::RANGE, format!("{}-{}", from, to));
        }

        debug!("🔎 select {} ({} filters)", query.table, query.filters.len());
        let response = Self::check(request.send().await?).await?;
        Ok(response.json::<Vec<Value>>().await?)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        let request = self
            .authorize(self.http.post(self.rest_url(table)))
            .header("Prefer", "return=representation")
            .json(&row);
        let response = Self::check(request.send().await?).await?;
        let mut rows = response.json::<Vec<Value>>().await?;
        rows.pop()
            .ok_or_else(|| SyncError::Internal(format!("insert into {} returned no row", table)))
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>> {
        if filters.is_empty() {
            return Err(SyncError::Validation(format!(
                "refusing unfiltered update on {}",
                table
            )));
        }
        let request = self
            .authorize(self.http.patch(self.rest_url(table)))
            .query(&Self::filter_params(filters))
            .header("Prefer", "return=representation")
            .json(&patch);
        let response = Self::check(request.send().await?).await?;
        Ok(response.json::<Vec<Value>>().await?)
    }
}

#[async_trait]
impl MediaStorage for RestClient {
    async fn upload_bytes(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.media_bucket, path
        );
        let request = self
            .authorize(self.http.post(url))
            .header(header::CONTENT_TYPE, content_type)
            .body(bytes);
        Self::check(request.send().await?)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_backend_url() {
        let config = BackendConfig::default();
        assert!(matches!(RestClient::new(&config), Err(SyncError::Configuration(_))));
    }

    #[test]
    fn test_filter_params_follow_postgrest() {
        let params = RestClient::filter_params(&[
            Filter::eq("recipient_id", "bob"),
            Filter::is_null("read_at"),
        ]);
        assert_eq!(params[0], ("recipient_id".to_string(), "eq.bob".to_string()));
        assert_eq!(params[1], ("read_at".to_string(), "is.null".to_string()));
    }
}
