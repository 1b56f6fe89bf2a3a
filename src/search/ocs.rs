use std::{collections::HashMap, time::Duration};

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{blocking::Client, redirect::Policy};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::provider::{PageSink, ProviderId, ProviderPage, SearchQuery, UnifiedSearchProvider};
use crate::metadata::RemoteFileEntry;

const OCS_SEARCH_PATH: &str = "ocs/v2.php/search/providers";

/// 构建一个带有统一超时与重定向策略的阻塞式 HTTP 客户端。
pub(crate) fn build_blocking_client(timeout: Duration) -> Result<Client, String> {
    Client::builder()
        .timeout(timeout)
        .redirect(Policy::limited(10))
        .build()
        .map_err(|e| format!("failed to build HTTP client: {e}"))
}

/// 基于 OCS 接口的统一搜索实现：先列出 provider，再逐个拉取结果页。
/// 只保留带 `fileId` 与 `path` 属性的条目，其余（联系人、聊天等）跳过。
pub struct OcsSearchProvider {
    base_url: String,
    user: String,
    password: String,
    client: Client,
}

impl OcsSearchProvider {
    pub fn new(base_url: &str, user: &str, password: &str) -> Result<Self, String> {
        let parsed = Url::parse(base_url).map_err(|e| format!("invalid server url {base_url:?}: {e}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("unsupported server url scheme {:?}", parsed.scheme()));
        }
        // 设置较短超时，避免搜索框长时间无响应。
        let client = build_blocking_client(Duration::from_secs(30))?;
        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            client,
        })
    }

    fn providers_url(&self) -> String {
        format!("{}/{OCS_SEARCH_PATH}", self.base_url)
    }

    fn provider_search_url(&self, provider: &str) -> String {
        let encoded = utf8_percent_encode(provider, NON_ALPHANUMERIC);
        format!("{}/{OCS_SEARCH_PATH}/{encoded}/search", self.base_url)
    }

    fn list_providers(&self) -> Result<Vec<OcsProvider>, String> {
        let mut providers: Vec<OcsProvider> = self.get_json(&self.providers_url(), &[])?;
        providers.sort_by_key(|provider| provider.order);
        Ok(providers)
    }

    fn provider_page(&self, provider: &str, query: &SearchQuery) -> Result<ProviderPage, String> {
        let mut params = vec![
            ("term", query.term.clone()),
            ("limit", query.limit.to_string()),
        ];
        if let Some(cursor) = &query.cursor {
            params.push(("cursor", cursor.clone()));
        }
        let result: OcsSearchResult = self.get_json(&self.provider_search_url(provider), &params)?;
        Ok(result.into_page())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T, String> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .header("OCS-APIRequest", "true")
            .header("Accept", "application/json")
            .query(&[("format", "json")])
            .query(params)
            .send()
            .map_err(|e| format!("failed to query unified search: {e}"))?;

        if response.status().as_u16() == 401 {
            return Err("credentials rejected by server; please sign in again".to_string());
        }
        if !response.status().is_success() {
            return Err(format!("search api returned HTTP {}", response.status()));
        }

        let envelope: OcsEnvelope<T> = response
            .json()
            .map_err(|e| format!("failed to parse search response: {e}"))?;
        Ok(envelope.ocs.data)
    }
}

impl UnifiedSearchProvider for OcsSearchProvider {
    fn search(&self, query: &SearchQuery, sink: &mut PageSink<'_>) -> Result<(), String> {
        if let Some(provider) = &query.provider {
            let page = self.provider_page(provider, query)?;
            sink(provider.clone(), page);
            return Ok(());
        }

        let providers = self.list_providers()?;
        let mut failures = Vec::new();
        for provider in &providers {
            match self.provider_page(&provider.id, query) {
                Ok(page) => sink(provider.id.clone(), page),
                Err(err) => {
                    warn!(provider = %provider.id, error = %err, "search provider failed");
                    failures.push(err);
                }
            }
        }
        debug!(
            providers = providers.len(),
            failed = failures.len(),
            "unified search round finished"
        );
        if !providers.is_empty() && failures.len() == providers.len() {
            return Err(failures.remove(0));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct OcsEnvelope<T> {
    ocs: OcsBody<T>,
}

#[derive(Deserialize)]
struct OcsBody<T> {
    data: T,
}

#[derive(Deserialize)]
struct OcsProvider {
    id: ProviderId,
    #[serde(default)]
    order: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OcsSearchResult {
    #[serde(default)]
    is_paginated: bool,
    #[serde(default)]
    entries: Vec<OcsEntry>,
    #[serde(default)]
    cursor: Option<Value>,
}

impl OcsSearchResult {
    fn into_page(self) -> ProviderPage {
        ProviderPage {
            entries: self.entries.iter().filter_map(OcsEntry::to_remote).collect(),
            cursor: self.cursor.as_ref().and_then(cursor_text),
            is_paginated: self.is_paginated,
        }
    }
}

#[derive(Deserialize)]
struct OcsEntry {
    #[serde(default)]
    attributes: HashMap<String, Value>,
}

impl OcsEntry {
    fn to_remote(&self) -> Option<RemoteFileEntry> {
        let oc_id = self.attributes.get("fileId").and_then(cursor_text)?;
        let path = self.attributes.get("path").and_then(Value::as_str)?;
        let (server_url, file_name) = split_path(path)?;
        // 统一搜索不返回 etag；空 etag 表示只携带位置信息。
        Some(RemoteFileEntry::new(oc_id, server_url, file_name, ""))
    }
}

/// 游标与 fileId 可能是数字也可能是字符串。
fn cursor_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// `/docs/report.pdf` → (`/docs`, `report.pdf`)；根目录下的文件所在目录为 `/`。
fn split_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    let parent = if parent.is_empty() { "/" } else { parent };
    Some((parent.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_ocs_urls() {
        let provider = OcsSearchProvider::new("https://cloud.example.com/", "alice", "pw").unwrap();
        assert_eq!(
            provider.providers_url(),
            "https://cloud.example.com/ocs/v2.php/search/providers"
        );
        assert_eq!(
            provider.provider_search_url("files"),
            "https://cloud.example.com/ocs/v2.php/search/providers/files/search"
        );
        assert!(OcsSearchProvider::new("ftp://cloud.example.com", "alice", "pw").is_err());
    }

    #[test]
    fn parses_search_result_and_skips_non_file_entries() {
        let body = r#"{"ocs":{"meta":{"status":"ok"},"data":{
            "name":"Files","isPaginated":true,"cursor":5,
            "entries":[
                {"title":"report.pdf","attributes":{"fileId":"42","path":"/docs/report.pdf"}},
                {"title":"root.txt","attributes":{"fileId":7,"path":"/root.txt"}},
                {"title":"Alice","attributes":{"contactId":"1"}}
            ]}}}"#;
        let envelope: OcsEnvelope<OcsSearchResult> = serde_json::from_str(body).unwrap();
        let page = envelope.ocs.data.into_page();

        assert!(page.is_paginated);
        assert_eq!(page.cursor.as_deref(), Some("5"));
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].oc_id, "42");
        assert_eq!(page.entries[0].server_url, "/docs");
        assert_eq!(page.entries[0].file_name, "report.pdf");
        assert!(page.entries[0].etag.is_empty());
        assert_eq!(page.entries[1].server_url, "/");
    }

    #[test]
    fn split_path_rejects_bare_names() {
        assert_eq!(split_path("report.pdf"), None);
        assert_eq!(split_path("/"), None);
        assert_eq!(
            split_path("/a/b/"),
            Some(("/a".to_string(), "b".to_string()))
        );
    }
}
