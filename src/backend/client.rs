//! Minimal PocketBase REST client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::BackendError;

/// PocketBase caps `perPage` at 500.
const PAGE_SIZE: u32 = 500;

/// Query options for record listing.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub sort: Option<String>,
    pub filter: Option<String>,
    pub fields: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordPage<T> {
    page: u32,
    #[serde(default)]
    total_pages: u32,
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Shared handle to the record store. Clones share the auth token.
#[derive(Clone)]
pub struct PocketBase {
    base: Url,
    http: reqwest::Client,
    token: Arc<Mutex<Option<String>>>,
}

impl PocketBase {
    pub fn new(base: Url, http: reqwest::Client) -> Result<Self, BackendError> {
        if base.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(base.to_string()));
        }
        Ok(Self {
            base,
            http,
            token: Arc::new(Mutex::new(None)),
        })
    }

    /// Client with its own `reqwest::Client` and a request timeout.
    pub fn connect(base: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base = Url::parse(base).map_err(|e| BackendError::InvalidUrl(format!("{}: {}", base, e)))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Self::new(base, http)
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    /// `<base>/api/<segments...>`, keeping any path prefix of the base.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token() {
            // PocketBase takes the bare token, no "Bearer" prefix.
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        }
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|b| b.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// POST a JSON body to `/api/<segments...>`.
    pub async fn post_json<B, T>(&self, segments: &[&str], body: &B) -> Result<T, BackendError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(segments);
        debug!(url = %url, "POST");
        let response = self.authorize(self.http.post(url)).json(body).send().await?;
        Self::read_json(response).await
    }

    /// One page of records from `collection`.
    async fn get_page<T: DeserializeOwned>(
        &self,
        collection: &str,
        page: u32,
        options: &ListOptions,
    ) -> Result<RecordPage<T>, BackendError> {
        let mut url = self.endpoint(&["collections", collection, "records"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("page", &page.to_string())
                .append_pair("perPage", &PAGE_SIZE.to_string())
                .append_pair("skipTotal", "0");
            if let Some(sort) = options.sort.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("sort", sort);
            }
            if let Some(filter) = options.filter.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("filter", filter);
            }
            if let Some(fields) = options.fields.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("fields", fields);
            }
        }
        debug!(url = %url, "GET");
        let response = self.authorize(self.http.get(url)).send().await?;
        Self::read_json(response).await
    }

    /// Every record of `collection` matching `options`, across all pages.
    pub async fn get_full_list<T: DeserializeOwned>(
        &self,
        collection: &str,
        options: &ListOptions,
    ) -> Result<Vec<T>, BackendError> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let batch: RecordPage<T> = self.get_page(collection, page, options).await?;
            let done = batch.items.is_empty() || batch.page >= batch.total_pages;
            items.extend(batch.items);
            if done {
                break;
            }
            page += 1;
        }
        debug!(collection, count = items.len(), "Fetched full list");
        Ok(items)
    }
}

/// Quote `value` as a PocketBase filter string literal.
pub fn quote_filter_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port_url, serve, Route};
    use serde_json::{json, Value};

    fn client(base: &str) -> PocketBase {
        PocketBase::connect(base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn quotes_filter_values() {
        assert_eq!(quote_filter_value("ana"), "\"ana\"");
        assert_eq!(quote_filter_value("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote_filter_value("c:\\x"), "\"c:\\\\x\"");
    }

    #[test]
    fn rejects_bad_base() {
        assert!(matches!(
            PocketBase::connect("not a url", Duration::from_secs(1)),
            Err(BackendError::InvalidUrl(_))
        ));
        assert!(matches!(
            PocketBase::connect("mailto:x@y", Duration::from_secs(1)),
            Err(BackendError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn pages_until_total_pages() {
        let path = "/api/collections/conversations/records";
        let server = serve(vec![
            Route::json(
                &format!("{}?page=1&perPage=500&skipTotal=0&sort=-timestamp", path),
                200,
                json!({"page": 1, "perPage": 500, "totalPages": 2, "totalItems": 3, "items": [{"id": "a"}, {"id": "b"}]}),
            ),
            Route::json(
                &format!("{}?page=2&perPage=500&skipTotal=0&sort=-timestamp", path),
                200,
                json!({"page": 2, "perPage": 500, "totalPages": 2, "totalItems": 3, "items": [{"id": "c"}]}),
            ),
        ])
        .await;

        let options = ListOptions {
            sort: Some("-timestamp".into()),
            ..Default::default()
        };
        let items: Vec<Value> = client(&server.base_url)
            .get_full_list("conversations", &options)
            .await
            .unwrap();
        let ids: Vec<&str> = items.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn sends_raw_token_and_encodes_filter() {
        let server = serve(vec![Route::json(
            "/api/collections/conversations/records",
            200,
            json!({"page": 1, "totalPages": 1, "items": []}),
        )])
        .await;
        let pb = client(&server.base_url);
        pb.set_token(Some("tok123".into()));

        let options = ListOptions {
            filter: Some("phone = \"+34 600\"".into()),
            ..Default::default()
        };
        let items: Vec<Value> = pb.get_full_list("conversations", &options).await.unwrap();
        assert!(items.is_empty());

        let requests = server.requests();
        assert_eq!(requests[0].header("authorization"), Some("tok123"));
        assert!(requests[0].target.contains("filter=phone+%3D+%22%2B34+600%22"));
    }

    #[tokio::test]
    async fn error_status_carries_server_message() {
        let server = serve(vec![Route::json(
            "/api/collections/conversations/records",
            403,
            json!({"code": 403, "message": "Only admins can perform this action.", "data": {}}),
        )])
        .await;
        let err = client(&server.base_url)
            .get_full_list::<Value>("conversations", &ListOptions::default())
            .await
            .unwrap_err();
        match err {
            BackendError::Status { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Only admins can perform this action.");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn connection_failure_is_http_error() {
        let err = client(&closed_port_url())
            .get_full_list::<Value>("conversations", &ListOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Http(_)));
    }
}
