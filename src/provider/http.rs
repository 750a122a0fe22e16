//! REST provider client.
//!
//! Resources are addressed as `{endpoint}/resources/{type}[/{id}]`. The type
//! is sent as a single percent-encoded path segment, so types such as
//! `aws:iam/Role` survive the trip.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url, header};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::DEFAULT_PROVIDER_TIMEOUT_SECS;
use crate::error::{ConfigError, KeelError, ProviderError, Result};
use crate::graph::{Attributes, ResourceId};

use super::{Provider, ProviderResult, RemoteResource};

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

/// Body of create and update requests.
#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    inputs: &'a Attributes,
}

impl HttpProvider {
    /// Creates a client for `endpoint` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid base URL or the HTTP
    /// client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_PROVIDER_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid base URL or the HTTP
    /// client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            KeelError::Config(ConfigError::validation(
                format!("Invalid provider endpoint '{endpoint}': {e}"),
                "provider.endpoint",
            ))
        })?;

        if endpoint.cannot_be_a_base() {
            return Err(KeelError::Config(ConfigError::validation(
                format!("Provider endpoint '{endpoint}' cannot be used as a base URL"),
                "provider.endpoint",
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    /// Builds `{endpoint}/resources/{segments...}`.
    fn url(&self, segments: &[&str]) -> ProviderResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::network("provider endpoint cannot be a base URL"))?
            .pop_if_empty()
            .push("resources")
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> ProviderResult<Response> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))
    }

    /// Maps non-success statuses to provider errors.
    async fn check(
        response: Response,
        resource_type: &str,
        id: &str,
    ) -> ProviderResult<Response> {
        let status = response.status();
        trace!("Provider responded {status} for {resource_type} {id}");

        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::not_found(resource_type, id));
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Rejected {
                message: format!("authentication failed ({status})"),
            }),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(ProviderError::Rejected { message: body })
            }
            _ => Err(ProviderError::api_error(status.as_u16(), body)),
        }
    }

    async fn parse(response: Response) -> ProviderResult<RemoteResource> {
        let resource: RemoteResource = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to parse resource: {e}"),
            }
        })?;

        if resource.id.is_empty() {
            return Err(ProviderError::InvalidResponse {
                message: String::from("resource has an empty id"),
            });
        }
        Ok(resource)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(
        &self,
        id: &ResourceId,
        inputs: &Attributes,
    ) -> ProviderResult<RemoteResource> {
        debug!("POST create {id}");
        let url = self.url(&[&id.resource_type])?;
        let body = ResourceRequest {
            name: Some(&id.name),
            inputs,
        };

        let response = self.send(self.client.post(url).json(&body)).await?;
        let response = Self::check(response, &id.resource_type, &id.name).await?;
        Self::parse(response).await
    }

    async fn read(&self, resource_type: &str, provider_id: &str) -> ProviderResult<RemoteResource> {
        debug!("GET {resource_type} {provider_id}");
        let url = self.url(&[resource_type, provider_id])?;

        let response = self.send(self.client.get(url)).await?;
        let response = Self::check(response, resource_type, provider_id).await?;
        Self::parse(response).await
    }

    async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        inputs: &Attributes,
    ) -> ProviderResult<RemoteResource> {
        debug!("PUT update {resource_type} {provider_id}");
        let url = self.url(&[resource_type, provider_id])?;
        let body = ResourceRequest { name: None, inputs };

        let response = self.send(self.client.put(url).json(&body)).await?;
        let response = Self::check(response, resource_type, provider_id).await?;
        Self::parse(response).await
    }

    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        debug!("DELETE {resource_type} {provider_id}");
        let url = self.url(&[resource_type, provider_id])?;

        let response = self.send(self.client.delete(url)).await?;
        Self::check(response, resource_type, provider_id).await?;
        Ok(())
    }

    async fn lookup(&self, id: &ResourceId) -> ProviderResult<Option<RemoteResource>> {
        debug!("GET lookup {id}");
        let url = self.url(&[&id.resource_type])?;

        let response = self
            .send(self.client.get(url).query(&[("name", id.name.as_str())]))
            .await?;

        match Self::check(response, &id.resource_type, &id.name).await {
            Ok(response) => Self::parse(response).await.map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    async fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Some(String::from("secret"))).expect("valid endpoint")
    }

    #[tokio::test]
    async fn test_create_posts_inputs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/queue"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({
                "name": "jobs",
                "inputs": { "retention": 7 }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "q-1",
                "outputs": { "url": "https://queue/q-1" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server)
            .await
            .create(
                &ResourceId::new("queue", "jobs"),
                &attrs(&[("retention", json!(7))]),
            )
            .await
            .expect("create should succeed");

        assert_eq!(created.id, "q-1");
        assert_eq!(created.outputs["url"], json!("https://queue/q-1"));
        assert!(created.inputs.is_none());
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/queue/q-404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await
            .read("queue", "q-404")
            .await
            .expect_err("read should fail");

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/resources/queue/q-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await
            .update("queue", "q-1", &Attributes::new())
            .await
            .expect_err("update should fail");

        assert_eq!(err, ProviderError::api_error(503, "maintenance"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_delete_and_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/queue/q-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/resources/queue/q-2"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        provider
            .delete("queue", "q-1")
            .await
            .expect("delete should succeed");

        let err = provider
            .delete("queue", "q-2")
            .await
            .expect_err("delete should be rejected");
        assert!(matches!(err, ProviderError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_lookup_by_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/queue"))
            .and(query_param("name", "jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "q-1",
                "outputs": {},
                "inputs": { "retention": 7 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resources/queue"))
            .and(query_param("name", "ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        let found = provider
            .lookup(&ResourceId::new("queue", "jobs"))
            .await
            .expect("lookup should succeed")
            .expect("resource should be found");
        assert_eq!(found.inputs, Some(attrs(&[("retention", json!(7))])));

        let missing = provider
            .lookup(&ResourceId::new("queue", "ghost"))
            .await
            .expect("lookup should succeed");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_invalid_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/queue/q-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await
            .read("queue", "q-1")
            .await
            .expect_err("read should fail");
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[test]
    fn test_type_is_single_encoded_segment() {
        let provider =
            HttpProvider::new("http://localhost:8080/api/", None).expect("valid endpoint");
        let url = provider
            .url(&["aws:iam/Role", "r-1"])
            .expect("url should build");
        assert_eq!(url.path(), "/api/resources/aws:iam%2FRole/r-1");
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(HttpProvider::new("not a url", None).is_err());
    }
}
