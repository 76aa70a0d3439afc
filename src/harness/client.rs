use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{RemoteError, RemoteSecret, SecretManager, UpsertOutcome};

const SECRETS_PATH: &str = "/gateway/ng/api/v2/secrets";

/// Message Harness returns when updating an unknown secret
const SECRET_NOT_FOUND_MESSAGE: &str = "No such secret found";
/// Structured error codes that mean the secret does not exist
const NOT_FOUND_CODES: &[&str] = &[
    "RESOURCE_NOT_FOUND_EXCEPTION",
    "RESOURCE_NOT_FOUND",
    "SECRET_NOT_FOUND",
    "ENTITY_NOT_FOUND",
];

#[derive(Debug, Serialize)]
struct SecretRequest<'a> {
    secret: SecretPayload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretPayload<'a> {
    name: &'a str,
    identifier: &'a str,
    tags: &'a BTreeMap<String, String>,
    description: &'a str,
    #[serde(rename = "type")]
    type_: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    org_identifier: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_identifier: Option<&'a str>,
    spec: SecretSpec<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretSpec<'a> {
    secret_manager_identifier: &'a str,
    value_type: &'static str,
    value: &'a str,
}

/// Error envelope of the Harness NG API
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Client for the Harness NG secrets API
pub struct HarnessClient {
    http_client: Client,
    base_url: String,
    account: String,
    api_key: String,
}

impl HarnessClient {
    /// Create a client for `host`
    ///
    /// `host` is either a bare host name (`app.harness.io`), which is reached
    /// over HTTPS, or a full base URL with scheme.
    pub fn new(http_client: Client, host: &str, account: &str, api_key: &str) -> Self {
        Self {
            http_client,
            base_url: Self::base_url(host),
            account: account.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn base_url(host: &str) -> String {
        let host = host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        }
    }

    fn query<'a>(&'a self, secret: &'a RemoteSecret) -> Vec<(&'static str, &'a str)> {
        let mut params = vec![
            ("private_secret", "false"),
            ("routingId", self.account.as_str()),
            ("accountIdentifier", self.account.as_str()),
        ];
        if let Some(org) = &secret.org {
            params.push(("orgIdentifier", org.as_str()));
        }
        if let Some(project) = &secret.project {
            params.push(("projectIdentifier", project.as_str()));
        }
        params
    }

    fn payload(secret: &RemoteSecret) -> SecretRequest<'_> {
        SecretRequest {
            secret: SecretPayload {
                name: &secret.identifier,
                identifier: &secret.identifier,
                tags: &secret.tags,
                description: &secret.description,
                type_: "SecretText",
                org_identifier: secret.org.as_deref(),
                project_identifier: secret.project.as_deref(),
                spec: SecretSpec {
                    secret_manager_identifier: &secret.secret_manager,
                    value_type: "Inline",
                    value: &secret.value,
                },
            },
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Harness-Account", self.account.as_str())
            .header("x-api-key", self.api_key.as_str())
    }

    /// Send a request and classify a non-2xx answer
    async fn send(&self, request: RequestBuilder) -> Result<(), RemoteError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        Err(classify(status, body))
    }

    async fn update(&self, secret: &RemoteSecret) -> Result<(), RemoteError> {
        let url = format!("{}{}/{}", self.base_url, SECRETS_PATH, secret.identifier);
        debug!("Updating Harness secret {}", secret.identifier);
        let request = self
            .authorize(self.http_client.put(&url))
            .query(&self.query(secret))
            .json(&Self::payload(secret));
        self.send(request).await
    }

    async fn create(&self, secret: &RemoteSecret) -> Result<(), RemoteError> {
        let url = format!("{}{}", self.base_url, SECRETS_PATH);
        debug!("Creating Harness secret {}", secret.identifier);
        let request = self
            .authorize(self.http_client.post(&url))
            .query(&self.query(secret))
            .json(&Self::payload(secret));

        // A create never reports a missing secret; anything 404-like here is a plain API error
        self.send(request).await.map_err(|e| match e {
            RemoteError::NotFound { body } => RemoteError::Api { status: 404, body },
            other => other,
        })
    }
}

/// Map a failed response onto the remote error taxonomy
///
/// Not-found is recognised from the HTTP status or the structured `code` of
/// the error body first; the message text is only a fallback since Harness
/// does not document it as stable.
fn classify(status: StatusCode, body: String) -> RemoteError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return RemoteError::Auth {
            status: status.as_u16(),
            body,
        };
    }

    if status == StatusCode::NOT_FOUND {
        return RemoteError::NotFound { body };
    }

    if let Ok(error) = serde_json::from_str::<ErrorBody>(&body) {
        let code_says_missing = error
            .code
            .as_deref()
            .is_some_and(|code| NOT_FOUND_CODES.contains(&code));
        let message_says_missing = error
            .message
            .as_deref()
            .is_some_and(|message| message.contains(SECRET_NOT_FOUND_MESSAGE));
        if code_says_missing || message_says_missing {
            return RemoteError::NotFound { body };
        }
    }

    RemoteError::Api {
        status: status.as_u16(),
        body,
    }
}

#[async_trait]
impl SecretManager for HarnessClient {
    async fn upsert(&self, secret: &RemoteSecret) -> Result<UpsertOutcome, RemoteError> {
        match self.update(secret).await {
            Ok(()) => {
                info!("Updated Harness secret {}", secret.identifier);
                Ok(UpsertOutcome::Updated)
            }
            Err(RemoteError::NotFound { .. }) => {
                info!(
                    "Harness secret {} does not exist, creating it",
                    secret.identifier
                );
                self.create(secret).await?;
                info!("Created Harness secret {}", secret.identifier);
                Ok(UpsertOutcome::Created)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{
        body_partial_json, header, method, path, query_param, query_param_is_missing,
    };
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn secret(org: Option<&str>, project: Option<&str>) -> RemoteSecret {
        let mut tags = BTreeMap::new();
        tags.insert("team".to_string(), "infra".to_string());
        RemoteSecret {
            identifier: "cred-svc-a".to_string(),
            value: "tok123".to_string(),
            tags,
            description: "created by automation".to_string(),
            secret_manager: "harnessSecretManager".to_string(),
            org: org.map(str::to_string),
            project: project.map(str::to_string),
        }
    }

    fn client(server: &MockServer) -> HarnessClient {
        HarnessClient::new(Client::new(), &server.uri(), "acct123", "pat.key")
    }

    fn no_such_secret() -> ResponseTemplate {
        ResponseTemplate::new(400).set_body_json(json!({
            "status": "ERROR",
            "code": "INVALID_REQUEST",
            "message": "Invalid request: No such secret found [cred-svc-a]",
        }))
    }

    #[test]
    fn test_base_url() {
        assert_eq!(HarnessClient::base_url("app.harness.io"), "https://app.harness.io");
        assert_eq!(
            HarnessClient::base_url("http://localhost:8080/"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, String::new()),
            RemoteError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, String::new()),
            RemoteError::Auth { status: 403, .. }
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, String::new()),
            RemoteError::NotFound { .. }
        ));
        assert!(matches!(
            classify(
                StatusCode::BAD_REQUEST,
                json!({"code": "RESOURCE_NOT_FOUND_EXCEPTION", "message": "gone"}).to_string()
            ),
            RemoteError::NotFound { .. }
        ));
        assert!(matches!(
            classify(
                StatusCode::BAD_REQUEST,
                json!({"code": "INVALID_REQUEST", "message": "No such secret found"}).to_string()
            ),
            RemoteError::NotFound { .. }
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "not json".to_string()),
            RemoteError::Api { status: 400, .. }
        ));
        assert!(matches!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, json!({"message": null}).to_string()),
            RemoteError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_payload_shape() {
        let body = serde_json::to_value(HarnessClient::payload(&secret(Some("default"), None)))
            .unwrap();
        assert_eq!(
            body,
            json!({
                "secret": {
                    "name": "cred-svc-a",
                    "identifier": "cred-svc-a",
                    "tags": {"team": "infra"},
                    "description": "created by automation",
                    "type": "SecretText",
                    "orgIdentifier": "default",
                    "spec": {
                        "secretManagerIdentifier": "harnessSecretManager",
                        "valueType": "Inline",
                        "value": "tok123",
                    }
                }
            })
        );
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_secret() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/gateway/ng/api/v2/secrets/cred-svc-a"))
            .and(header("Harness-Account", "acct123"))
            .and(header("x-api-key", "pat.key"))
            .and(query_param("accountIdentifier", "acct123"))
            .and(query_param("routingId", "acct123"))
            .and(query_param("private_secret", "false"))
            .and(query_param_is_missing("orgIdentifier"))
            .and(body_partial_json(json!({"secret": {"spec": {"value": "tok123"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "SUCCESS"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let outcome = client(&server).upsert(&secret(None, None)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn test_upsert_creates_when_update_reports_missing() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/gateway/ng/api/v2/secrets/cred-svc-a"))
            .respond_with(no_such_secret())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/gateway/ng/api/v2/secrets"))
            .and(body_partial_json(json!({"secret": {"identifier": "cred-svc-a"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "SUCCESS"})))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server).upsert(&secret(None, None)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);
    }

    #[tokio::test]
    async fn test_scope_attached_to_query_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(query_param("orgIdentifier", "default"))
            .and(query_param("projectIdentifier", "platform"))
            .and(body_partial_json(json!({
                "secret": {"orgIdentifier": "default", "projectIdentifier": "platform"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server)
            .upsert(&secret(Some("default"), Some("platform")))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn test_failed_create_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(no_such_secret())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).upsert(&secret(None, None)).await.unwrap_err();
        match err {
            RemoteError::Api { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_not_found_is_not_surfaced_as_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no route"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).upsert(&secret(None, None)).await.unwrap_err();
        assert!(matches!(err, RemoteError::Api { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_auth_failure_does_not_fall_back_to_create() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server).upsert(&secret(None, None)).await.unwrap_err();
        assert!(matches!(err, RemoteError::Auth { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_other_update_error_propagates_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"code": "INVALID_REQUEST", "message": "bad tags"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).upsert(&secret(None, None)).await.unwrap_err();
        match err {
            RemoteError::Api { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("bad tags"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
