use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use crate::engine::EngineError;
use crate::model::{UserId, UserProfile};

/// Read-only view of the user directory.
///
/// Sessions are token based, so the directory is only ever asked who a user
/// is. Session storage and verification tokens are not part of this interface.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve_user_by_email(&self, email: &str) -> Result<Option<UserProfile>, EngineError>;

    async fn resolve_user_by_id(&self, id: &str) -> Result<Option<UserProfile>, EngineError>;
}

/// Fixed directory held in memory, typically loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    by_id: HashMap<UserId, UserProfile>,
}

impl StaticDirectory {
    pub fn new(users: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            by_id: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }

    /// Load a JSON array of user profiles.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        let users: Vec<UserProfile> = serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        debug!(path = %path.display(), users = users.len(), "loaded user directory");
        Ok(Self::new(users))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticDirectory {
    async fn resolve_user_by_email(&self, email: &str) -> Result<Option<UserProfile>, EngineError> {
        Ok(self
            .by_id
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn resolve_user_by_id(&self, id: &str) -> Result<Option<UserProfile>, EngineError> {
        Ok(self.by_id.get(id).cloned())
    }
}

/// User directory served over HTTP:
/// `GET {endpoint}/api/users/{id}` and `GET {endpoint}/api/users/email/{email}`.
#[derive(Debug, Clone)]
pub struct RestDirectory {
    client: Client,
    base: Url,
}

impl RestDirectory {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, EngineError> {
        let base = Url::parse(endpoint)
            .map_err(|e| EngineError::IdentityUnavailable(format!("bad endpoint {endpoint}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(EngineError::IdentityUnavailable(format!(
                "bad endpoint {endpoint}: not a base URL"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::IdentityUnavailable(e.to_string()))?;
        Ok(Self { client, base })
    }

    /// Build `{base}/api/users/...`, percent-encoding each segment.
    fn url(&self, segments: &[&str]) -> Result<Url, EngineError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| EngineError::IdentityUnavailable("endpoint cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["api", "users"])
            .extend(segments);
        Ok(url)
    }

    async fn fetch(&self, url: Url) -> Result<Option<UserProfile>, EngineError> {
        debug!(%url, "resolving user");
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            warn!(%url, error = %e, "identity request failed");
            EngineError::IdentityUnavailable(e.to_string())
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            warn!(%url, %status, "identity service error");
            return Err(EngineError::IdentityUnavailable(format!("directory returned {status}")));
        }

        let user = response
            .json::<UserProfile>()
            .await
            .map_err(|e| EngineError::IdentityUnavailable(format!("bad directory response: {e}")))?;
        if user.id.is_empty() || user.email.is_empty() {
            return Ok(None);
        }
        Ok(Some(user))
    }
}

#[async_trait]
impl IdentityProvider for RestDirectory {
    async fn resolve_user_by_email(&self, email: &str) -> Result<Option<UserProfile>, EngineError> {
        self.fetch(self.url(&["email", email])?).await
    }

    async fn resolve_user_by_id(&self, id: &str) -> Result<Option<UserProfile>, EngineError> {
        self.fetch(self.url(&[id])?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn aoi() -> UserProfile {
        UserProfile {
            id: "u1".into(),
            email: "aoi@example.com".into(),
            name: "Aoi".into(),
            color: "#ff0000".into(),
            role: Role::Admin,
        }
    }

    fn rest(server: &MockServer) -> RestDirectory {
        RestDirectory::new(&server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn static_lookup_by_id_and_email() {
        let dir = StaticDirectory::new([aoi()]);
        assert_eq!(dir.resolve_user_by_id("u1").await.unwrap(), Some(aoi()));
        assert_eq!(dir.resolve_user_by_email("AOI@example.com").await.unwrap(), Some(aoi()));
        assert_eq!(dir.resolve_user_by_id("u2").await.unwrap(), None);
        assert_eq!(dir.resolve_user_by_email("x@example.com").await.unwrap(), None);
    }

    #[test]
    fn static_directory_from_file() {
        let path = std::env::temp_dir().join("shiftboard_test_users.json");
        std::fs::write(
            &path,
            r##"[{"id":"u1","email":"aoi@example.com","name":"Aoi","color":"#ff0000","role":"ADMIN"},
                {"id":"u2","email":"ren@example.com"}]"##,
        )
        .unwrap();
        let dir = StaticDirectory::from_file(&path).unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.by_id["u2"].role, Role::User);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn rest_resolves_by_email() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/email/aoi@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "u1",
                "email": "aoi@example.com",
                "name": "Aoi",
                "color": "#ff0000",
                "role": "ADMIN"
            })))
            .mount(&server)
            .await;

        let user = rest(&server).resolve_user_by_email("aoi@example.com").await.unwrap();
        assert_eq!(user, Some(aoi()));
    }

    #[tokio::test]
    async fn rest_not_found_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/u404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(rest(&server).resolve_user_by_id("u404").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rest_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = rest(&server).resolve_user_by_id("u1").await.unwrap_err();
        assert!(matches!(err, EngineError::IdentityUnavailable(_)));
    }

    #[tokio::test]
    async fn rest_incomplete_record_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "u1", "email": ""})))
            .mount(&server)
            .await;

        assert_eq!(rest(&server).resolve_user_by_id("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rest_unreachable_is_unavailable() {
        let dir = RestDirectory::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = dir.resolve_user_by_id("u1").await.unwrap_err();
        assert!(matches!(err, EngineError::IdentityUnavailable(_)));
    }

    #[test]
    fn url_segments_are_encoded() {
        let dir = RestDirectory::new("http://localhost:5000", Duration::from_secs(1)).unwrap();
        let url = dir.url(&["email", "a b/c@example.com"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/api/users/email/a%20b%2Fc@example.com");
    }
}
