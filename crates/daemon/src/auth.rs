use async_trait::async_trait;

/// Maps request credentials onto a requester identity. None means rejected.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, login: Option<&str>, key: Option<&str>) -> Option<String>;
}

/// Shared-key check against one configured token; with no token configured
/// every caller is accepted. The login header becomes the principal.
pub struct StaticTokenAuth {
    token: Option<String>,
}

impl StaticTokenAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn authenticate(&self, login: Option<&str>, key: Option<&str>) -> Option<String> {
        if let Some(expected) = &self.token {
            if key != Some(expected.as_str()) {
                return None;
            }
        }
        Some(login.unwrap_or("anonymous").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_instance_accepts_anyone() {
        let auth = StaticTokenAuth::new(None);
        assert_eq!(
            auth.authenticate(Some("alice"), None).await.as_deref(),
            Some("alice")
        );
        assert_eq!(
            auth.authenticate(None, None).await.as_deref(),
            Some("anonymous")
        );
    }

    #[tokio::test]
    async fn token_instance_requires_the_key() {
        let auth = StaticTokenAuth::new(Some("sekrit".to_string()));
        assert!(auth.authenticate(Some("alice"), None).await.is_none());
        assert!(auth
            .authenticate(Some("alice"), Some("wrong"))
            .await
            .is_none());
        assert_eq!(
            auth.authenticate(Some("alice"), Some("sekrit"))
                .await
                .as_deref(),
            Some("alice")
        );
    }
}
