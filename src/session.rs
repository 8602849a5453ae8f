use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::info;

use crate::attestation::AttestationClaims;
use crate::documents::{self, DocumentStore};
use crate::error::{AppError, PipelineError};
use crate::structs::User;

/// Who is uploading, built per request. Replaces any notion of a global logged-in user.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub claims: Option<AttestationClaims>,
    pub user: Option<User>,
}

impl Session {
    #[must_use]
    pub fn new(claims: AttestationClaims, user: User) -> Self {
        Self {
            claims: Some(claims),
            user: Some(user),
        }
    }

    /// Verified claims and resolved identity, or `AuthRequired`.
    pub fn require(&self) -> Result<(&AttestationClaims, &User), PipelineError> {
        match (&self.claims, &self.user) {
            (Some(claims), Some(user)) if !user.id.is_empty() => Ok((claims, user)),
            _ => Err(PipelineError::AuthRequired),
        }
    }
}

/// Claims placed in the request by the attestation middleware.
pub struct Attested(pub AttestationClaims);

impl<S> FromRequestParts<S> for Attested
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AttestationClaims>()
            .cloned()
            .map(Attested)
            .ok_or_else(|| PipelineError::AuthRequired.into_app_error("session"))
    }
}

/// Find or create the user behind an upload.
///
/// The cached id from the client is reused only while its stored name still
/// matches what was typed. A changed name creates a new user; old uploads stay
/// with the old one.
pub async fn resolve_user(
    store: &dyn DocumentStore,
    username: &str,
    cached_user_id: Option<&str>,
) -> Result<User, PipelineError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(PipelineError::Validation(vec!["username"]));
    }

    if let Some(id) = cached_user_id.map(str::trim).filter(|id| !id.is_empty()) {
        match documents::fetch_one::<User>(store, id).await {
            Ok(Some(user)) if user.name == username => return Ok(user),
            Ok(_) => {}
            // A cached id pointing at a broken row is treated like an unknown id.
            Err(documents::StoreError::Schema(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let user = documents::insert(
        store,
        User {
            id: String::new(),
            name: username.to_string(),
        },
    )
    .await?;
    info!(user_id = %user.id, "Created user");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{Collection, MemoryDocumentStore};

    fn claims() -> AttestationClaims {
        AttestationClaims {
            device_id: "device-1".into(),
            iat: 0,
            exp: i64::MAX,
        }
    }

    #[tokio::test]
    async fn new_name_creates_a_user() {
        let store = MemoryDocumentStore::new();
        let user = resolve_user(&store, "Anna", None).await.unwrap();
        assert_eq!(user.name, "Anna");
        assert_eq!(store.list(Collection::Users).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cached_id_is_reused_while_the_name_matches() {
        let store = MemoryDocumentStore::new();
        let first = resolve_user(&store, "Anna", None).await.unwrap();
        let again = resolve_user(&store, "Anna", Some(&first.id)).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(store.list(Collection::Users).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_name_creates_a_new_user() {
        let store = MemoryDocumentStore::new();
        let first = resolve_user(&store, "Anna", None).await.unwrap();
        let renamed = resolve_user(&store, "Annie", Some(&first.id)).await.unwrap();
        assert_ne!(renamed.id, first.id);
        assert_eq!(renamed.name, "Annie");
        assert_eq!(store.list(Collection::Users).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_cached_id_creates_a_user() {
        let store = MemoryDocumentStore::new();
        let user = resolve_user(&store, "Bob", Some("stale-id")).await.unwrap();
        assert_ne!(user.id, "stale-id");
    }

    #[tokio::test]
    async fn blank_username_is_a_validation_error() {
        let store = MemoryDocumentStore::new();
        assert_eq!(
            resolve_user(&store, "  ", None).await,
            Err(PipelineError::Validation(vec!["username"]))
        );
    }

    #[test]
    fn session_requires_claims_and_user() {
        assert_eq!(Session::default().require().unwrap_err(), PipelineError::AuthRequired);

        let user = User {
            id: "u1".into(),
            name: "Anna".into(),
        };
        let half = Session {
            claims: None,
            user: Some(user.clone()),
        };
        assert!(half.require().is_err());

        let session = Session::new(claims(), user);
        assert_eq!(session.require().unwrap().1.name, "Anna");
    }
}
