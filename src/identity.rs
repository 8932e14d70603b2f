use crate::error::{Error, Result};
use crate::models::{Role, User};
use crate::store::{NewUser, Store};
use tracing::info;

/// Profile fields the channel transport hands us on an inbound event.
#[derive(Debug, Clone)]
pub struct ChannelProfile {
    pub username: Option<String>,
    pub full_name: String,
}

/// Maps an inbound channel identity onto an internal user, creating a
/// customer account under the configured default organization on first
/// contact. This is the only path that creates a user without explicit
/// administrative action.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Store,
    default_org_id: i64,
}

impl IdentityResolver {
    pub fn new(store: Store, default_org_id: i64) -> Self {
        Self {
            store,
            default_org_id,
        }
    }

    pub async fn resolve_or_create(
        &self,
        telegram_id: i64,
        profile: &ChannelProfile,
    ) -> Result<User> {
        if let Some(user) = self.store.user_by_telegram_id(telegram_id).await? {
            return Ok(user);
        }

        let new_user = NewUser {
            organization_id: self.default_org_id,
            telegram_id: Some(telegram_id),
            username: profile.username.clone(),
            email: None,
            password_hash: None,
            role: Role::Customer,
            full_name: Some(profile.full_name.clone()),
        };

        match self.store.create_user(&new_user).await {
            Ok(user) => {
                info!(user_id = user.id, telegram_id, "created customer on first contact");
                Ok(user)
            }
            // Lost a first-contact race: the store's uniqueness
            // constraint on telegram_id fired, so the winner's row is
            // the one to use.
            Err(e) if e.is_unique_violation() => self
                .store
                .user_by_telegram_id(telegram_id)
                .await?
                .ok_or(Error::NotFound("user")),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ChannelProfile {
        ChannelProfile {
            username: Some("jdoe".into()),
            full_name: "J. Doe".into(),
        }
    }

    #[tokio::test]
    async fn first_contact_creates_a_customer_in_the_default_org() {
        let store = Store::memory().await;
        store.ensure_organization(1, "Acme").await.unwrap();
        let resolver = IdentityResolver::new(store, 1);

        let user = resolver.resolve_or_create(555, &profile()).await.unwrap();
        assert_eq!(user.role, Role::Customer);
        assert_eq!(user.organization_id, 1);
        assert_eq!(user.telegram_id, Some(555));
        assert_eq!(user.full_name.as_deref(), Some("J. Doe"));
        assert!(user.is_active);
    }

    #[tokio::test]
    async fn repeat_contact_resolves_to_the_same_user() {
        let store = Store::memory().await;
        store.ensure_organization(1, "Acme").await.unwrap();
        let resolver = IdentityResolver::new(store, 1);

        let first = resolver.resolve_or_create(555, &profile()).await.unwrap();
        let second = resolver.resolve_or_create(555, &profile()).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn unique_violation_resolves_to_the_existing_row() {
        let store = Store::memory().await;
        store.ensure_organization(1, "Acme").await.unwrap();

        // Another process won the race between our lookup and insert.
        let winner = store
            .create_user(&NewUser {
                organization_id: 1,
                telegram_id: Some(555),
                username: None,
                email: None,
                password_hash: None,
                role: Role::Customer,
                full_name: None,
            })
            .await
            .unwrap();

        let resolver = IdentityResolver::new(store, 1);
        let resolved = resolver.resolve_or_create(555, &profile()).await.unwrap();
        assert_eq!(resolved.id, winner.id);
    }
}
