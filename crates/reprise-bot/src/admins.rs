//! Who may use the bot.
//!
//! Seeded from `ADMIN_IDS` at startup and changed at runtime through the
//! `/addadmin` and `/removeadmin` commands. Changes are held in memory only
//! and are lost on restart; the environment stays the source of truth.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use reprise_shared::PrincipalId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("{0} is already an admin")]
    AlreadyAdmin(PrincipalId),

    #[error("{0} is not an admin")]
    NotAdmin(PrincipalId),

    #[error("You cannot remove yourself")]
    RemoveSelf,

    #[error("The last admin cannot be removed")]
    LastAdmin,
}

#[derive(Clone, Default)]
pub struct AdminRegistry {
    admins: Arc<RwLock<Vec<PrincipalId>>>,
}

impl AdminRegistry {
    pub fn new(initial: impl IntoIterator<Item = PrincipalId>) -> Self {
        let mut admins: Vec<PrincipalId> = Vec::new();
        for id in initial {
            if !admins.contains(&id) {
                admins.push(id);
            }
        }
        Self {
            admins: Arc::new(RwLock::new(admins)),
        }
    }

    pub async fn is_admin(&self, principal: PrincipalId) -> bool {
        self.admins.read().await.contains(&principal)
    }

    pub async fn add(&self, principal: PrincipalId) -> Result<(), AdminError> {
        let mut admins = self.admins.write().await;
        if admins.contains(&principal) {
            return Err(AdminError::AlreadyAdmin(principal));
        }
        admins.push(principal);
        info!(admin = %principal, total = admins.len(), "Admin added");
        Ok(())
    }

    /// Remove `principal` on behalf of `requested_by`.
    pub async fn remove(
        &self,
        principal: PrincipalId,
        requested_by: PrincipalId,
    ) -> Result<(), AdminError> {
        if principal == requested_by {
            return Err(AdminError::RemoveSelf);
        }
        let mut admins = self.admins.write().await;
        let Some(index) = admins.iter().position(|id| *id == principal) else {
            return Err(AdminError::NotAdmin(principal));
        };
        if admins.len() == 1 {
            return Err(AdminError::LastAdmin);
        }
        admins.remove(index);
        info!(admin = %principal, by = %requested_by, total = admins.len(), "Admin removed");
        Ok(())
    }

    pub async fn list(&self) -> Vec<PrincipalId> {
        self.admins.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.admins.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_deduplicates() {
        let registry = AdminRegistry::new([PrincipalId(1), PrincipalId(2), PrincipalId(1)]);
        assert_eq!(registry.list().await, vec![PrincipalId(1), PrincipalId(2)]);
        assert!(registry.is_admin(PrincipalId(2)).await);
        assert!(!registry.is_admin(PrincipalId(3)).await);
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let registry = AdminRegistry::new([PrincipalId(1)]);
        registry.add(PrincipalId(7)).await.unwrap();
        assert_eq!(
            registry.add(PrincipalId(7)).await,
            Err(AdminError::AlreadyAdmin(PrincipalId(7)))
        );

        registry.remove(PrincipalId(7), PrincipalId(1)).await.unwrap();
        assert!(!registry.is_admin(PrincipalId(7)).await);
        assert_eq!(
            registry.remove(PrincipalId(7), PrincipalId(1)).await,
            Err(AdminError::NotAdmin(PrincipalId(7)))
        );
    }

    #[tokio::test]
    async fn test_remove_guards() {
        let registry = AdminRegistry::new([PrincipalId(1)]);
        assert_eq!(
            registry.remove(PrincipalId(1), PrincipalId(1)).await,
            Err(AdminError::RemoveSelf)
        );
        assert_eq!(
            registry.remove(PrincipalId(1), PrincipalId(9)).await,
            Err(AdminError::LastAdmin)
        );
        assert_eq!(registry.len().await, 1);
    }
}
