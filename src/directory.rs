//! Collaborators consulted by the engine: who users are, and which
//! approvers each request type routes through.
//!
//! Both are read-only from the engine's point of view. The in-memory
//! implementations are what the tests run against and what an embedding
//! application can seed at start-up.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::WorkflowError;
use crate::request::RequestType;
use crate::workflow::ApproverStep;

pub type UserId = String;

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum Role {
    #[n(0)]
    Employee,
    #[n(1)]
    Manager,
    #[n(2)]
    Hr,
    #[n(3)]
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub role: Role,
    pub department: String,
    pub manager_id: Option<UserId>,
}

impl UserProfile {
    pub fn new(id: impl Into<UserId>, role: Role, department: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            department: department.into(),
            manager_id: None,
        }
    }
    pub fn with_manager(mut self, manager_id: impl Into<UserId>) -> Self {
        self.manager_id = Some(manager_id.into());
        self
    }
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// `Ok(None)` when the user does not exist.
    async fn get_user(&self, user_id: &UserId) -> anyhow::Result<Option<UserProfile>>;

    /// The unique administrator, `Ok(None)` when there is none. More than one
    /// should be reported as [`WorkflowError::MultipleAdminsConfigured`].
    async fn get_sole_admin(&self) -> anyhow::Result<Option<UserId>>;
}

#[async_trait]
pub trait WorkflowTemplateStore: Send + Sync {
    /// Ordered approver steps of the active template, `Ok(None)` when no
    /// template is active for `request_type`.
    async fn get_active_template(
        &self,
        request_type: RequestType,
    ) -> anyhow::Result<Option<Vec<ApproverStep>>>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, UserProfile>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = UserProfile>) -> Self {
        let users = users.into_iter().map(|u| (u.id.clone(), u)).collect();
        Self {
            users: RwLock::new(users),
        }
    }

    /// Insert or replace a user. Role and department changes are picked up by
    /// the next resolution.
    pub async fn upsert(&self, user: UserProfile) {
        self.users.write().await.insert(user.id.clone(), user);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn get_user(&self, user_id: &UserId) -> anyhow::Result<Option<UserProfile>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn get_sole_admin(&self) -> anyhow::Result<Option<UserId>> {
        let users = self.users.read().await;
        let admins: Vec<&UserProfile> = users.values().filter(|u| u.is_admin()).collect();

        match admins.as_slice() {
            [] => Ok(None),
            [admin] => Ok(Some(admin.id.clone())),
            many => Err(WorkflowError::MultipleAdminsConfigured(many.len()).into()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryTemplates {
    templates: RwLock<HashMap<RequestType, Vec<ApproverStep>>>,
}

impl InMemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `steps` for `request_type`, replacing any previous template.
    /// Requests already routed keep the chain they were given.
    pub async fn activate(&self, request_type: RequestType, steps: Vec<ApproverStep>) {
        self.templates.write().await.insert(request_type, steps);
    }

    pub async fn deactivate(&self, request_type: RequestType) {
        self.templates.write().await.remove(&request_type);
    }
}

#[async_trait]
impl WorkflowTemplateStore for InMemoryTemplates {
    async fn get_active_template(
        &self,
        request_type: RequestType,
    ) -> anyhow::Result<Option<Vec<ApproverStep>>> {
        Ok(self.templates.read().await.get(&request_type).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sole_admin_lookup() {
        let directory = InMemoryDirectory::with_users([
            UserProfile::new("alice", Role::Employee, "ops"),
            UserProfile::new("root", Role::Admin, "it"),
        ]);
        assert_eq!(
            directory.get_sole_admin().await.unwrap(),
            Some("root".to_string())
        );

        directory
            .upsert(UserProfile::new("root2", Role::Admin, "it"))
            .await;
        let err = directory.get_sole_admin().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::MultipleAdminsConfigured(2))
        ));
    }

    #[tokio::test]
    async fn no_admin_is_none() {
        let directory =
            InMemoryDirectory::with_users([UserProfile::new("bob", Role::Manager, "sales")]);
        assert_eq!(directory.get_sole_admin().await.unwrap(), None);
        assert!(directory.get_user(&"nobody".to_string()).await.unwrap().is_none());
    }
}
