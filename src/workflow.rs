//! Approval chains and the resolver that picks one for a new or resubmitted
//! request.
use std::sync::Arc;

use crate::directory::{Directory, Role, UserId, WorkflowTemplateStore};
use crate::error::{Result, WorkflowError};
use crate::request::RequestType;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ApproverStep {
    #[n(0)]
    pub level: u32,
    #[n(1)]
    pub approver_id: UserId,
    #[n(2)]
    pub role: Role,
}

impl ApproverStep {
    pub fn new(level: u32, approver_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            level,
            approver_id: approver_id.into(),
            role,
        }
    }
}

/// Ordered approver steps. Levels run 1, 2, .. n without gaps, so the
/// request's `current_level` always points at the last step that approved.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalChain(#[n(0)] Vec<ApproverStep>);

impl ApprovalChain {
    pub fn new(steps: Vec<ApproverStep>) -> Result<Self> {
        for (index, step) in steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.level != expected {
                return Err(WorkflowError::InvalidApprovalChain(format!(
                    "step {} has level {}, expected {}",
                    index, step.level, expected
                )));
            }
            if step.approver_id.trim().is_empty() {
                return Err(WorkflowError::InvalidApprovalChain(format!(
                    "level {} has no approver",
                    step.level
                )));
            }
        }

        Ok(Self(steps))
    }

    /// The chain of an admin-submitted request.
    pub fn empty() -> Self {
        Self(vec![])
    }

    pub fn len(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn steps(&self) -> &[ApproverStep] {
        &self.0
    }

    pub fn step(&self, level: u32) -> Option<&ApproverStep> {
        if level == 0 {
            return None;
        }
        self.0.get(level as usize - 1)
    }

    /// Lowest level at which `user_id` approves.
    pub fn level_of(&self, user_id: &str) -> Option<u32> {
        self.0
            .iter()
            .find(|step| step.approver_id == user_id)
            .map(|step| step.level)
    }

    pub fn final_approver(&self) -> Option<&ApproverStep> {
        self.0.last()
    }
}

/// Where a request goes after create or resubmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Submitter is an administrator: approved on the spot by the system.
    Bypass,
    Chain(ApprovalChain),
}

impl Route {
    pub fn is_bypass(&self) -> bool {
        matches!(self, Route::Bypass)
    }

    pub fn into_chain(self) -> ApprovalChain {
        match self {
            Route::Bypass => ApprovalChain::empty(),
            Route::Chain(chain) => chain,
        }
    }
}

pub struct WorkflowResolver {
    templates: Arc<dyn WorkflowTemplateStore>,
    directory: Arc<dyn Directory>,
}

impl WorkflowResolver {
    pub fn new(templates: Arc<dyn WorkflowTemplateStore>, directory: Arc<dyn Directory>) -> Self {
        Self {
            templates,
            directory,
        }
    }

    /// Pick the approval route for a request.
    ///
    /// Administrators bypass approval, managers go straight to the sole
    /// administrator and everyone else follows the active template for the
    /// request type. Each call reads the collaborators afresh, so template
    /// edits only affect requests resolved afterwards.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn resolve(
        &self,
        request_type: RequestType,
        submitter_role: Role,
        submitter_department: &str,
    ) -> Result<Route> {
        match submitter_role {
            Role::Admin => Ok(Route::Bypass),
            Role::Manager => {
                let admin = self
                    .directory
                    .get_sole_admin()
                    .await
                    .map_err(WorkflowError::from_collaborator)?
                    .ok_or(WorkflowError::NoAdminConfigured)?;

                let chain = ApprovalChain::new(vec![ApproverStep::new(1, admin, Role::Admin)])?;
                Ok(Route::Chain(chain))
            }
            Role::Employee | Role::Hr => {
                let steps = self
                    .templates
                    .get_active_template(request_type)
                    .await
                    .map_err(WorkflowError::from_collaborator)?
                    .ok_or(WorkflowError::NoTemplateConfigured(request_type))?;

                if steps.is_empty() {
                    return Err(WorkflowError::InvalidApprovalChain(format!(
                        "active template for {:?} has no steps",
                        request_type
                    )));
                }

                Ok(Route::Chain(ApprovalChain::new(steps)?))
            }
        }
    }
}
