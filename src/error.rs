use crate::directory::UserId;
use crate::request::{Action, RequestStatus, RequestType};

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Coarse grouping of [`WorkflowError`] by who has to fix it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller supplied bad input; nothing was written.
    Validation,
    /// Actor may not perform the action right now; nothing was written.
    Authorization,
    /// The action is not legal from the request's current status.
    State,
    /// Needs an administrator (templates, directory), not the end user.
    Configuration,
    /// Reload and retry.
    Concurrency,
    NotFound,
    Infrastructure,
}

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("Missing required field '{0}'")]
    MissingRequiredField(&'static str),
    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Attachment '{0}' is not attached to this request")]
    InvalidAttachmentReference(String),

    #[error("It is not {actor}'s turn, level {expected_level} must act next")]
    NotYourTurn { actor: UserId, expected_level: u32 },
    #[error("{0} did not submit this request")]
    NotSubmitter(UserId),
    #[error("{0} is not an approver of this request")]
    ActorNotApprover(UserId),
    #[error("{0} is not an administrator and cannot force this action")]
    AdminRequired(UserId),
    #[error("Request already approved up to level {current_level}, it can no longer be cancelled")]
    AlreadyInProgress { current_level: u32 },

    #[error("Cannot {action:?} a request in status {from:?}")]
    InvalidTransition { from: RequestStatus, action: Action },
    #[error("Request is {0:?}, no further transitions are permitted")]
    TerminalState(RequestStatus),

    #[error("No active workflow template for {0:?}")]
    NoTemplateConfigured(RequestType),
    #[error("No administrator is configured in the directory")]
    NoAdminConfigured,
    #[error("Directory holds {0} administrators, manager requests need exactly one")]
    MultipleAdminsConfigured(usize),
    #[error("Approval chain is malformed: {0}")]
    InvalidApprovalChain(String),
    #[error("User {0} is unknown to the directory")]
    UnknownUser(UserId),
    #[error("{0} did not answer in time")]
    CollaboratorTimeout(&'static str),

    #[error("Request {id} changed concurrently: expected version {expected}, found {actual}")]
    ConcurrentModification {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Request {0} was not found")]
    RequestNotFound(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Encoding failure: {0}")]
    Encoding(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn class(&self) -> ErrorClass {
        use WorkflowError::*;

        match self {
            MissingRequiredField(_) | InvalidField { .. } | InvalidAttachmentReference(_) => {
                ErrorClass::Validation
            }
            NotYourTurn { .. }
            | NotSubmitter(_)
            | ActorNotApprover(_)
            | AdminRequired(_)
            | AlreadyInProgress { .. } => ErrorClass::Authorization,
            InvalidTransition { .. } | TerminalState(_) => ErrorClass::State,
            NoTemplateConfigured(_)
            | NoAdminConfigured
            | MultipleAdminsConfigured(_)
            | InvalidApprovalChain(_)
            | UnknownUser(_) => ErrorClass::Configuration,
            ConcurrentModification { .. } => ErrorClass::Concurrency,
            RequestNotFound(_) => ErrorClass::NotFound,
            CollaboratorTimeout(_) | Storage(_) | Encoding(_) | Other(_) => {
                ErrorClass::Infrastructure
            }
        }
    }

    /// Collaborators report through `anyhow`; recover our own errors when
    /// they raised one so its class survives the trip.
    pub fn from_collaborator(err: anyhow::Error) -> Self {
        match err.downcast::<WorkflowError>() {
            Ok(err) => err,
            Err(err) => WorkflowError::Other(err),
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for WorkflowError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        WorkflowError::Encoding(value.to_string())
    }
}

impl From<minicbor::decode::Error> for WorkflowError {
    fn from(value: minicbor::decode::Error) -> Self {
        WorkflowError::Encoding(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_distinct_from_validation() {
        assert_eq!(
            WorkflowError::NoAdminConfigured.class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            WorkflowError::NoTemplateConfigured(RequestType::Leave).class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            WorkflowError::MissingRequiredField("hour").class(),
            ErrorClass::Validation
        );
    }

    #[test]
    fn cancel_window_is_an_authorization_error() {
        let err = WorkflowError::AlreadyInProgress { current_level: 1 };
        assert_eq!(err.class(), ErrorClass::Authorization);
        assert!(err.to_string().contains("level 1"));
    }

    #[test]
    fn collaborator_errors_keep_their_class() {
        let raised = anyhow::Error::from(WorkflowError::MultipleAdminsConfigured(2));
        let err = WorkflowError::from_collaborator(raised);
        assert!(matches!(err, WorkflowError::MultipleAdminsConfigured(2)));
        assert_eq!(err.class(), ErrorClass::Configuration);

        let foreign = WorkflowError::from_collaborator(anyhow::anyhow!("connection reset"));
        assert!(matches!(foreign, WorkflowError::Other(_)));
        assert_eq!(foreign.class(), ErrorClass::Infrastructure);
    }
}
