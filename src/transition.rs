//! State machine for approval requests.
//!
//! Every legal move is one row of [`RULES`], keyed by the current status,
//! the action and whether the action is forced. A row names who may take
//! it and what it does to the request. Anything without a row is refused.
//!
//! ```text
//! Pending ──approve──▶ ManagerApproved ──approve──▶ Approved
//!    │  ╲                    │
//!    │   request changes     reject / force-reject ──▶ Rejected
//!    │        ╲
//!    cancel    ▶ NeedsReview ──resubmit──▶ Pending
//!    ▼
//! Cancelled
//! ```
use crate::directory::{Role, UserId};
use crate::error::{Result, WorkflowError};
use crate::request::{Action, Request, RequestStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    /// Known only when the directory was consulted, which the engine does
    /// for forced actions.
    pub role: Option<Role>,
}

impl Actor {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            role: None,
        }
    }
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
    fn is_admin(&self) -> bool {
        self.role == Some(Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub kind: Action,
    pub actor: Actor,
    pub force: bool,
    pub comment: Option<String>,
}

impl ActionRequest {
    pub fn new(kind: Action, actor: Actor) -> Self {
        Self {
            kind,
            actor,
            force: false,
            comment: None,
        }
    }
    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }
}

/// Who may take a row's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authority {
    /// The approver at `current_level + 1`.
    NextApprover,
    Admin,
    Submitter,
    /// The submitter, as long as no level has approved yet.
    SubmitterBeforeApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    /// One level up; approved once the last level signs.
    Advance,
    /// Skip the remaining levels.
    ApproveAll,
    Reject,
    SendBack,
    Reopen,
    Cancel,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    from: RequestStatus,
    action: Action,
    force: bool,
    authority: Authority,
    effect: Effect,
}

const fn rule(
    from: RequestStatus,
    action: Action,
    force: bool,
    authority: Authority,
    effect: Effect,
) -> Rule {
    Rule {
        from,
        action,
        force,
        authority,
        effect,
    }
}

use Action::{Approve, Cancel, Reject, RequestChanges, Resubmit};
use Authority::{Admin, NextApprover, Submitter, SubmitterBeforeApproval};
use RequestStatus::{ManagerApproved, NeedsReview, Pending};

const RULES: &[Rule] = &[
    rule(Pending, Approve, false, NextApprover, Effect::Advance),
    rule(ManagerApproved, Approve, false, NextApprover, Effect::Advance),
    rule(Pending, Approve, true, Admin, Effect::ApproveAll),
    rule(ManagerApproved, Approve, true, Admin, Effect::ApproveAll),
    rule(Pending, Reject, false, NextApprover, Effect::Reject),
    rule(ManagerApproved, Reject, false, NextApprover, Effect::Reject),
    rule(Pending, Reject, true, Admin, Effect::Reject),
    rule(ManagerApproved, Reject, true, Admin, Effect::Reject),
    rule(NeedsReview, Reject, true, Admin, Effect::Reject),
    rule(Pending, RequestChanges, false, NextApprover, Effect::SendBack),
    rule(ManagerApproved, RequestChanges, false, NextApprover, Effect::SendBack),
    rule(NeedsReview, Resubmit, false, Submitter, Effect::Reopen),
    rule(Pending, Cancel, false, SubmitterBeforeApproval, Effect::Cancel),
    rule(ManagerApproved, Cancel, false, SubmitterBeforeApproval, Effect::Cancel),
    rule(NeedsReview, Cancel, false, Submitter, Effect::Cancel),
];

/// Result of a legal transition, applied by the request aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub to: RequestStatus,
    pub level: u32,
    pub forced: bool,
}

/// Whether the table has a row for this move at all, regardless of actor.
pub fn is_defined(from: RequestStatus, action: Action, force: bool) -> bool {
    find_rule(from, action, force).is_some()
}

fn find_rule(from: RequestStatus, action: Action, force: bool) -> Option<&'static Rule> {
    RULES
        .iter()
        .find(|r| r.from == from && r.action == action && r.force == force)
}

/// Decide whether `action` may be applied to `request` and what it yields.
/// Pure: reads the request, never changes it.
pub fn evaluate(request: &Request, action: &ActionRequest) -> Result<Outcome> {
    let from = request.status();

    if from.is_terminal() {
        return Err(WorkflowError::TerminalState(from));
    }

    let rule = find_rule(from, action.kind, action.force).ok_or(
        WorkflowError::InvalidTransition {
            from,
            action: action.kind,
        },
    )?;

    authorize(request, &action.actor, rule.authority)?;

    if rule.effect == Effect::SendBack
        && action.comment.as_deref().is_none_or(|c| c.trim().is_empty())
    {
        return Err(WorkflowError::MissingRequiredField("comment"));
    }

    let chain_len = request.approval_chain().len();
    let level = request.current_level();

    let (to, level) = match rule.effect {
        Effect::Advance => {
            let level = level + 1;
            if level >= chain_len {
                (RequestStatus::Approved, chain_len)
            } else {
                (RequestStatus::ManagerApproved, level)
            }
        }
        Effect::ApproveAll => (RequestStatus::Approved, chain_len),
        Effect::Reject => (RequestStatus::Rejected, level),
        Effect::SendBack => (RequestStatus::NeedsReview, level),
        Effect::Reopen => (RequestStatus::Pending, 0),
        Effect::Cancel => (RequestStatus::Cancelled, level),
    };

    Ok(Outcome {
        to,
        level,
        forced: rule.force,
    })
}

fn authorize(request: &Request, actor: &Actor, authority: Authority) -> Result<()> {
    match authority {
        NextApprover => {
            let expected_level = request.current_level() + 1;
            let chain = request.approval_chain();

            match chain.step(expected_level) {
                Some(step) if step.approver_id == actor.id => Ok(()),
                _ if chain.level_of(&actor.id).is_some() => Err(WorkflowError::NotYourTurn {
                    actor: actor.id.clone(),
                    expected_level,
                }),
                _ => Err(WorkflowError::ActorNotApprover(actor.id.clone())),
            }
        }
        Admin if actor.is_admin() => Ok(()),
        Admin => Err(WorkflowError::AdminRequired(actor.id.clone())),
        Submitter | SubmitterBeforeApproval if actor.id != *request.submitted_by() => {
            Err(WorkflowError::NotSubmitter(actor.id.clone()))
        }
        SubmitterBeforeApproval if request.current_level() > 0 => {
            Err(WorkflowError::AlreadyInProgress {
                current_level: request.current_level(),
            })
        }
        Submitter | SubmitterBeforeApproval => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestFields, RequestType, TimeStamp};
    use crate::workflow::{ApprovalChain, ApproverStep, Route};

    const STATUSES: [RequestStatus; 6] = [
        RequestStatus::Pending,
        RequestStatus::ManagerApproved,
        RequestStatus::Approved,
        RequestStatus::Rejected,
        RequestStatus::NeedsReview,
        RequestStatus::Cancelled,
    ];

    fn three_level_request() -> Request {
        let fields = RequestFields::new()
            .subject("Conference")
            .reason("Talk accepted")
            .start_date(TimeStamp::new());
        let chain = ApprovalChain::new(vec![
            ApproverStep::new(1, "lead", Role::Manager),
            ApproverStep::new(2, "head", Role::Manager),
            ApproverStep::new(3, "root", Role::Admin),
        ])
        .unwrap();

        Request::create(
            "req_t".into(),
            "alice".into(),
            RequestType::BusinessTrip,
            &fields,
            [],
            vec![],
            Route::Chain(chain),
            TimeStamp::new(),
        )
        .unwrap()
    }

    fn act(kind: Action, actor: &str) -> ActionRequest {
        ActionRequest::new(kind, Actor::new(actor))
    }

    fn admin(kind: Action) -> ActionRequest {
        ActionRequest::new(kind, Actor::new("root").with_role(Role::Admin)).forced(true)
    }

    #[test]
    fn table_has_no_duplicate_rows() {
        for (i, a) in RULES.iter().enumerate() {
            for b in &RULES[i + 1..] {
                assert!(
                    !(a.from == b.from && a.action == b.action && a.force == b.force),
                    "duplicate row for {:?} {:?} force={}",
                    a.from,
                    a.action,
                    a.force
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_rows() {
        let actions = [Approve, Reject, RequestChanges, Resubmit, Cancel, Action::Create];
        for status in STATUSES.iter().filter(|s| s.is_terminal()) {
            for action in actions {
                for force in [false, true] {
                    assert!(!is_defined(*status, action, force));
                }
            }
        }
    }

    #[test]
    fn force_reject_is_defined_for_every_open_status() {
        for status in STATUSES.iter().filter(|s| !s.is_terminal()) {
            assert!(is_defined(*status, Reject, true), "{:?}", status);
        }
        assert!(!is_defined(NeedsReview, Approve, true));
        assert!(!is_defined(Pending, Cancel, true));
    }

    #[test]
    fn approvals_advance_one_level_at_a_time() {
        let request = three_level_request();

        let outcome = evaluate(&request, &act(Approve, "lead")).unwrap();
        assert_eq!(outcome.to, RequestStatus::ManagerApproved);
        assert_eq!(outcome.level, 1);
        assert!(!outcome.forced);

        let request = request.apply_transition(&act(Approve, "lead"), TimeStamp::new()).unwrap();
        let request = request.apply_transition(&act(Approve, "head"), TimeStamp::new()).unwrap();
        assert_eq!(request.status(), RequestStatus::ManagerApproved);

        let request = request.apply_transition(&act(Approve, "root"), TimeStamp::new()).unwrap();
        assert_eq!(request.status(), RequestStatus::Approved);
        assert_eq!(request.current_level(), 3);
    }

    #[test]
    fn out_of_order_approver_is_told_to_wait() {
        let request = three_level_request();

        let err = evaluate(&request, &act(Approve, "head")).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::NotYourTurn {
                expected_level: 1,
                ..
            }
        ));

        let err = evaluate(&request, &act(Approve, "mallory")).unwrap_err();
        assert!(matches!(err, WorkflowError::ActorNotApprover(_)));
    }

    #[test]
    fn force_requires_admin_role() {
        let request = three_level_request();

        let pretender = ActionRequest::new(Approve, Actor::new("lead")).forced(true);
        assert!(matches!(
            evaluate(&request, &pretender),
            Err(WorkflowError::AdminRequired(_))
        ));

        let outcome = evaluate(&request, &admin(Approve)).unwrap();
        assert_eq!(outcome.to, RequestStatus::Approved);
        assert_eq!(outcome.level, 3);
        assert!(outcome.forced);
    }

    #[test]
    fn request_changes_needs_a_comment() {
        let request = three_level_request();

        let err = evaluate(&request, &act(RequestChanges, "lead")).unwrap_err();
        assert!(matches!(err, WorkflowError::MissingRequiredField("comment")));

        let outcome = evaluate(
            &request,
            &act(RequestChanges, "lead").with_comment(Some("fix dates".into())),
        )
        .unwrap();
        assert_eq!(outcome.to, RequestStatus::NeedsReview);
    }

    #[test]
    fn cancel_window_closes_after_first_approval() {
        let request = three_level_request();
        assert!(matches!(
            evaluate(&request, &act(Cancel, "lead")),
            Err(WorkflowError::NotSubmitter(_))
        ));
        assert_eq!(
            evaluate(&request, &act(Cancel, "alice")).unwrap().to,
            RequestStatus::Cancelled
        );

        let request = request.apply_transition(&act(Approve, "lead"), TimeStamp::new()).unwrap();
        assert!(matches!(
            evaluate(&request, &act(Cancel, "alice")),
            Err(WorkflowError::AlreadyInProgress { current_level: 1 })
        ));
    }

    #[test]
    fn terminal_requests_refuse_everything() {
        let request = three_level_request()
            .apply_transition(&admin(Reject), TimeStamp::new())
            .unwrap();
        assert_eq!(request.status(), RequestStatus::Rejected);
        assert!(request.history().last().unwrap().is_forced);

        for action in [act(Approve, "lead"), act(Cancel, "alice"), admin(Approve), admin(Reject)] {
            assert!(matches!(
                evaluate(&request, &action),
                Err(WorkflowError::TerminalState(RequestStatus::Rejected))
            ));
        }
    }

    #[test]
    fn resubmit_only_from_needs_review() {
        let request = three_level_request();
        assert!(matches!(
            evaluate(&request, &act(Resubmit, "alice")),
            Err(WorkflowError::InvalidTransition { .. })
        ));

        let request = request
            .apply_transition(
                &act(RequestChanges, "lead").with_comment(Some("more detail".into())),
                TimeStamp::new(),
            )
            .unwrap();
        let outcome = evaluate(&request, &act(Resubmit, "alice")).unwrap();
        assert_eq!(outcome.to, RequestStatus::Pending);
        assert_eq!(outcome.level, 0);
        assert!(matches!(
            evaluate(&request, &act(Resubmit, "lead")),
            Err(WorkflowError::NotSubmitter(_))
        ));
    }
}
