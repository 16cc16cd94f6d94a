//! Service layer API for request workflow operations
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditSink, Notifier, TracingSink};
use crate::config::TimeoutConfig;
use crate::directory::{Directory, UserId, UserProfile, WorkflowTemplateStore};
use crate::error::{ErrorClass, Result, WorkflowError};
use crate::request::{Action, Attachment, Request, RequestFields, RequestType, TimeStamp};
use crate::resubmit::{self, Resubmission};
use crate::store::{RequestStore, Stored};
use crate::transition::{self, ActionRequest, Actor};
use crate::utils;
use crate::workflow::{Route, WorkflowResolver};

pub struct RequestService {
    instance: Arc<sled::Db>,
    store: RequestStore,
    directory: Arc<dyn Directory>,
    resolver: WorkflowResolver,
    notifier: Notifier,
    resolver_timeout: Duration,
}

impl RequestService {
    pub fn new(
        instance: Arc<sled::Db>,
        directory: Arc<dyn Directory>,
        templates: Arc<dyn WorkflowTemplateStore>,
    ) -> Result<Self> {
        let timeouts = TimeoutConfig::default();
        Ok(Self {
            store: RequestStore::open(&instance)?,
            instance,
            resolver: WorkflowResolver::new(templates, directory.clone()),
            directory,
            notifier: Notifier::new(Arc::new(TracingSink), timeouts.notifier()),
            resolver_timeout: timeouts.resolver(),
        })
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        let timeout = self.notifier_timeout();
        self.notifier = Notifier::new(sink, timeout);
        self
    }

    pub fn with_timeouts(mut self, timeouts: &TimeoutConfig) -> Self {
        self.resolver_timeout = timeouts.resolver();
        self.notifier = self.notifier.with_timeout(timeouts.notifier());
        self
    }

    fn notifier_timeout(&self) -> Duration {
        self.notifier.timeout()
    }

    /// Submit a new request. It is routed through the approval chain for the
    /// submitter's role, or approved on the spot for an administrator.
    #[tracing::instrument(skip(self, draft, cc, attachments))]
    pub async fn create_request(
        &self,
        submitter_id: &str,
        request_type: RequestType,
        draft: RequestFields,
        cc: Vec<UserId>,
        attachments: Vec<Attachment>,
    ) -> Result<Request> {
        draft.validate(request_type)?;

        let route = self
            .route_for(submitter_id, request_type)
            .await
            .inspect_err(report_configuration)?;

        let id = utils::new_request_id()?;
        let request = Request::create(
            id,
            submitter_id.to_string(),
            request_type,
            &draft,
            cc,
            attachments,
            route,
            TimeStamp::new(),
        )?;

        self.store.insert_new(&request)?;
        tracing::info!(
            request_id = %request.id(),
            status = ?request.status(),
            levels = request.approval_chain().len(),
            "request created"
        );

        self.notifier.publish(None, &request);
        Ok(request)
    }

    /// Approve at the next level, or with `force` as an administrator,
    /// approve outright.
    #[tracing::instrument(skip(self, comment))]
    pub async fn approve(
        &self,
        request_id: &str,
        actor_id: &str,
        comment: Option<String>,
        expected_version: u64,
        force: bool,
    ) -> Result<Request> {
        let action = ActionRequest::new(Action::Approve, Actor::new(actor_id))
            .forced(force)
            .with_comment(comment);
        self.transition(request_id, action, expected_version).await
    }

    #[tracing::instrument(skip(self, comment))]
    pub async fn reject(
        &self,
        request_id: &str,
        actor_id: &str,
        comment: Option<String>,
        expected_version: u64,
        force: bool,
    ) -> Result<Request> {
        let action = ActionRequest::new(Action::Reject, Actor::new(actor_id))
            .forced(force)
            .with_comment(comment);
        self.transition(request_id, action, expected_version).await
    }

    /// Send the request back to the submitter. The comment says what to fix.
    #[tracing::instrument(skip(self, comment))]
    pub async fn request_changes(
        &self,
        request_id: &str,
        actor_id: &str,
        comment: impl Into<String>,
        expected_version: u64,
    ) -> Result<Request> {
        let action = ActionRequest::new(Action::RequestChanges, Actor::new(actor_id))
            .with_comment(Some(comment.into()));
        self.transition(request_id, action, expected_version).await
    }

    #[tracing::instrument(skip(self, comment))]
    pub async fn cancel(
        &self,
        request_id: &str,
        actor_id: &str,
        comment: Option<String>,
        expected_version: u64,
    ) -> Result<Request> {
        let action =
            ActionRequest::new(Action::Cancel, Actor::new(actor_id)).with_comment(comment);
        self.transition(request_id, action, expected_version).await
    }

    /// Put a request that needs review back into the approval flow with
    /// revised content and a freshly resolved chain.
    #[tracing::instrument(skip(self, resubmission))]
    pub async fn resubmit(
        &self,
        request_id: &str,
        actor_id: &str,
        resubmission: Resubmission,
        expected_version: u64,
    ) -> Result<Request> {
        let action = ActionRequest::new(Action::Resubmit, Actor::new(actor_id))
            .with_comment(resubmission.comment.clone());

        let stored = self.load(request_id)?;
        if let Some(replayed) = self.check_version(&stored, &action, expected_version)? {
            return Ok(replayed);
        }

        // state and authority first, before any collaborator is asked
        transition::evaluate(&stored.request, &action)?;
        let revision = resubmit::prepare(&stored.request, &resubmission)?;

        let route = self
            .route_for(stored.request.submitted_by(), stored.request.request_type())
            .await
            .inspect_err(report_configuration)?;

        let next = stored
            .request
            .resubmit(&action, revision, route, TimeStamp::new())?;

        self.commit(&stored, &action, next)
    }

    /// Wait for queued audit events to be delivered, then flush committed
    /// requests to disk.
    pub async fn flush(&self) -> Result<()> {
        self.notifier.drain().await;
        self.instance.flush_async().await?;
        Ok(())
    }

    pub fn get(&self, request_id: &str) -> Result<Request> {
        Ok(self.load(request_id)?.request)
    }

    /// The request as it was right after commit `version`.
    pub fn revision(&self, request_id: &str, version: u64) -> Result<Option<Request>> {
        self.store.revision(request_id, version)
    }

    pub fn revisions(&self, request_id: &str) -> Result<Vec<Request>> {
        self.store.revisions(request_id)
    }

    /// Open requests whose next step belongs to `approver_id`.
    pub fn awaiting_approval_by(&self, approver_id: &str) -> Result<Vec<Request>> {
        self.filter(|r| {
            r.next_step()
                .is_some_and(|step| step.approver_id == approver_id)
        })
    }

    pub fn submitted_by(&self, user_id: &str) -> Result<Vec<Request>> {
        self.filter(|r| r.submitted_by() == user_id)
    }

    /// Requests `user_id` was copied on.
    pub fn copied_to(&self, user_id: &str) -> Result<Vec<Request>> {
        self.filter(|r| r.cc().contains(user_id))
    }

    fn filter(&self, keep: impl Fn(&Request) -> bool) -> Result<Vec<Request>> {
        Ok(self.store.scan()?.into_iter().filter(|r| keep(r)).collect())
    }

    fn load(&self, request_id: &str) -> Result<Stored> {
        self.store
            .load(request_id)?
            .ok_or_else(|| WorkflowError::RequestNotFound(request_id.to_string()))
    }

    async fn transition(
        &self,
        request_id: &str,
        action: ActionRequest,
        expected_version: u64,
    ) -> Result<Request> {
        let stored = self.load(request_id)?;
        if let Some(replayed) = self.check_version(&stored, &action, expected_version)? {
            return Ok(replayed);
        }

        let action = self.identify(action).await?;
        let next = stored.request.apply_transition(&action, TimeStamp::new())?;

        self.commit(&stored, &action, next)
    }

    fn commit(&self, stored: &Stored, action: &ActionRequest, next: Request) -> Result<Request> {
        match self.store.commit(stored, &next) {
            Ok(()) => {}
            Err(conflict @ WorkflowError::ConcurrentModification { .. }) => {
                return self.settle_conflict(stored, action, conflict);
            }
            Err(err) => return Err(err),
        }

        if let Some(entry) = next.latest_commit().next() {
            tracing::info!(
                request_id = %next.id(),
                action = ?entry.action,
                is_forced = entry.is_forced,
                from = ?stored.request.status(),
                to = ?next.status(),
                level = next.current_level(),
                version = next.version(),
                "transition committed"
            );
        }

        self.notifier.publish(Some(&stored.request), &next);
        Ok(next)
    }

    /// The commit lost its race. If the winner was this very call, sent twice,
    /// hand back the winner's result instead of the conflict.
    fn settle_conflict(
        &self,
        stored: &Stored,
        action: &ActionRequest,
        conflict: WorkflowError,
    ) -> Result<Request> {
        let fresh = self.load(stored.request.id())?;
        match self.check_version(&fresh, action, stored.request.version()) {
            Ok(Some(replayed)) => Ok(replayed),
            _ => Err(conflict),
        }
    }

    /// `Ok(None)` when the caller holds the current version. A stale version
    /// is only accepted as a replay of the very commit that followed it.
    fn check_version(
        &self,
        stored: &Stored,
        action: &ActionRequest,
        expected_version: u64,
    ) -> Result<Option<Request>> {
        let actual = stored.request.version();
        if actual == expected_version {
            return Ok(None);
        }

        if expected_version < actual {
            let replay = self
                .store
                .revision(stored.request.id(), expected_version + 1)?
                .filter(|r| r.committed_by(action.kind, &action.actor.id, action.force));

            if let Some(previous) = replay {
                tracing::debug!(
                    request_id = %previous.id(),
                    action = ?action.kind,
                    version = previous.version(),
                    "replayed action, returning committed result"
                );
                return Ok(Some(previous));
            }
        }

        Err(WorkflowError::ConcurrentModification {
            id: stored.request.id().to_string(),
            expected: expected_version,
            actual,
        })
    }

    // Forced actions need the actor's role; the others are decided by the
    // approval chain alone.
    async fn identify(&self, mut action: ActionRequest) -> Result<ActionRequest> {
        if action.force {
            let profile = self
                .bounded("directory", self.lookup_user(&action.actor.id))
                .await?;
            action.actor = action.actor.with_role(profile.role);
        }
        Ok(action)
    }

    async fn route_for(&self, submitter_id: &str, request_type: RequestType) -> Result<Route> {
        self.bounded("workflow resolver", async {
            let submitter = self.lookup_user(submitter_id).await?;
            self.resolver
                .resolve(request_type, submitter.role, &submitter.department)
                .await
        })
        .await
    }

    async fn lookup_user(&self, user_id: &str) -> Result<UserProfile> {
        self.directory
            .get_user(&user_id.to_string())
            .await
            .map_err(WorkflowError::from_collaborator)?
            .ok_or_else(|| WorkflowError::UnknownUser(user_id.to_string()))
    }

    async fn bounded<T>(
        &self,
        collaborator: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.resolver_timeout, call)
            .await
            .unwrap_or(Err(WorkflowError::CollaboratorTimeout(collaborator)))
    }
}

fn report_configuration(err: &WorkflowError) {
    if err.class() == ErrorClass::Configuration {
        tracing::error!(error = %err, "workflow configuration is incomplete");
    }
}
