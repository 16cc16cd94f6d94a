//! Post-commit notification of transitions.
//!
//! The engine hands every committed snapshot to a [`Notifier`], which turns
//! the history entries of that commit into [`AuditEvent`]s and queues them for
//! the configured [`AuditSink`]. Delivery happens off the caller's path. A
//! sink that fails or stalls is logged and otherwise ignored: by the time it
//! is called the transition is durable.
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::directory::UserId;
use crate::error::Result;
use crate::request::{Action, Request, RequestStatus, TimeStamp};

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub request_id: String,
    pub action: Action,
    pub actor_id: UserId,
    pub is_forced: bool,
    /// `None` for the create entry.
    pub from: Option<RequestStatus>,
    pub to: RequestStatus,
    pub version: u64,
    /// sha256 of the CBOR snapshot `after`.
    pub digest: String,
    pub occurred_at: TimeStamp<Utc>,
    pub before: Option<Request>,
    pub after: Request,
}

impl AuditEvent {
    /// One event per history entry written by `after`'s commit, in order.
    pub fn for_commit(before: Option<&Request>, after: &Request) -> Result<Vec<AuditEvent>> {
        let (digest, _) = after.encode()?;
        let mut from = before.map(|b| b.status());

        let events = after
            .latest_commit()
            .map(|entry| {
                let event = AuditEvent {
                    request_id: after.id().to_string(),
                    action: entry.action,
                    actor_id: entry.actor_id.clone(),
                    is_forced: entry.is_forced,
                    from,
                    to: entry.status,
                    version: entry.version,
                    digest: digest.clone(),
                    occurred_at: entry.timestamp.clone(),
                    before: before.cloned(),
                    after: after.clone(),
                };
                from = Some(entry.status);
                event
            })
            .collect();

        Ok(events)
    }

    /// Users who should hear about this event besides the actor: the
    /// submitter, the CC list and whoever acts next.
    pub fn recipients(&self) -> Vec<UserId> {
        let candidates = std::iter::once(self.after.submitted_by())
            .chain(self.after.cc().iter())
            .chain(self.after.next_step().map(|s| &s.approver_id));

        let mut recipients: Vec<UserId> = vec![];
        for user in candidates {
            if *user != self.actor_id && !recipients.contains(user) {
                recipients.push(user.clone());
            }
        }
        recipients
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Writes events to the log. Default sink when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        tracing::info!(
            request_id = %event.request_id,
            action = ?event.action,
            actor_id = %event.actor_id,
            is_forced = event.is_forced,
            from = ?event.from,
            to = ?event.to,
            version = event.version,
            digest = %event.digest,
            "request transition"
        );
        Ok(())
    }
}

/// Events waiting beyond this are dropped with a warning.
const QUEUE_DEPTH: usize = 1024;

enum Job {
    Deliver(Vec<AuditEvent>),
    Drained(oneshot::Sender<()>),
}

/// Hands committed snapshots to the sink from a background task, so callers
/// never wait on delivery. The task is started on the first publish, on the
/// runtime that publish runs in.
pub struct Notifier {
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
    queue: OnceLock<mpsc::Sender<Job>>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self {
            sink,
            timeout,
            queue: OnceLock::new(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self::new(self.sink, timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Queue the events of `after`'s commit for delivery. Never fails and
    /// never waits on the sink.
    pub fn publish(&self, before: Option<&Request>, after: &Request) {
        let events = match AuditEvent::for_commit(before, after) {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(request_id = %after.id(), error = %err, "could not build audit events");
                return;
            }
        };

        let Some(queue) = self.queue() else {
            tracing::warn!(request_id = %after.id(), "no runtime to deliver audit events on, dropping them");
            return;
        };

        match queue.try_send(Job::Deliver(events)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => tracing::warn!(
                request_id = %after.id(),
                version = after.version(),
                "audit queue full, dropping events"
            ),
            Err(mpsc::error::TrySendError::Closed(_)) => tracing::warn!(
                request_id = %after.id(),
                version = after.version(),
                "audit queue closed, dropping events"
            ),
        }
    }

    /// Wait until everything published so far has been handed to the sink,
    /// or given up on.
    pub async fn drain(&self) {
        let Some(queue) = self.queue.get() else {
            return;
        };
        let (done, drained) = oneshot::channel();
        if queue.send(Job::Drained(done)).await.is_ok() {
            let _ = drained.await;
        }
    }

    fn queue(&self) -> Option<&mpsc::Sender<Job>> {
        if let Some(queue) = self.queue.get() {
            return Some(queue);
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;

        Some(self.queue.get_or_init(|| {
            let (queue, jobs) = mpsc::channel(QUEUE_DEPTH);
            runtime.spawn(deliver(self.sink.clone(), self.timeout, jobs));
            queue
        }))
    }
}

async fn deliver(sink: Arc<dyn AuditSink>, timeout: Duration, mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Deliver(events) => {
                for event in events {
                    record(sink.as_ref(), timeout, &event).await;
                }
            }
            Job::Drained(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn record(sink: &dyn AuditSink, timeout: Duration, event: &AuditEvent) {
    match tokio::time::timeout(timeout, sink.record(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(
            request_id = %event.request_id,
            action = ?event.action,
            error = %err,
            "audit sink failed, transition stands"
        ),
        Err(_) => tracing::warn!(
            request_id = %event.request_id,
            action = ?event.action,
            timeout_ms = timeout.as_millis() as u64,
            "audit sink timed out, transition stands"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Role;
    use crate::request::RequestFields;
    use crate::request::RequestType;
    use crate::transition::{ActionRequest, Actor};
    use crate::workflow::{ApprovalChain, ApproverStep, Route};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<AuditEvent>>);

    #[async_trait]
    impl AuditSink for Collecting {
        async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
            self.0.lock().await.push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl AuditSink for Failing {
        async fn record(&self, _: &AuditEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    struct Stalled;

    #[async_trait]
    impl AuditSink for Stalled {
        async fn record(&self, _: &AuditEvent) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn create(route: Route) -> Request {
        let fields = RequestFields::new()
            .subject("Remote week")
            .reason("Moving house")
            .start_date(TimeStamp::new());
        Request::create(
            "req_a".into(),
            "alice".into(),
            RequestType::WorkFromHome,
            &fields,
            ["carol".to_string()],
            vec![],
            route,
            TimeStamp::new(),
        )
        .unwrap()
    }

    fn one_level() -> Route {
        Route::Chain(ApprovalChain::new(vec![ApproverStep::new(1, "mgr", Role::Manager)]).unwrap())
    }

    #[tokio::test]
    async fn bypass_create_emits_two_events() {
        let sink = Arc::new(Collecting::default());
        let notifier = Notifier::new(sink.clone(), Duration::from_secs(1));

        let request = create(Route::Bypass);
        notifier.publish(None, &request);
        notifier.drain().await;

        let events = sink.0.lock().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, Action::Create);
        assert_eq!(events[0].from, None);
        assert_eq!(events[0].to, RequestStatus::Pending);
        assert_eq!(events[1].from, Some(RequestStatus::Pending));
        assert_eq!(events[1].to, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn transition_event_carries_before_and_after() {
        let sink = Arc::new(Collecting::default());
        let notifier = Notifier::new(sink.clone(), Duration::from_secs(1));

        let before = create(one_level());
        let after = before
            .apply_transition(
                &ActionRequest::new(Action::Approve, Actor::new("mgr")),
                TimeStamp::new(),
            )
            .unwrap();
        notifier.publish(Some(&before), &after);
        notifier.drain().await;

        let events = sink.0.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].before.as_ref(), Some(&before));
        assert_eq!(events[0].after, after);
        assert_eq!(events[0].digest, after.encode().unwrap().0);
        assert_eq!(events[0].recipients(), vec!["alice".to_string(), "carol".to_string()]);
    }

    #[tokio::test]
    async fn failing_sink_is_swallowed() {
        let notifier = Notifier::new(Arc::new(Failing), Duration::from_secs(1));
        notifier.publish(None, &create(one_level()));
        notifier.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_sink_is_cut_off() {
        let notifier = Notifier::new(Arc::new(Stalled), Duration::from_millis(50));
        let started = tokio::time::Instant::now();

        notifier.publish(None, &create(Route::Bypass));
        assert_eq!(started.elapsed(), Duration::ZERO);

        // both events wait out their own timeout in the background
        notifier.drain().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn drain_before_any_publish_returns() {
        let notifier = Notifier::new(Arc::new(Failing), Duration::from_secs(1));
        notifier.drain().await;
    }

    #[test]
    fn publish_outside_a_runtime_is_dropped() {
        let sink = Arc::new(Collecting::default());
        let notifier = Notifier::new(sink.clone(), Duration::from_secs(1));
        notifier.publish(None, &create(one_level()));
        assert!(notifier.queue.get().is_none());
    }
}
