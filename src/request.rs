//! Request aggregate and the value types it is built from
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

use super::directory::UserId;
use super::error::{Result, WorkflowError};
use super::resubmit::Revision;
use super::transition::{self, ActionRequest};
use super::workflow::{ApprovalChain, ApproverStep, Route};

/// Actor recorded on entries the engine writes on its own behalf.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
pub enum RequestType {
    #[n(0)]
    Leave,
    #[n(1)]
    Overtime,
    #[n(2)]
    BusinessTrip,
    #[n(3)]
    WorkFromHome,
    #[n(4)]
    Expense,
}

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd,
)]
pub enum Priority {
    #[n(0)]
    Low,
    #[n(1)]
    #[default]
    Normal,
    #[n(2)]
    High,
    #[n(3)]
    Urgent,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    ManagerApproved,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
    #[n(4)]
    NeedsReview,
    #[n(5)]
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Approved | RequestStatus::Rejected | RequestStatus::Cancelled
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum Action {
    #[n(0)]
    Create,
    #[n(1)]
    Approve,
    #[n(2)]
    Reject,
    #[n(3)]
    RequestChanges,
    #[n(4)]
    Resubmit,
    #[n(5)]
    Cancel,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// `Utc` itself has no ordering, so a derive would never apply.
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> std::result::Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _: &mut C,
    ) -> std::result::Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Opaque file metadata. The content lives in the blob store; `file_url`
/// identifies the file.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    #[n(0)]
    pub file_name: String,
    #[n(1)]
    pub file_url: String,
    #[n(2)]
    pub file_size: u64,
    #[n(3)]
    pub file_type: String,
}

impl Attachment {
    pub fn new(
        file_name: impl Into<String>,
        file_url: impl Into<String>,
        file_size: u64,
        file_type: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_url: file_url.into(),
            file_size,
            file_type: file_type.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.file_name.trim().is_empty() {
            return Err(WorkflowError::MissingRequiredField("file_name"));
        }
        if self.file_url.trim().is_empty() {
            return Err(WorkflowError::MissingRequiredField("file_url"));
        }
        Ok(())
    }
}

// Draft of the submitter-editable fields. Checked by `finalise`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestFields {
    subject: Option<String>,
    reason: Option<String>,
    start_date: Option<TimeStamp<Utc>>,
    end_date: Option<TimeStamp<Utc>>,
    hour: Option<f64>,
    priority: Priority,
}

/// Submitter-editable fields after validation.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct RequestDetails {
    #[n(0)]
    pub subject: String,
    #[n(1)]
    pub reason: String,
    #[n(2)]
    pub start_date: TimeStamp<Utc>,
    #[n(3)]
    pub end_date: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub hour: Option<f64>, // overtime only
    #[n(5)]
    pub priority: Priority,
}

impl RequestFields {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
    pub fn start_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.start_date = Some(date);
        self
    }
    pub fn end_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.end_date = Some(date);
        self
    }
    pub fn without_end_date(mut self) -> Self {
        self.end_date = None;
        self
    }
    pub fn hour(mut self, hour: f64) -> Self {
        self.hour = Some(hour);
        self
    }
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self, request_type: RequestType) -> Result<()> {
        self.finalise(request_type).map(|_| ())
    }

    /// Check the draft against the rules for `request_type` and produce the
    /// details stored on the request.
    pub fn finalise(&self, request_type: RequestType) -> Result<RequestDetails> {
        let subject = non_blank(self.subject.as_deref(), "subject")?;
        let reason = non_blank(self.reason.as_deref(), "reason")?;
        let start_date = self
            .start_date
            .clone()
            .ok_or(WorkflowError::MissingRequiredField("start_date"))?;

        if let Some(end_date) = &self.end_date {
            if *end_date < start_date {
                return Err(WorkflowError::InvalidField {
                    field: "end_date",
                    reason: format!("{} is before start date {}", end_date, start_date),
                });
            }
        }

        match (request_type, self.hour) {
            (RequestType::Overtime, None) => {
                return Err(WorkflowError::MissingRequiredField("hour"));
            }
            (RequestType::Overtime, Some(hour)) if !(hour > 0.0 && hour <= 24.0) => {
                return Err(WorkflowError::InvalidField {
                    field: "hour",
                    reason: format!("{} is outside (0, 24]", hour),
                });
            }
            (RequestType::Overtime, Some(_)) | (_, None) => {}
            (other, Some(_)) => {
                return Err(WorkflowError::InvalidField {
                    field: "hour",
                    reason: format!("only overtime requests carry hours, not {:?}", other),
                });
            }
        }

        Ok(RequestDetails {
            subject,
            reason,
            start_date,
            end_date: self.end_date.clone(),
            hour: self.hour,
            priority: self.priority,
        })
    }
}

impl RequestDetails {
    pub fn to_fields(&self) -> RequestFields {
        RequestFields {
            subject: Some(self.subject.clone()),
            reason: Some(self.reason.clone()),
            start_date: Some(self.start_date.clone()),
            end_date: self.end_date.clone(),
            hour: self.hour,
            priority: self.priority,
        }
    }
}

fn non_blank(value: Option<&str>, field: &'static str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(WorkflowError::MissingRequiredField(field)),
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    #[n(0)]
    pub field: String,
    #[n(1)]
    pub old: String,
    #[n(2)]
    pub new: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    #[n(0)]
    pub actor_id: UserId,
    #[n(1)]
    pub action: Action,
    #[n(2)]
    pub comment: Option<String>,
    #[n(3)]
    pub timestamp: TimeStamp<Utc>,
    #[n(4)]
    pub is_forced: bool,
    #[n(5)]
    pub status: RequestStatus, // status after this entry
    #[n(6)]
    pub version: u64, // commit that wrote this entry
    #[n(7)]
    pub changes: Vec<FieldChange>, // resubmit only
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Request {
    #[n(0)]
    id: String,
    #[n(1)]
    request_type: RequestType,
    #[n(2)]
    submitted_by: UserId,
    #[n(3)]
    details: RequestDetails,
    #[n(4)]
    status: RequestStatus,
    #[n(5)]
    approval_chain: ApprovalChain,
    #[n(6)]
    current_level: u32,
    #[n(7)]
    history: Vec<HistoryEntry>,
    #[n(8)]
    cc: BTreeSet<UserId>,
    #[n(9)]
    attachments: Vec<Attachment>,
    #[n(10)]
    version: u64,
}

impl Request {
    /// Build a freshly submitted request. An admin route approves it within
    /// the same commit, recorded as a system approval.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: String,
        submitted_by: UserId,
        request_type: RequestType,
        fields: &RequestFields,
        cc: impl IntoIterator<Item = UserId>,
        attachments: Vec<Attachment>,
        route: Route,
        now: TimeStamp<Utc>,
    ) -> Result<Self> {
        let details = fields.finalise(request_type)?;
        for attachment in &attachments {
            attachment.validate()?;
        }

        let bypass = route.is_bypass();
        let mut request = Self {
            id,
            request_type,
            submitted_by: submitted_by.clone(),
            details,
            status: RequestStatus::Pending,
            approval_chain: route.into_chain(),
            current_level: 0,
            history: vec![],
            cc: cc.into_iter().collect(),
            attachments,
            version: 1,
        };
        request.record(submitted_by, Action::Create, None, false, now.clone(), vec![]);

        if bypass {
            request.auto_approve(now);
        }

        Ok(request)
    }

    /// The single mutation entry point for approve, reject, request changes
    /// and cancel. Legality is decided by [`transition::evaluate`]; the
    /// result is a new snapshot one version ahead.
    pub fn apply_transition(&self, action: &ActionRequest, now: TimeStamp<Utc>) -> Result<Self> {
        if matches!(action.kind, Action::Create | Action::Resubmit) {
            return Err(WorkflowError::InvalidTransition {
                from: self.status,
                action: action.kind,
            });
        }

        let outcome = transition::evaluate(self, action)?;

        let mut next = self.clone();
        next.status = outcome.to;
        next.current_level = outcome.level;
        next.version += 1;
        next.record(
            action.actor.id.clone(),
            action.kind,
            action.comment.clone(),
            outcome.forced,
            now,
            vec![],
        );

        Ok(next)
    }

    /// Re-open a request sent back for review with revised content and a
    /// freshly resolved route.
    pub fn resubmit(
        &self,
        action: &ActionRequest,
        revision: Revision,
        route: Route,
        now: TimeStamp<Utc>,
    ) -> Result<Self> {
        if action.kind != Action::Resubmit {
            return Err(WorkflowError::InvalidTransition {
                from: self.status,
                action: action.kind,
            });
        }

        let outcome = transition::evaluate(self, action)?;
        let bypass = route.is_bypass();

        let mut next = self.clone();
        next.details = revision.details;
        next.attachments = revision.attachments;
        next.approval_chain = route.into_chain();
        next.current_level = outcome.level;
        next.status = outcome.to;
        next.version += 1;
        next.record(
            action.actor.id.clone(),
            Action::Resubmit,
            action.comment.clone(),
            false,
            now.clone(),
            revision.changes,
        );

        if bypass {
            next.auto_approve(now);
        }

        Ok(next)
    }

    fn auto_approve(&mut self, now: TimeStamp<Utc>) {
        self.status = RequestStatus::Approved;
        self.current_level = self.approval_chain.len();
        self.record(
            SYSTEM_ACTOR.to_string(),
            Action::Approve,
            Some("submitted by an administrator".to_string()),
            false,
            now,
            vec![],
        );
    }

    fn record(
        &mut self,
        actor_id: UserId,
        action: Action,
        comment: Option<String>,
        is_forced: bool,
        timestamp: TimeStamp<Utc>,
        changes: Vec<FieldChange>,
    ) {
        self.history.push(HistoryEntry {
            actor_id,
            action,
            comment,
            timestamp,
            is_forced,
            status: self.status,
            version: self.version,
            changes,
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn request_type(&self) -> RequestType {
        self.request_type
    }
    pub fn submitted_by(&self) -> &UserId {
        &self.submitted_by
    }
    pub fn details(&self) -> &RequestDetails {
        &self.details
    }
    pub fn status(&self) -> RequestStatus {
        self.status
    }
    pub fn approval_chain(&self) -> &ApprovalChain {
        &self.approval_chain
    }
    pub fn current_level(&self) -> u32 {
        self.current_level
    }
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }
    pub fn cc(&self) -> &BTreeSet<UserId> {
        &self.cc
    }
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Step whose approver acts next, if the request is waiting on one.
    pub fn next_step(&self) -> Option<&ApproverStep> {
        match self.status {
            RequestStatus::Pending | RequestStatus::ManagerApproved => {
                self.approval_chain.step(self.current_level + 1)
            }
            _ => None,
        }
    }

    /// Entries written by the commit that produced this snapshot.
    pub fn latest_commit(&self) -> impl Iterator<Item = &HistoryEntry> {
        let version = self.version;
        self.history.iter().filter(move |e| e.version == version)
    }

    /// Whether this snapshot's commit was the given action by the given actor.
    pub fn committed_by(&self, action: Action, actor_id: &str, forced: bool) -> bool {
        self.latest_commit()
            .next()
            .is_some_and(|e| e.action == action && e.actor_id == actor_id && e.is_forced == forced)
    }

    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(minicbor::decode(bytes)?)
    }
}
