//! Preparing a request that was sent back for review to go round again.
//!
//! The handler only works out the revised content: merged fields, the
//! reconciled attachment list and a field-by-field change summary. State,
//! authority and the new approval chain are handled by the transition
//! table and the resolver.
use chrono::Utc;

use crate::error::{Result, WorkflowError};
use crate::request::{Attachment, FieldChange, Priority, Request, RequestDetails, TimeStamp};

/// Partial update of the editable fields. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPatch {
    subject: Option<String>,
    reason: Option<String>,
    start_date: Option<TimeStamp<Utc>>,
    /// `Some(None)` clears the end date
    end_date: Option<Option<TimeStamp<Utc>>>,
    hour: Option<f64>,
    priority: Option<Priority>,
}

impl RequestPatch {
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
        self.end_date = Some(Some(date));
        self
    }
    /// Turn the request back into an open-ended one.
    pub fn clear_end_date(mut self) -> Self {
        self.end_date = Some(None);
        self
    }
    pub fn hour(mut self, hour: f64) -> Self {
        self.hour = Some(hour);
        self
    }
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    fn apply(&self, current: &RequestDetails) -> crate::request::RequestFields {
        let mut fields = current.to_fields();
        if let Some(subject) = &self.subject {
            fields = fields.subject(subject.clone());
        }
        if let Some(reason) = &self.reason {
            fields = fields.reason(reason.clone());
        }
        if let Some(date) = &self.start_date {
            fields = fields.start_date(date.clone());
        }
        match &self.end_date {
            Some(Some(date)) => fields = fields.end_date(date.clone()),
            Some(None) => fields = fields.without_end_date(),
            None => {}
        }
        if let Some(hour) = self.hour {
            fields = fields.hour(hour);
        }
        if let Some(priority) = self.priority {
            fields = fields.priority(priority);
        }
        fields
    }
}

/// What the submitter sends when resubmitting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resubmission {
    pub patch: RequestPatch,
    /// Current attachments to keep. Anything left out is dropped.
    pub existing_attachments: Vec<Attachment>,
    pub new_attachments: Vec<Attachment>,
    pub comment: Option<String>,
}

impl Resubmission {
    pub fn new(patch: RequestPatch) -> Self {
        Self {
            patch,
            ..Self::default()
        }
    }
    pub fn keep(mut self, attachments: impl IntoIterator<Item = Attachment>) -> Self {
        self.existing_attachments.extend(attachments);
        self
    }
    pub fn add(mut self, attachments: impl IntoIterator<Item = Attachment>) -> Self {
        self.new_attachments.extend(attachments);
        self
    }
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Revised content, ready to be applied by [`Request::resubmit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub details: RequestDetails,
    pub attachments: Vec<Attachment>,
    pub changes: Vec<FieldChange>,
}

pub fn prepare(request: &Request, resubmission: &Resubmission) -> Result<Revision> {
    let details = resubmission
        .patch
        .apply(request.details())
        .finalise(request.request_type())?;

    let attachments = reconcile_attachments(
        request.attachments(),
        &resubmission.existing_attachments,
        &resubmission.new_attachments,
    )?;

    let mut changes = diff_details(request.details(), &details);
    if attachments.as_slice() != request.attachments() {
        changes.push(change(
            "attachments",
            list_names(request.attachments()),
            list_names(&attachments),
        ));
    }

    Ok(Revision {
        details,
        attachments,
        changes,
    })
}

// Kept attachments must already be on the request (matched by url); the
// stored record wins over whatever metadata the caller echoed back.
fn reconcile_attachments(
    current: &[Attachment],
    keep: &[Attachment],
    add: &[Attachment],
) -> Result<Vec<Attachment>> {
    let mut merged: Vec<Attachment> = Vec::with_capacity(keep.len() + add.len());

    for wanted in keep {
        let stored = current
            .iter()
            .find(|a| a.file_url == wanted.file_url)
            .ok_or_else(|| WorkflowError::InvalidAttachmentReference(wanted.file_url.clone()))?;
        if !merged.iter().any(|a| a.file_url == stored.file_url) {
            merged.push(stored.clone());
        }
    }

    for attachment in add {
        attachment.validate()?;
        if !merged.iter().any(|a| a.file_url == attachment.file_url) {
            merged.push(attachment.clone());
        }
    }

    Ok(merged)
}

fn diff_details(old: &RequestDetails, new: &RequestDetails) -> Vec<FieldChange> {
    let mut changes = vec![];

    if old.subject != new.subject {
        changes.push(change("subject", old.subject.clone(), new.subject.clone()));
    }
    if old.reason != new.reason {
        changes.push(change("reason", old.reason.clone(), new.reason.clone()));
    }
    if old.start_date != new.start_date {
        changes.push(change(
            "start_date",
            old.start_date.to_string(),
            new.start_date.to_string(),
        ));
    }
    if old.end_date != new.end_date {
        changes.push(change(
            "end_date",
            optional(old.end_date.as_ref()),
            optional(new.end_date.as_ref()),
        ));
    }
    if old.hour != new.hour {
        changes.push(change("hour", optional(old.hour), optional(new.hour)));
    }
    if old.priority != new.priority {
        changes.push(change(
            "priority",
            format!("{:?}", old.priority),
            format!("{:?}", new.priority),
        ));
    }

    changes
}

fn change(field: &str, old: String, new: String) -> FieldChange {
    FieldChange {
        field: field.to_string(),
        old,
        new,
    }
}

fn optional<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn list_names(attachments: &[Attachment]) -> String {
    attachments
        .iter()
        .map(|a| a.file_name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
