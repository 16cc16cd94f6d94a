//! Two-level leave request from submission to approval.
//!
//! `cargo run --example walkthrough [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use request_workflow::{
    RequestService,
    config::EngineConfig,
    directory::{InMemoryDirectory, InMemoryTemplates, Role, UserProfile},
    request::{RequestFields, RequestType, TimeStamp},
    telemetry,
    workflow::ApproverStep,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = EngineConfig::load(path.as_deref())?;
    if path.is_none() {
        config.storage.temporary = true;
    }
    telemetry::init_tracing(&config.logging);

    let db = Arc::new(config.storage.open().context("opening request store")?);

    let directory = Arc::new(InMemoryDirectory::with_users([
        UserProfile::new("alice", Role::Employee, "ops").with_manager("mgr"),
        UserProfile::new("mgr", Role::Manager, "ops"),
        UserProfile::new("root", Role::Admin, "it"),
    ]));
    let templates = Arc::new(InMemoryTemplates::new());
    templates
        .activate(
            RequestType::Leave,
            vec![
                ApproverStep::new(1, "mgr", Role::Manager),
                ApproverStep::new(2, "root", Role::Admin),
            ],
        )
        .await;

    let service =
        RequestService::new(db, directory, templates)?.with_timeouts(&config.timeouts);

    let fields = RequestFields::new()
        .subject("Annual leave")
        .reason("Family trip")
        .start_date(TimeStamp::new());
    let request = service
        .create_request("alice", RequestType::Leave, fields, vec!["mgr".into()], vec![])
        .await?;
    let request = service
        .approve(request.id(), "mgr", None, request.version(), false)
        .await?;
    let request = service
        .approve(request.id(), "root", Some("enjoy".into()), request.version(), false)
        .await?;

    for entry in request.history() {
        println!(
            "v{} {:<8} {:?} -> {:?}",
            entry.version, entry.actor_id, entry.action, entry.status
        );
    }
    service.flush().await?;
    Ok(())
}
