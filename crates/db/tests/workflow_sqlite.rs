use std::sync::Arc;

use rust_decimal::Decimal;
use tempfile::TempDir;
use tollgate_core::audit::InMemoryAuditSink;
use tollgate_core::catalog::ThresholdCatalog;
use tollgate_core::domain::approval::{Actor, EntityType, RequestStatus};
use tollgate_core::domain::entity::{EntityStatus, ProtectedEntity};
use tollgate_core::errors::WorkflowError;
use tollgate_core::notify::{BroadcastPublisher, Contact, NotificationFanout, NotificationSettings};
use tollgate_core::ports::EntityStore;
use tollgate_core::service::{
    ApprovalWorkflow, ProtectedSubmission, SubmitOutcome, WorkflowPorts, WorkflowSettings,
};
use tollgate_db::repositories::{
    SqlApprovalRepository, SqlCatalogRepository, SqlContactDirectory, SqlDispatchQueueRepository,
    SqlEmailOutbox, SqlEntityRepository,
};
use tollgate_db::{connect_with_settings, migrations, DbPool};

struct Harness {
    _dir: TempDir,
    pool: DbPool,
    workflow: Arc<ApprovalWorkflow>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("workflow.db").display());
    let pool = connect_with_settings(&url, 4, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrate");
    SqlCatalogRepository::new(pool.clone())
        .replace(&ThresholdCatalog::default_catalog())
        .await
        .expect("catalog");
    SqlContactDirectory::new(pool.clone())
        .save_contact(&Contact {
            user_id: "u-clerk".to_string(),
            display_name: "Dana Clerk".to_string(),
            email: Some("dana.clerk@tollgate.local".to_string()),
        })
        .await
        .expect("contact");

    let approvals = Arc::new(SqlApprovalRepository::new(pool.clone()));
    let ports = WorkflowPorts {
        approvals: approvals.clone(),
        queries: approvals,
        dispatch_queue: Arc::new(SqlDispatchQueueRepository::new(pool.clone())),
        entities: Arc::new(SqlEntityRepository::new(pool.clone())),
        catalog: Arc::new(SqlCatalogRepository::new(pool.clone())),
        notifier: NotificationFanout::new(
            Arc::new(SqlContactDirectory::new(pool.clone())),
            Arc::new(SqlEmailOutbox::new(pool.clone())),
            Arc::new(BroadcastPublisher::default()),
            NotificationSettings::default(),
        ),
        audit: Arc::new(InMemoryAuditSink::default()),
    };
    let workflow = Arc::new(ApprovalWorkflow::new(ports, WorkflowSettings::default()));

    Harness { _dir: dir, pool, workflow }
}

fn submission(entity_type: EntityType, id: &str, amount: i64) -> ProtectedSubmission {
    ProtectedSubmission {
        entity: ProtectedEntity::draft(entity_type, id, Decimal::new(amount, 0)),
        title: format!("{entity_type} {id}"),
        requested_by: "u-clerk".to_string(),
        description: None,
        metadata: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_final_approvals_commit_exactly_once() {
    let harness = harness().await;
    let SubmitOutcome::PendingApproval { request, .. } = harness
        .workflow
        .submit(submission(EntityType::Invoice, "INV-77", 80_000), None)
        .await
        .expect("submit")
    else {
        panic!("80,000 should require approval");
    };
    assert_eq!(request.total_levels, 1);

    let first = {
        let workflow = harness.workflow.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            workflow.approve(&id, &Actor::new("u-manager", "Manager"), None).await
        })
    };
    let second = {
        let workflow = harness.workflow.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            workflow.approve(&id, &Actor::new("u-other-manager", "Manager"), None).await
        })
    };
    let outcomes = [first.await.expect("join"), second.await.expect("join")];

    let committed = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(committed, 1, "{outcomes:?}");
    assert!(outcomes.iter().any(|outcome| matches!(
        outcome,
        Err(WorkflowError::AlreadyProcessed { status: RequestStatus::Approved, .. })
    )));

    let stored = harness.workflow.get(&request.id).await.expect("get");
    assert_eq!(stored.status, RequestStatus::Approved);
    assert_eq!(stored.state_version, 2);

    let entity = SqlEntityRepository::new(harness.pool.clone())
        .find_entity(EntityType::Invoice, "INV-77")
        .await
        .expect("find")
        .expect("entity");
    assert_eq!(entity.status, EntityStatus::Approved);

    for outcome in outcomes {
        if let Ok(decision) = outcome {
            decision.notification.wait().await;
        }
    }
    harness.pool.close().await;
}

#[tokio::test]
async fn rejection_updates_entity_and_queues_requester_email() {
    let harness = harness().await;
    let SubmitOutcome::PendingApproval { request, .. } = harness
        .workflow
        .submit(submission(EntityType::Journal, "JE-77", 1_500_000), None)
        .await
        .expect("submit")
    else {
        panic!("1,500,000 should require approval");
    };
    assert_eq!(request.total_levels, 3);

    harness
        .workflow
        .approve(&request.id, &Actor::new("u-manager", "Manager"), None)
        .await
        .expect("level 1");
    let decision = harness
        .workflow
        .reject(&request.id, &Actor::new("u-finance", "finance manager"), "missing backup")
        .await
        .expect("reject at level 2");
    decision.notification.wait().await;

    let entity = SqlEntityRepository::new(harness.pool.clone())
        .find_entity(EntityType::Journal, "JE-77")
        .await
        .expect("find")
        .expect("entity");
    assert_eq!(entity.status, EntityStatus::Rejected);
    assert_eq!(entity.rejection_reason.as_deref(), Some("missing backup"));
    assert!(!entity.is_posted);

    let emails = SqlEmailOutbox::new(harness.pool.clone())
        .list_for_request(&request.id)
        .await
        .expect("emails");
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].to, "dana.clerk@tollgate.local");

    let stats = harness.workflow.stats(chrono::Utc::now()).await.expect("stats");
    assert_eq!(stats.by_status.get("rejected"), Some(&1));
    harness.pool.close().await;
}
