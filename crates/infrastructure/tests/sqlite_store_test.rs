use chrono::{Duration, Utc};

use bots_core::models::{NewTask, NewTemplate, ScheduleKind, TaskStatus, TemplateStatus};
use bots_core::{DispatchError, TaskStore};
use bots_infrastructure::SqliteTaskStore;

fn new_task(uid: i64) -> NewTask {
    NewTask {
        uid,
        project: "https://github.com/acme/widgets.git".to_string(),
        bot: "lint".to_string(),
        gh_token: "gh-secret".to_string(),
        patch: false,
    }
}

fn new_template(uid: i64, kind: ScheduleKind, minutes_ago: i64) -> NewTemplate {
    NewTemplate {
        uid,
        name: format!("template-{}", kind.name()),
        project: "https://github.com/acme/widgets.git".to_string(),
        bot: "audit".to_string(),
        gh_token: "gh-secret".to_string(),
        patch: true,
        kind,
        next: Some(Utc::now() - Duration::minutes(minutes_ago)),
    }
}

#[tokio::test]
async fn test_file_database_persists_between_connections() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("bots.db").display());

    let tid = {
        let store = SqliteTaskStore::connect(&url, 2).await.unwrap();
        let task = store.create_task(new_task(1)).await.unwrap();
        store.update_task_status(task.id, TaskStatus::Scheduled).await.unwrap();
        store.close().await;
        task.id
    };

    let store = SqliteTaskStore::connect(&url, 2).await.unwrap();
    let task = store.get_task(tid).await.unwrap();
    assert_eq!(task.status, TaskStatus::Scheduled);

    // 重启后遗留的 Scheduled 任务回到 Pending
    assert_eq!(store.reset_scheduled_tasks().await.unwrap(), 1);
    assert_eq!(store.get_task(tid).await.unwrap().status, TaskStatus::Pending);
    store.close().await;
}

#[tokio::test]
async fn test_pending_task_order_and_ownership() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let first_other = store.create_task(new_task(2)).await.unwrap();
    let own = store.create_task(new_task(1)).await.unwrap();
    store.create_task(new_task(1)).await.unwrap();

    let found = store.get_pending_task(1, false).await.unwrap().unwrap();
    assert_eq!(found.id, own.id);
    assert_eq!(found.gh_token, "gh-secret");

    assert!(store.get_pending_task(9, false).await.unwrap().is_none());
    let found = store.get_pending_task(9, true).await.unwrap().unwrap();
    assert_eq!(found.id, first_other.id);

    // 只读查询，不修改状态
    let again = store.get_pending_task(9, true).await.unwrap().unwrap();
    assert_eq!(again.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_worker_registration() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let user = store.create_user("alice", "gh", false).await.unwrap();
    let admin = store.create_user("root", "gh", true).await.unwrap();
    assert_eq!(user.worker_token.len(), 32);
    assert_ne!(user.worker_token, admin.worker_token);

    assert!(matches!(
        store.create_worker("unknown", "w1", false).await,
        Err(DispatchError::InvalidToken)
    ));
    assert!(matches!(
        store.create_worker(&user.worker_token, "w1", true).await,
        Err(DispatchError::NotPrivileged)
    ));

    let token = store
        .create_worker(&user.worker_token, "w1", false)
        .await
        .unwrap();
    let worker = store.get_worker(&token).await.unwrap();
    assert_eq!(worker.uid, user.id);
    assert_eq!(worker.name, "w1");
    assert!(!worker.shared);
    assert!(!worker.active);

    store.set_worker_active(&token).await.unwrap();
    store.set_worker_active(&token).await.unwrap();
    assert!(store.get_worker(&token).await.unwrap().active);
    store.set_worker_inactive(&token).await.unwrap();
    assert!(!store.get_worker(&token).await.unwrap().active);

    assert!(matches!(
        store.set_worker_active("missing").await,
        Err(DispatchError::InvalidToken)
    ));
}

#[tokio::test]
async fn test_status_transitions_and_result() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let task = store.create_task(new_task(1)).await.unwrap();

    store.update_task_status(task.id, TaskStatus::Running).await.unwrap();
    let running = store.get_task(task.id).await.unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert!(running.start_time.is_some());

    let output = "Stdout:\nok\nStderr:\n";
    store
        .update_task_result(task.id, output, 0, Some("--- a\n+++ b\n".to_string()))
        .await
        .unwrap();
    let done = store.get_task(task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(done.output, output);
    assert_eq!(done.exit_status, Some(0));
    assert!(done.patch_content.is_some());
    assert!(done.end_time.is_some());

    assert!(matches!(
        store.update_task_status(404, TaskStatus::Canceled).await,
        Err(DispatchError::TaskNotFound { id: 404 })
    ));
}

#[tokio::test]
async fn test_timed_over_tasks() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let running = store.create_task(new_task(1)).await.unwrap();
    let pending = store.create_task(new_task(1)).await.unwrap();
    store.update_task_status(running.id, TaskStatus::Running).await.unwrap();

    assert!(store.get_timed_over_tasks(60).await.unwrap().is_empty());
    assert_eq!(store.get_timed_over_tasks(0).await.unwrap(), vec![running.id]);
    assert!(!store
        .get_timed_over_tasks(0)
        .await
        .unwrap()
        .contains(&pending.id));
}

#[tokio::test]
async fn test_templates_roundtrip_through_store() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let cron = store
        .create_scheduled_task(new_template(
            3,
            ScheduleKind::Cron {
                expression: "0 0 4 * * * *".to_string(),
            },
            1,
        ))
        .await
        .unwrap();
    let hourly = store
        .create_scheduled_task(new_template(3, ScheduleKind::Hourly { hours: 6 }, 10))
        .await
        .unwrap();
    store
        .create_scheduled_task(new_template(3, ScheduleKind::Weekly, -60))
        .await
        .unwrap();

    let loaded = store.get_scheduled_task(hourly.id).await.unwrap();
    assert_eq!(loaded.kind, ScheduleKind::Hourly { hours: 6 });
    assert_eq!(loaded.status, TemplateStatus::Active);

    let overdue = store.get_overdue_scheduled_tasks(Utc::now()).await.unwrap();
    let ids: Vec<i64> = overdue.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![hourly.id, cron.id]);
    assert_eq!(
        store.get_minimal_next_time().await.unwrap(),
        Some(hourly.next)
    );

    let next = hourly.next + Duration::hours(6);
    store.update_next_schedule_time(hourly.id, next).await.unwrap();
    store
        .update_scheduled_task_status(cron.id, TemplateStatus::Complete)
        .await
        .unwrap();
    let overdue = store.get_overdue_scheduled_tasks(Utc::now()).await.unwrap();
    assert!(overdue.is_empty());

    assert!(matches!(
        store.get_scheduled_task(77).await,
        Err(DispatchError::TemplateNotFound { id: 77 })
    ));
}

#[tokio::test]
async fn test_child_tasks() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let template = store
        .create_scheduled_task(new_template(5, ScheduleKind::Daily, 1))
        .await
        .unwrap();

    let child = store.create_new_child_task(template.id).await.unwrap();
    assert_eq!(child.template_id, Some(template.id));
    assert_eq!(child.template_uid, Some(5));
    assert_eq!(child.dispatch_owner(), 5);
    assert!(child.patch);
    assert_eq!(child.status, TaskStatus::Pending);

    // 尚未分配的子任务同样算作未结束
    assert_eq!(
        store.get_unfinished_children(template.id).await.unwrap(),
        vec![child.id]
    );
    store.update_task_status(child.id, TaskStatus::Running).await.unwrap();
    assert_eq!(
        store.get_unfinished_children(template.id).await.unwrap(),
        vec![child.id]
    );
    store.update_task_status(child.id, TaskStatus::Canceled).await.unwrap();
    assert!(store.get_unfinished_children(template.id).await.unwrap().is_empty());

    assert!(matches!(
        store.create_new_child_task(999).await,
        Err(DispatchError::TemplateNotFound { id: 999 })
    ));
}
