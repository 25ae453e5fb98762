use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use mockall::Sequence;
use tokio::sync::broadcast;
use tokio::time::timeout;

use bots_core::config::DispatcherConfig;
use bots_core::models::{
    NewTemplate, ScheduleKind, ScheduledTemplate, Task, TaskStatus, TemplateStatus, Worker,
};
use bots_core::{DispatchError, MockTaskStore, TaskStore};
use bots_dispatcher::{Assignment, DispatchRegistry, TemplateScheduler};
use bots_infrastructure::InMemoryTaskStore;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap()
}

fn template(kind: ScheduleKind, next: DateTime<Utc>) -> NewTemplate {
    NewTemplate {
        uid: 7,
        name: format!("{}-audit", kind.name()),
        project: "https://github.com/acme/widgets.git".to_string(),
        bot: "audit".to_string(),
        gh_token: "gh".to_string(),
        patch: false,
        kind,
        next: Some(next),
    }
}

fn setup() -> (Arc<InMemoryTaskStore>, DispatchRegistry, TemplateScheduler) {
    let store = Arc::new(InMemoryTaskStore::new());
    let registry = DispatchRegistry::new(store.clone());
    let scheduler = TemplateScheduler::new(store.clone(), registry.clone(), &DispatcherConfig::default());
    (store, registry, scheduler)
}

#[tokio::test]
async fn test_hourly_template_fires_and_advances() {
    let (store, _registry, scheduler) = setup();
    let created = store
        .create_scheduled_task(template(ScheduleKind::Hourly { hours: 2 }, t0()))
        .await
        .unwrap();

    let report = scheduler.fire(t0()).await;
    assert_eq!(report.materialized.len(), 1);
    assert_eq!(report.assigned, 0);
    assert!(!report.has_failures());

    let child = store.get_task(report.materialized[0]).await.unwrap();
    assert_eq!(child.status, TaskStatus::Pending);
    assert_eq!(child.template_id, Some(created.id));

    let updated = store.get_scheduled_task(created.id).await.unwrap();
    assert_eq!(updated.next, t0() + Duration::hours(2));
    assert_eq!(
        store.get_minimal_next_time().await.unwrap(),
        Some(t0() + Duration::hours(2))
    );
}

#[tokio::test]
async fn test_materialized_task_goes_to_parked_worker() {
    let (store, registry, scheduler) = setup();
    store
        .create_scheduled_task(template(ScheduleKind::Daily, t0()))
        .await
        .unwrap();

    let ticket = registry
        .park(Worker {
            id: 1,
            uid: 7,
            token: "w".to_string(),
            name: "w".to_string(),
            shared: false,
            active: true,
            last_contact: Utc::now(),
        })
        .await;

    let report = scheduler.fire(t0()).await;
    assert_eq!(report.assigned, 1);
    match ticket.wait().await {
        Assignment::Task(task) => assert_eq!(task.id, report.materialized[0]),
        Assignment::Released => panic!("parked worker should receive the new task"),
    }
    assert_eq!(
        store.get_task(report.materialized[0]).await.unwrap().status,
        TaskStatus::Scheduled
    );
}

#[tokio::test]
async fn test_one_shot_templates_complete() {
    let (store, _registry, scheduler) = setup();
    let one_time = store
        .create_scheduled_task(template(ScheduleKind::OneTime, t0()))
        .await
        .unwrap();
    let instant = store
        .create_scheduled_task(template(ScheduleKind::Instant, t0() - Duration::minutes(1)))
        .await
        .unwrap();

    let report = scheduler.fire(t0()).await;
    assert_eq!(report.materialized.len(), 2);
    assert_eq!(report.completed_templates, vec![instant.id, one_time.id]);

    for stid in [one_time.id, instant.id] {
        assert_eq!(
            store.get_scheduled_task(stid).await.unwrap().status,
            TemplateStatus::Complete
        );
    }
    assert_eq!(store.get_minimal_next_time().await.unwrap(), None);

    // 已完成的模板不会再次触发
    assert!(scheduler.fire(t0() + Duration::days(1)).await.materialized.is_empty());
}

#[tokio::test]
async fn test_missed_instants_are_skipped_after_downtime() {
    let (store, _registry, scheduler) = setup();
    let created = store
        .create_scheduled_task(template(ScheduleKind::Hourly { hours: 1 }, t0()))
        .await
        .unwrap();

    let now = t0() + Duration::minutes(330);
    let report = scheduler.fire(now).await;
    assert_eq!(report.materialized.len(), 1);

    let next = store.get_scheduled_task(created.id).await.unwrap().next;
    assert_eq!(next, t0() + Duration::hours(6));
    assert!(next > now);
}

#[tokio::test]
async fn test_batch_order_is_next_then_id() {
    let (store, _registry, scheduler) = setup();
    let later = store
        .create_scheduled_task(template(ScheduleKind::Daily, t0()))
        .await
        .unwrap();
    let earlier = store
        .create_scheduled_task(template(ScheduleKind::Weekly, t0() - Duration::hours(1)))
        .await
        .unwrap();

    let report = scheduler.fire(t0()).await;
    let owners: Vec<Option<i64>> = {
        let mut owners = Vec::new();
        for tid in &report.materialized {
            owners.push(store.get_task(*tid).await.unwrap().template_id);
        }
        owners
    };
    assert_eq!(owners, vec![Some(earlier.id), Some(later.id)]);
}

fn mock_template(id: i64, next: DateTime<Utc>) -> ScheduledTemplate {
    ScheduledTemplate {
        id,
        uid: 7,
        name: format!("template-{id}"),
        project: "p".to_string(),
        bot: "b".to_string(),
        gh_token: "gh".to_string(),
        patch: false,
        kind: ScheduleKind::Daily,
        next,
        status: TemplateStatus::Active,
        created_at: next,
    }
}

fn mock_child(tid: i64, stid: i64) -> Task {
    Task {
        id: tid,
        uid: 7,
        template_id: Some(stid),
        template_uid: Some(7),
        project: "p".to_string(),
        bot: "b".to_string(),
        gh_token: "gh".to_string(),
        patch: false,
        status: TaskStatus::Pending,
        exit_status: None,
        output: String::new(),
        patch_content: None,
        created_at: Utc::now(),
        start_time: None,
        end_time: None,
    }
}

#[tokio::test]
async fn test_failed_template_does_not_abort_batch() {
    let mut store = MockTaskStore::new();
    store
        .expect_get_overdue_scheduled_tasks()
        .returning(|_| Ok(vec![mock_template(1, t0()), mock_template(2, t0())]));
    store
        .expect_create_new_child_task()
        .withf(|stid| *stid == 1)
        .returning(|_| Err(DispatchError::Internal("disk full".to_string())));
    store
        .expect_create_new_child_task()
        .withf(|stid| *stid == 2)
        .returning(|stid| Ok(mock_child(40, stid)));
    // 失败的模板不前进
    store
        .expect_update_next_schedule_time()
        .withf(|stid, next| *stid == 2 && *next == t0() + Duration::days(1))
        .times(1)
        .returning(|_, _| Ok(()));
    store
        .expect_get_minimal_next_time()
        .returning(|| Ok(Some(t0())));

    let store = Arc::new(store);
    let registry = DispatchRegistry::new(store.clone());
    let scheduler = TemplateScheduler::new(store, registry, &DispatcherConfig::default());

    let report = scheduler.fire(t0()).await;
    assert_eq!(report.materialized, vec![40]);
    assert_eq!(report.failed_templates, vec![1]);
    assert!(report.has_failures());

    // 有失败时定时器至少退避 failure_backoff_seconds
    let now = t0() + Duration::seconds(1);
    assert_eq!(
        scheduler.next_deadline(now, true).await,
        now + Duration::seconds(5)
    );
    assert_eq!(scheduler.next_deadline(now, false).await, t0());
}

#[tokio::test]
async fn test_failed_advance_is_retried_without_new_child() {
    let mut store = MockTaskStore::new();
    store
        .expect_get_overdue_scheduled_tasks()
        .times(2)
        .returning(|_| Ok(vec![mock_template(1, t0())]));
    // 只派生一次
    store
        .expect_create_new_child_task()
        .times(1)
        .returning(|stid| Ok(mock_child(40, stid)));
    let mut seq = Sequence::new();
    store
        .expect_update_next_schedule_time()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(DispatchError::Internal("disk full".to_string())));
    store
        .expect_update_next_schedule_time()
        .withf(|stid, next| *stid == 1 && *next == t0() + Duration::days(1))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));

    let store = Arc::new(store);
    let registry = DispatchRegistry::new(store.clone());
    let scheduler = TemplateScheduler::new(store, registry, &DispatcherConfig::default());

    let first = scheduler.fire(t0()).await;
    assert_eq!(first.materialized, vec![40]);
    assert_eq!(first.failed_templates, vec![1]);

    let retry = scheduler.fire(t0() + Duration::seconds(5)).await;
    assert!(retry.materialized.is_empty());
    assert!(!retry.has_failures());
}

#[tokio::test]
async fn test_next_deadline_without_templates_uses_idle_timer() {
    let (store, _registry, scheduler) = setup();
    let now = t0();
    assert_eq!(
        scheduler.next_deadline(now, false).await,
        now + Duration::hours(1)
    );

    store
        .create_scheduled_task(template(ScheduleKind::Daily, now + Duration::minutes(10)))
        .await
        .unwrap();
    assert_eq!(
        scheduler.next_deadline(now, false).await,
        now + Duration::minutes(10)
    );
}

#[tokio::test]
async fn test_next_deadline_is_capped_by_idle_timer() {
    let (store, _registry, scheduler) = setup();
    let now = t0();
    store
        .create_scheduled_task(template(ScheduleKind::Weekly, now + Duration::days(3)))
        .await
        .unwrap();
    assert_eq!(
        scheduler.next_deadline(now, false).await,
        now + Duration::hours(1)
    );
}

#[tokio::test]
async fn test_run_loop_reacts_to_new_templates_and_shutdown() {
    let (store, _registry, scheduler) = setup();
    let scheduler = Arc::new(scheduler);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(store.task_count().await, 0);

    store
        .create_scheduled_task(template(ScheduleKind::Instant, Utc::now()))
        .await
        .unwrap();
    scheduler.update_period_timer();

    timeout(StdDuration::from_secs(2), async {
        while store.task_count().await == 0 {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .expect("scheduler should materialize the instant template");

    shutdown_tx.send(()).unwrap();
    timeout(StdDuration::from_secs(1), handle)
        .await
        .expect("scheduler should stop on shutdown")
        .unwrap();
}
