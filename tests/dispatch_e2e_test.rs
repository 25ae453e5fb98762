use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use analysis_bots::Application;
use bots_core::config::AppConfig;
use bots_core::models::{NewTask, TaskResult, TaskStatus};
use bots_core::{DispatchError, TaskStore};
use bots_worker::{TaskOutcome, WorkerClient};

struct Harness {
    app: Arc<Application>,
    client: WorkerClient,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(config: AppConfig) -> Self {
        let app = Arc::new(Application::new(config).await.unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = {
            let app = app.clone();
            tokio::spawn(async move { app.serve(listener, shutdown_rx).await })
        };

        Self {
            app,
            client: WorkerClient::new(format!("http://{addr}")),
            shutdown_tx,
            handle,
        }
    }

    /// 创建用户并注册一个上线的 Worker，返回 (uid, worker_token)
    async fn online_worker(&self, admin: bool, shared: bool) -> (i64, String) {
        let user = self
            .app
            .store()
            .create_user("carol", "gh-carol", admin)
            .await
            .unwrap();
        let token = self
            .client
            .register_new_worker(&user.worker_token, "ci-runner", shared)
            .await
            .unwrap();
        self.client.register_worker(&token).await.unwrap();
        (user.id, token)
    }

    async fn stop(self) {
        self.shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("application should stop")
            .unwrap()
            .unwrap();
    }
}

fn memory_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = "memory".to_string();
    config
}

fn new_task(uid: i64, bot: &str) -> NewTask {
    NewTask {
        uid,
        project: "https://github.com/acme/widgets.git".to_string(),
        bot: bot.to_string(),
        gh_token: "gh-carol".to_string(),
        patch: false,
    }
}

async fn wait_for_status(store: &Arc<dyn TaskStore>, tid: i64, status: TaskStatus) {
    timeout(Duration::from_secs(3), async {
        while store.get_task(tid).await.unwrap().status != status {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {tid} never reached {status:?}"));
}

#[tokio::test]
async fn test_worker_runs_submitted_task() {
    let harness = Harness::start(memory_config()).await;
    let (uid, token) = harness.online_worker(false, false).await;

    let submitted = harness
        .app
        .controller()
        .submit_task(new_task(uid, "lint"))
        .await
        .unwrap();
    assert_eq!(submitted.status, TaskStatus::Pending);

    let assignment = harness.client.get_task(&token).await.unwrap();
    assert_eq!(assignment.tid, submitted.id);
    assert_eq!(assignment.bot, "lint");

    let outcome = harness
        .client
        .execute(&assignment, async {
            TaskResult {
                tid: assignment.tid,
                stdout: "no findings".to_string(),
                stderr: String::new(),
                exit_status: 0,
                patch: None,
            }
        })
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Completed { exit_status: 0 });

    let task = harness.app.store().get_task(submitted.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.output, "Stdout:\nno findings\nStderr:\n");
    assert!(task.start_time.is_some());
    assert!(task.end_time.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn test_long_poll_is_woken_by_submission() {
    let harness = Harness::start(memory_config()).await;
    let (uid, token) = harness.online_worker(false, false).await;

    let poll = {
        let client = harness.client.clone();
        tokio::spawn(async move { client.get_task(&token).await })
    };
    timeout(Duration::from_secs(2), async {
        while harness.app.registry().parked_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let submitted = harness
        .app
        .controller()
        .submit_task(new_task(uid, "fmt"))
        .await
        .unwrap();
    assert_eq!(submitted.status, TaskStatus::Scheduled);

    let assignment = timeout(Duration::from_secs(2), poll)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(assignment.tid, submitted.id);

    harness.stop().await;
}

#[tokio::test]
async fn test_controller_cancel_stops_running_task() {
    let harness = Harness::start(memory_config()).await;
    let (uid, token) = harness.online_worker(false, false).await;
    let store = harness.app.store();

    let submitted = harness
        .app
        .controller()
        .submit_task(new_task(uid, "slow"))
        .await
        .unwrap();
    let assignment = harness.client.get_task(&token).await.unwrap();

    let execution = {
        let client = harness.client.clone();
        tokio::spawn(async move {
            client
                .execute(&assignment, std::future::pending::<TaskResult>())
                .await
        })
    };
    wait_for_status(&store, submitted.id, TaskStatus::Running).await;
    // WaitForCancel 需要先到达服务端
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.app.controller().cancel_task(submitted.id).await.unwrap();

    let outcome = timeout(Duration::from_secs(2), execution)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Canceled);
    assert_eq!(
        store.get_task(submitted.id).await.unwrap().status,
        TaskStatus::Canceled
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_timed_over_task_is_canceled_by_sweeper() {
    let mut config = memory_config();
    config.dispatcher.max_task_time_seconds = 1;
    config.dispatcher.sweep_interval_seconds = 1;
    let harness = Harness::start(config).await;
    let (uid, token) = harness.online_worker(false, false).await;
    let store = harness.app.store();

    let submitted = harness
        .app
        .controller()
        .submit_task(new_task(uid, "hang"))
        .await
        .unwrap();
    let assignment = harness.client.get_task(&token).await.unwrap();
    let outcome = timeout(
        Duration::from_secs(5),
        harness
            .client
            .execute(&assignment, std::future::pending::<TaskResult>()),
    )
    .await
    .expect("sweeper should cancel the task")
    .unwrap();

    assert_eq!(outcome, TaskOutcome::Canceled);
    assert_eq!(
        store.get_task(submitted.id).await.unwrap().status,
        TaskStatus::Canceled
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_shared_worker_serves_other_users() {
    let harness = Harness::start(memory_config()).await;
    let (_, shared_token) = harness.online_worker(true, true).await;
    let other = harness
        .app
        .store()
        .create_user("dave", "gh-dave", false)
        .await
        .unwrap();

    let submitted = harness
        .app
        .controller()
        .submit_task(new_task(other.id, "lint"))
        .await
        .unwrap();
    let assignment = harness.client.get_task(&shared_token).await.unwrap();
    assert_eq!(assignment.tid, submitted.id);

    harness.stop().await;
}

#[tokio::test]
async fn test_rpc_errors_round_trip() {
    let harness = Harness::start(memory_config()).await;

    assert!(matches!(
        harness.client.register_new_worker("bogus", "w", false).await,
        Err(DispatchError::InvalidToken)
    ));
    let user = harness
        .app
        .store()
        .create_user("erin", "gh", false)
        .await
        .unwrap();
    assert!(matches!(
        harness
            .client
            .register_new_worker(&user.worker_token, "w", true)
            .await,
        Err(DispatchError::NotPrivileged)
    ));
    assert!(matches!(
        harness.client.wait_for_cancel(404).await,
        Err(DispatchError::NotValidTask { tid: 404 })
    ));

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_releases_long_polls_and_cancels_running_tasks() {
    let harness = Harness::start(memory_config()).await;
    let (uid, token) = harness.online_worker(false, false).await;
    let store = harness.app.store();

    let submitted = harness
        .app
        .controller()
        .submit_task(new_task(uid, "slow"))
        .await
        .unwrap();
    let assignment = harness.client.get_task(&token).await.unwrap();
    let execution = {
        let client = harness.client.clone();
        tokio::spawn(async move {
            client
                .execute(&assignment, std::future::pending::<TaskResult>())
                .await
        })
    };
    wait_for_status(&store, submitted.id, TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let idle_poll = {
        let client = harness.client.clone();
        let token = token.clone();
        tokio::spawn(async move { client.get_task(&token).await })
    };
    timeout(Duration::from_secs(2), async {
        while harness.app.registry().parked_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    harness.stop().await;

    assert!(matches!(
        timeout(Duration::from_secs(2), idle_poll).await.unwrap().unwrap(),
        Err(DispatchError::NoTask)
    ));
    assert_eq!(
        timeout(Duration::from_secs(2), execution)
            .await
            .unwrap()
            .unwrap()
            .unwrap(),
        TaskOutcome::Canceled
    );
    assert_eq!(
        store.get_task(submitted.id).await.unwrap().status,
        TaskStatus::Canceled
    );
}

#[tokio::test]
async fn test_boot_requeues_tasks_left_scheduled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite:{}", dir.path().join("bots.db").display());

    let tid = {
        let app = Application::new(config.clone()).await.unwrap();
        let store = app.store();
        let task = store.create_task(new_task(1, "lint")).await.unwrap();
        store
            .update_task_status(task.id, TaskStatus::Scheduled)
            .await
            .unwrap();
        store.close().await;
        task.id
    };

    let app = Application::new(config).await.unwrap();
    let store = app.store();
    assert_eq!(
        store.get_task(tid).await.unwrap().status,
        TaskStatus::Pending
    );
    store.close().await;
}
