use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use bots_core::models::{
    NewTask, NewTemplate, ScheduleKind, ScheduledTemplate, Task, TaskStatus, TemplateStatus, User,
    Worker,
};
use bots_core::{DispatchError, DispatchResult, TaskStore};

use crate::token::generate_token;

const TASK_COLUMNS: &str = "t.id, t.uid, t.template_id, s.uid AS template_uid, t.project, t.bot, \
     t.gh_token, t.patch, t.status, t.exit_status, t.output, t.patch_content, t.created_at, \
     t.start_time, t.end_time";

const TEMPLATE_COLUMNS: &str =
    "id, uid, name, project, bot, gh_token, patch, kind, kind_param, next, status, created_at";

/// 基于 sqlx 的 SQLite 任务存储
///
/// 时间统一以 UTC 毫秒时间戳保存，便于在 SQL 中直接比较。
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 连接数据库并执行迁移。内存数据库只允许一个长期连接，否则每个连接各有一份数据。
    pub async fn connect(database_url: &str, max_connections: u32) -> DispatchResult<Self> {
        debug!("连接SQLite数据库: {}", database_url);

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().min_connections(1);
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(max_connections)
        };

        let pool = pool_options.connect_with(connect_options).await?;
        Self::run_migrations(&pool).await?;

        info!("SQLite任务存储已就绪");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> DispatchResult<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn run_migrations(pool: &SqlitePool) -> DispatchResult<()> {
        debug!("执行SQLite数据库迁移");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                worker_token TEXT NOT NULL UNIQUE,
                gh_token TEXT NOT NULL DEFAULT '',
                admin INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid INTEGER NOT NULL REFERENCES users(id),
                token TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                shared INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 0,
                last_contact INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid INTEGER NOT NULL,
                name TEXT NOT NULL,
                project TEXT NOT NULL,
                bot TEXT NOT NULL,
                gh_token TEXT NOT NULL,
                patch INTEGER NOT NULL DEFAULT 0,
                kind TEXT NOT NULL,
                kind_param TEXT,
                next INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid INTEGER NOT NULL,
                template_id INTEGER REFERENCES scheduled_tasks(id),
                project TEXT NOT NULL,
                bot TEXT NOT NULL,
                gh_token TEXT NOT NULL,
                patch INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'PENDING',
                exit_status INTEGER,
                output TEXT NOT NULL DEFAULT '',
                patch_content TEXT,
                created_at INTEGER NOT NULL,
                start_time INTEGER,
                end_time INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_template_id ON tasks(template_id)",
            "CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_next ON scheduled_tasks(status, next)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        debug!("SQLite数据库迁移完成");
        Ok(())
    }

    async fn token_in_use(&self, token: &str) -> DispatchResult<bool> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM users WHERE worker_token = ?1) + \
             (SELECT COUNT(*) FROM workers WHERE token = ?1) AS used",
        )
        .bind(token)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("used")? > 0)
    }

    async fn unique_token(&self) -> DispatchResult<String> {
        loop {
            let token = generate_token();
            if !self.token_in_use(&token).await? {
                return Ok(token);
            }
        }
    }

    async fn oldest_pending(&self, owner: Option<i64>) -> DispatchResult<Option<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t LEFT JOIN scheduled_tasks s ON s.id = t.template_id \
             WHERE t.status = 'PENDING' AND (?1 IS NULL OR COALESCE(s.uid, t.uid) = ?1) \
             ORDER BY t.id LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn set_worker_state(&self, worker_token: &str, active: bool) -> DispatchResult<()> {
        let result = sqlx::query("UPDATE workers SET active = ?1, last_contact = ?2 WHERE token = ?3")
            .bind(active)
            .bind(to_millis(Utc::now()))
            .bind(worker_token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::InvalidToken);
        }
        Ok(())
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> DispatchResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| DispatchError::Serialization(format!("无效的时间戳: {millis}")))
}

fn optional_time(millis: Option<i64>) -> DispatchResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

fn row_to_task(row: &SqliteRow) -> DispatchResult<Task> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        template_id: row.try_get("template_id")?,
        template_uid: row.try_get("template_uid")?,
        project: row.try_get("project")?,
        bot: row.try_get("bot")?,
        gh_token: row.try_get("gh_token")?,
        patch: row.try_get("patch")?,
        status: status.parse()?,
        exit_status: row.try_get("exit_status")?,
        output: row.try_get("output")?,
        patch_content: row.try_get("patch_content")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        start_time: optional_time(row.try_get("start_time")?)?,
        end_time: optional_time(row.try_get("end_time")?)?,
    })
}

fn row_to_template(row: &SqliteRow) -> DispatchResult<ScheduledTemplate> {
    let kind: String = row.try_get("kind")?;
    let kind_param: Option<String> = row.try_get("kind_param")?;
    let status: String = row.try_get("status")?;
    Ok(ScheduledTemplate {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        name: row.try_get("name")?,
        project: row.try_get("project")?,
        bot: row.try_get("bot")?,
        gh_token: row.try_get("gh_token")?,
        patch: row.try_get("patch")?,
        kind: ScheduleKind::from_parts(&kind, kind_param.as_deref())?,
        next: from_millis(row.try_get("next")?)?,
        status: status.parse()?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn row_to_worker(row: &SqliteRow) -> DispatchResult<Worker> {
    Ok(Worker {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        token: row.try_get("token")?,
        name: row.try_get("name")?,
        shared: row.try_get("shared")?,
        active: row.try_get("active")?,
        last_contact: from_millis(row.try_get("last_contact")?)?,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self))]
    async fn get_pending_task(&self, uid: i64, shared: bool) -> DispatchResult<Option<Task>> {
        let own = self.oldest_pending(Some(uid)).await?;
        if own.is_some() || !shared {
            return Ok(own);
        }
        self.oldest_pending(None).await
    }

    #[instrument(skip(self, user_token))]
    async fn create_worker(
        &self,
        user_token: &str,
        name: &str,
        shared: bool,
    ) -> DispatchResult<String> {
        let user = sqlx::query("SELECT id, admin FROM users WHERE worker_token = ?1")
            .bind(user_token)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DispatchError::InvalidToken)?;
        let uid: i64 = user.try_get("id")?;
        let admin: bool = user.try_get("admin")?;
        if shared && !admin {
            return Err(DispatchError::NotPrivileged);
        }

        let token = self.unique_token().await?;
        sqlx::query(
            "INSERT INTO workers (uid, token, name, shared, active, last_contact) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        )
        .bind(uid)
        .bind(&token)
        .bind(name)
        .bind(shared)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!("为用户 {} 创建Worker '{}'", uid, name);
        Ok(token)
    }

    async fn set_worker_active(&self, worker_token: &str) -> DispatchResult<()> {
        self.set_worker_state(worker_token, true).await
    }

    async fn set_worker_inactive(&self, worker_token: &str) -> DispatchResult<()> {
        self.set_worker_state(worker_token, false).await
    }

    async fn get_worker(&self, worker_token: &str) -> DispatchResult<Worker> {
        let row = sqlx::query(
            "SELECT id, uid, token, name, shared, active, last_contact FROM workers WHERE token = ?1",
        )
        .bind(worker_token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DispatchError::InvalidToken)?;
        row_to_worker(&row)
    }

    #[instrument(skip(self))]
    async fn update_task_status(&self, tid: i64, status: TaskStatus) -> DispatchResult<()> {
        let now = to_millis(Utc::now());
        let query = match status {
            TaskStatus::Running => {
                sqlx::query("UPDATE tasks SET status = ?1, start_time = ?2 WHERE id = ?3")
                    .bind(status.as_str())
                    .bind(now)
                    .bind(tid)
            }
            s if s.is_terminal() => {
                sqlx::query("UPDATE tasks SET status = ?1, end_time = ?2 WHERE id = ?3")
                    .bind(status.as_str())
                    .bind(now)
                    .bind(tid)
            }
            _ => sqlx::query("UPDATE tasks SET status = ?1 WHERE id = ?2")
                .bind(status.as_str())
                .bind(tid),
        };
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::TaskNotFound { id: tid });
        }
        Ok(())
    }

    #[instrument(skip(self, output, patch))]
    async fn update_task_result(
        &self,
        tid: i64,
        output: &str,
        exit_status: i32,
        patch: Option<String>,
    ) -> DispatchResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, exit_status = ?2, output = ?3, patch_content = ?4, \
             end_time = ?5 WHERE id = ?6",
        )
        .bind(TaskStatus::from_exit_status(exit_status).as_str())
        .bind(exit_status)
        .bind(output)
        .bind(patch)
        .bind(to_millis(Utc::now()))
        .bind(tid)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::TaskNotFound { id: tid });
        }
        Ok(())
    }

    async fn get_timed_over_tasks(&self, max_seconds: i64) -> DispatchResult<Vec<i64>> {
        let cutoff = to_millis(Utc::now() - Duration::seconds(max_seconds));
        let rows = sqlx::query(
            "SELECT id FROM tasks WHERE status = 'RUNNING' AND start_time IS NOT NULL \
             AND start_time <= ?1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(DispatchError::from))
            .collect()
    }

    async fn get_overdue_scheduled_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<ScheduledTemplate>> {
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM scheduled_tasks \
             WHERE status = 'ACTIVE' AND next <= ?1 ORDER BY next, id"
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_template).collect()
    }

    async fn get_minimal_next_time(&self) -> DispatchResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(next) AS next FROM scheduled_tasks WHERE status = 'ACTIVE'",
        )
        .fetch_one(&self.pool)
        .await?;
        optional_time(row.try_get("next")?)
    }

    async fn update_next_schedule_time(
        &self,
        stid: i64,
        next: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET next = ?1 WHERE id = ?2")
            .bind(to_millis(next))
            .bind(stid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::TemplateNotFound { id: stid });
        }
        Ok(())
    }

    async fn update_scheduled_task_status(
        &self,
        stid: i64,
        status: TemplateStatus,
    ) -> DispatchResult<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(stid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::TemplateNotFound { id: stid });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_new_child_task(&self, stid: i64) -> DispatchResult<Task> {
        let mut tx = self.pool.begin().await?;

        let template = sqlx::query(
            "SELECT uid, project, bot, gh_token, patch FROM scheduled_tasks WHERE id = ?1",
        )
        .bind(stid)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DispatchError::TemplateNotFound { id: stid })?;

        let row = sqlx::query(
            "INSERT INTO tasks (uid, template_id, project, bot, gh_token, patch, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', ?7) RETURNING id",
        )
        .bind(template.try_get::<i64, _>("uid")?)
        .bind(stid)
        .bind(template.try_get::<String, _>("project")?)
        .bind(template.try_get::<String, _>("bot")?)
        .bind(template.try_get::<String, _>("gh_token")?)
        .bind(template.try_get::<bool, _>("patch")?)
        .bind(to_millis(Utc::now()))
        .fetch_one(&mut *tx)
        .await?;
        let tid: i64 = row.try_get("id")?;

        tx.commit().await?;
        self.get_task(tid).await
    }

    async fn get_unfinished_children(&self, stid: i64) -> DispatchResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM tasks WHERE template_id = ?1 \
             AND status IN ('PENDING', 'SCHEDULED', 'RUNNING') ORDER BY id",
        )
        .bind(stid)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(DispatchError::from))
            .collect()
    }

    #[instrument(skip(self, task), fields(uid = task.uid, bot = %task.bot))]
    async fn create_task(&self, task: NewTask) -> DispatchResult<Task> {
        let row = sqlx::query(
            "INSERT INTO tasks (uid, project, bot, gh_token, patch, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6) RETURNING id",
        )
        .bind(task.uid)
        .bind(&task.project)
        .bind(&task.bot)
        .bind(&task.gh_token)
        .bind(task.patch)
        .bind(to_millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        self.get_task(row.try_get("id")?).await
    }

    async fn get_task(&self, tid: i64) -> DispatchResult<Task> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t LEFT JOIN scheduled_tasks s ON s.id = t.template_id \
             WHERE t.id = ?1"
        );
        let row = sqlx::query(&sql)
            .bind(tid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DispatchError::TaskNotFound { id: tid })?;
        row_to_task(&row)
    }

    #[instrument(skip(self, template), fields(name = %template.name, kind = template.kind.name()))]
    async fn create_scheduled_task(
        &self,
        template: NewTemplate,
    ) -> DispatchResult<ScheduledTemplate> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO scheduled_tasks \
             (uid, name, project, bot, gh_token, patch, kind, kind_param, next, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'ACTIVE', ?10) RETURNING id",
        )
        .bind(template.uid)
        .bind(&template.name)
        .bind(&template.project)
        .bind(&template.bot)
        .bind(&template.gh_token)
        .bind(template.patch)
        .bind(template.kind.name())
        .bind(template.kind.parameter())
        .bind(to_millis(template.next.unwrap_or(now)))
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;
        self.get_scheduled_task(row.try_get("id")?).await
    }

    async fn get_scheduled_task(&self, stid: i64) -> DispatchResult<ScheduledTemplate> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM scheduled_tasks WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(stid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DispatchError::TemplateNotFound { id: stid })?;
        row_to_template(&row)
    }

    async fn create_user(&self, name: &str, gh_token: &str, admin: bool) -> DispatchResult<User> {
        let worker_token = self.unique_token().await?;
        let row = sqlx::query(
            "INSERT INTO users (name, worker_token, gh_token, admin) VALUES (?1, ?2, ?3, ?4) \
             RETURNING id",
        )
        .bind(name)
        .bind(&worker_token)
        .bind(gh_token)
        .bind(admin)
        .fetch_one(&self.pool)
        .await?;
        Ok(User {
            id: row.try_get("id")?,
            name: name.to_string(),
            worker_token,
            gh_token: gh_token.to_string(),
            admin,
        })
    }

    async fn reset_scheduled_tasks(&self) -> DispatchResult<u64> {
        let result = sqlx::query("UPDATE tasks SET status = 'PENDING' WHERE status = 'SCHEDULED'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("SQLite连接池已关闭");
    }
}
