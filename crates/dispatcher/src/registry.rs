//! 调度注册表
//!
//! 内存中维护两类信息：
//! - 等待任务的 Worker 槽位：按所有者分组的队列，以及共享 Worker 队列，均为 FIFO；
//! - 正在运行的任务：`tid` 到取消通道（容量为 1）的映射。
//!
//! 三者由同一把读写锁保护。等待通道之前必须先释放锁，否则下一次 `assign` 会死锁。
//! 槽位通道使用 `oneshot`：等待方被取消时接收端随之关闭，`assign` 可以据此跳过失效槽位，
//! 发送本身永不阻塞。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use bots_core::models::{Task, TaskStatus, Worker};
use bots_core::{DispatchError, DispatchResult, TaskStore};

use crate::metrics::{
    ASSIGNMENTS_TOTAL, CANCELS_TOTAL, DEAD_SLOTS_TOTAL, PARKED_WORKERS, RECLAIMED_TOTAL,
    RESULTS_TOTAL, RUNNING_TASKS,
};

/// 槽位收到的内容
#[derive(Debug)]
pub enum Assignment {
    Task(Task),
    /// Worker 注销或调度核心关闭，等待方应返回 `NoTask`
    Released,
}

struct ParkedSlot {
    worker: Worker,
    sender: oneshot::Sender<Assignment>,
}

struct RunningEntry {
    cancel_tx: mpsc::Sender<bool>,
    cancel_rx: Mutex<mpsc::Receiver<bool>>,
    delivered: AtomicBool,
    /// 交给 Worker 的时刻
    handed_out: Instant,
    /// 已收到 `PublishStarted`
    started: AtomicBool,
}

impl RunningEntry {
    fn new() -> Arc<Self> {
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        Arc::new(Self {
            cancel_tx,
            cancel_rx: Mutex::new(cancel_rx),
            delivered: AtomicBool::new(false),
            handed_out: Instant::now(),
            started: AtomicBool::new(false),
        })
    }

    fn is_stale(&self, max_wait: Duration) -> bool {
        !self.started.load(Ordering::SeqCst) && self.handed_out.elapsed() >= max_wait
    }
}

#[derive(Default)]
struct RegistryState {
    available_workers: HashMap<i64, VecDeque<ParkedSlot>>,
    shared_workers: VecDeque<ParkedSlot>,
    running: HashMap<i64, Arc<RunningEntry>>,
    /// `drain` 之后不再接受新的等待
    draining: bool,
}

impl RegistryState {
    fn park(&mut self, worker: Worker) -> oneshot::Receiver<Assignment> {
        let (sender, receiver) = oneshot::channel();
        if self.draining {
            let _ = sender.send(Assignment::Released);
            return receiver;
        }
        let queue = if worker.shared {
            &mut self.shared_workers
        } else {
            self.available_workers.entry(worker.uid).or_default()
        };
        queue.push_back(ParkedSlot { worker, sender });
        receiver
    }

    /// 先取所有者队列，再取共享队列。空的所有者队列视为不存在并被移除。
    fn pop_slot(&mut self, owner: i64) -> Option<ParkedSlot> {
        if let Some(queue) = self.available_workers.get_mut(&owner) {
            let slot = queue.pop_front();
            if queue.is_empty() {
                self.available_workers.remove(&owner);
            }
            if slot.is_some() {
                return slot;
            }
        }
        self.shared_workers.pop_front()
    }

    fn begin(&mut self, tid: i64) {
        self.running.insert(tid, RunningEntry::new());
    }

    fn parked_count(&self) -> usize {
        self.available_workers.values().map(VecDeque::len).sum::<usize>()
            + self.shared_workers.len()
    }

    fn record_gauges(&self) {
        gauge!(PARKED_WORKERS).set(self.parked_count() as f64);
        gauge!(RUNNING_TASKS).set(self.running.len() as f64);
    }
}

struct RegistryInner {
    store: Arc<dyn TaskStore>,
    guard: RwLock<RegistryState>,
}

/// 调度注册表，克隆开销很小，所有克隆共享同一份状态
#[derive(Clone)]
pub struct DispatchRegistry {
    inner: Arc<RegistryInner>,
}

/// 一次等待中的 `GetTask`
///
/// 在收到任务之前被丢弃时（例如 RPC 连接断开），若任务已经送达通道，会把它退回 `Pending`
/// 并重新分配，不会让任务停在 `Scheduled`。
pub struct SlotTicket {
    receiver: Option<oneshot::Receiver<Assignment>>,
    registry: DispatchRegistry,
}

impl SlotTicket {
    pub async fn wait(mut self) -> Assignment {
        let Some(receiver) = self.receiver.as_mut() else {
            return Assignment::Released;
        };
        let received = receiver.await;
        self.receiver = None;
        received.unwrap_or(Assignment::Released)
    }
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.close();
        if let Ok(Assignment::Task(task)) = receiver.try_recv() {
            let registry = self.registry.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { registry.requeue(task).await });
                }
                Err(_) => error!("任务 {} 在无运行时环境中丢失，重启后会重新分配", task.id),
            }
        }
    }
}

impl DispatchRegistry {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                guard: RwLock::new(RegistryState::default()),
            }),
        }
    }

    fn ticket(&self, receiver: oneshot::Receiver<Assignment>) -> SlotTicket {
        SlotTicket {
            receiver: Some(receiver),
            registry: self.clone(),
        }
    }

    /// 为 Worker 放置一个等待槽位
    pub async fn park(&self, worker: Worker) -> SlotTicket {
        let mut state = self.inner.guard.write().await;
        debug!("Worker {} 进入等待 (uid={}, shared={})", worker.id, worker.uid, worker.shared);
        let receiver = state.park(worker);
        state.record_gauges();
        self.ticket(receiver)
    }

    /// 把任务交给一个等待中的 Worker
    ///
    /// 优先交给任务所有者的 Worker，其次是共享 Worker。没有可用 Worker 时返回 `false`，
    /// 任务留在存储中等待下一次 `GetTask` 拉取。
    pub async fn assign(&self, task: Task) -> DispatchResult<bool> {
        let mut state = self.inner.guard.write().await;
        let tid = task.id;
        if state.running.contains_key(&tid) {
            warn!("任务 {} 已在运行表中，忽略重复分配", tid);
            return Ok(false);
        }

        let owner = task.dispatch_owner();
        let mut task = task;
        let mut dead_slots = 0u64;

        while let Some(slot) = state.pop_slot(owner) {
            if slot.sender.is_closed() {
                dead_slots += 1;
                continue;
            }
            match slot.sender.send(Assignment::Task(task)) {
                Ok(()) => {
                    state.begin(tid);
                    state.record_gauges();
                    counter!(ASSIGNMENTS_TOTAL).increment(1);
                    if dead_slots > 0 {
                        counter!(DEAD_SLOTS_TOTAL).increment(dead_slots);
                    }
                    if let Err(e) = self
                        .inner
                        .store
                        .update_task_status(tid, TaskStatus::Scheduled)
                        .await
                    {
                        error!("任务 {} 已分配但写入Scheduled状态失败: {}", tid, e);
                    }
                    info!("任务 {} 已分配给Worker {}", tid, slot.worker.id);
                    return Ok(true);
                }
                Err(rejected) => {
                    dead_slots += 1;
                    match rejected {
                        Assignment::Task(returned) => task = returned,
                        Assignment::Released => break,
                    }
                }
            }
        }

        state.record_gauges();
        if dead_slots > 0 {
            counter!(DEAD_SLOTS_TOTAL).increment(dead_slots);
            warn!("任务 {} 分配时跳过 {} 个已断开的槽位，保持Pending", tid, dead_slots);
            self.inner
                .store
                .update_task_status(tid, TaskStatus::Pending)
                .await?;
        }
        debug!("任务 {} 暂无可用Worker", tid);
        Ok(false)
    }

    /// `GetTask` 的核心：取一个待处理任务，没有则等待分配
    ///
    /// 查询存储与放置槽位在同一次加锁内完成，避免任务在两者之间被漏掉。
    ///
    /// 存储中仍为 `Pending` 却已在运行表中的任务（分配时 `Scheduled` 写入失败）会先补写状态，
    /// 再继续查询，不会挡住后面的任务。
    pub async fn next_task(&self, worker: Worker) -> DispatchResult<Task> {
        let ticket = {
            let mut state = self.inner.guard.write().await;
            if state.draining {
                return Err(DispatchError::NoTask);
            }
            loop {
                let pending = self
                    .inner
                    .store
                    .get_pending_task(worker.uid, worker.shared)
                    .await?;

                match pending {
                    Some(task) if state.running.contains_key(&task.id) => {
                        warn!("任务 {} 已分配但存储仍为Pending，补写Scheduled", task.id);
                        self.inner
                            .store
                            .update_task_status(task.id, TaskStatus::Scheduled)
                            .await?;
                    }
                    Some(mut task) => {
                        state.begin(task.id);
                        if let Err(e) = self
                            .inner
                            .store
                            .update_task_status(task.id, TaskStatus::Scheduled)
                            .await
                        {
                            state.running.remove(&task.id);
                            return Err(e);
                        }
                        state.record_gauges();
                        counter!(ASSIGNMENTS_TOTAL).increment(1);
                        task.status = TaskStatus::Scheduled;
                        info!("Worker {} 直接领取任务 {}", worker.id, task.id);
                        return Ok(task);
                    }
                    None => {
                        debug!("Worker {} 没有待处理任务，进入等待", worker.id);
                        let receiver = state.park(worker);
                        state.record_gauges();
                        break self.ticket(receiver);
                    }
                }
            }
        };

        match ticket.wait().await {
            Assignment::Task(mut task) => {
                task.status = TaskStatus::Scheduled;
                Ok(task)
            }
            Assignment::Released => Err(DispatchError::NoTask),
        }
    }

    /// 登记任务进入运行表
    pub async fn begin(&self, tid: i64) {
        let mut state = self.inner.guard.write().await;
        state.begin(tid);
        state.record_gauges();
    }

    /// 等待取消或结果发布。取消返回 `true`，结果发布返回 `false`。
    pub async fn wait_cancel(&self, tid: i64) -> DispatchResult<bool> {
        let entry = {
            let state = self.inner.guard.read().await;
            state
                .running
                .get(&tid)
                .cloned()
                .ok_or(DispatchError::NotValidTask { tid })?
        };

        let canceled = {
            let mut receiver = entry.cancel_rx.lock().await;
            if entry.delivered.load(Ordering::SeqCst) {
                return Err(DispatchError::NotValidTask { tid });
            }
            let canceled = receiver.recv().await.unwrap_or(true);
            entry.delivered.store(true, Ordering::SeqCst);
            canceled
        };

        let mut state = self.inner.guard.write().await;
        if state
            .running
            .get(&tid)
            .is_some_and(|current| Arc::ptr_eq(current, &entry))
        {
            state.running.remove(&tid);
            state.record_gauges();
        }
        debug!("任务 {} 的取消等待结束: canceled={}", tid, canceled);
        Ok(canceled)
    }

    /// 取消任务
    ///
    /// 运行中的任务通过取消通道通知 Worker。无论任务是否在运行表中，存储中的状态都写为
    /// `Canceled`，与结果发布竞争时取消胜出。返回是否通知到了运行中的任务。
    pub async fn cancel(&self, tid: i64) -> DispatchResult<bool> {
        let mut state = self.inner.guard.write().await;
        let signaled = match state.running.remove(&tid) {
            Some(entry) => {
                // 结果已发布时通道已满，取消在通道侧被丢弃
                let _ = entry.cancel_tx.try_send(true);
                state.record_gauges();
                true
            }
            None => false,
        };
        counter!(CANCELS_TOTAL).increment(1);

        self.inner
            .store
            .update_task_status(tid, TaskStatus::Canceled)
            .await?;
        info!("任务 {} 已取消 (通知Worker: {})", tid, signaled);
        Ok(signaled)
    }

    /// `PublishStarted`：持有读锁写入 `Running`，之后的取消一定晚于这次写入
    pub async fn mark_started(&self, tid: i64) -> DispatchResult<()> {
        let state = self.inner.guard.read().await;
        let Some(entry) = state.running.get(&tid) else {
            return Err(DispatchError::NotValidTask { tid });
        };
        self.inner
            .store
            .update_task_status(tid, TaskStatus::Running)
            .await?;
        entry.started.store(true, Ordering::SeqCst);
        debug!("任务 {} 开始运行", tid);
        Ok(())
    }

    /// `PublishResult`：写入结果，移除运行表条目并释放等待中的 `WaitForCancel`
    ///
    /// 存储写入失败时运行表保持不变，Worker 可以重试。
    pub async fn publish_result(
        &self,
        tid: i64,
        output: &str,
        exit_status: i32,
        patch: Option<String>,
    ) -> DispatchResult<()> {
        let mut state = self.inner.guard.write().await;
        if !state.running.contains_key(&tid) {
            return Err(DispatchError::NotValidTask { tid });
        }

        self.inner
            .store
            .update_task_result(tid, output, exit_status, patch)
            .await?;

        if let Some(entry) = state.running.remove(&tid) {
            let _ = entry.cancel_tx.try_send(false);
        }
        state.record_gauges();
        counter!(RESULTS_TOTAL).increment(1);
        info!("任务 {} 已完成: exit_status={}", tid, exit_status);
        Ok(())
    }

    /// 唤醒该 Worker 所有等待中的 `GetTask`，返回释放的槽位数
    pub async fn release_worker(&self, worker_id: i64) -> usize {
        let mut state = self.inner.guard.write().await;
        let mut released = Vec::new();

        for queue in state.available_workers.values_mut() {
            let (mine, rest): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|slot| slot.worker.id == worker_id);
            *queue = rest;
            released.extend(mine);
        }
        state.available_workers.retain(|_, queue| !queue.is_empty());

        let (mine, rest): (VecDeque<_>, VecDeque<_>) = state
            .shared_workers
            .drain(..)
            .partition(|slot| slot.worker.id == worker_id);
        state.shared_workers = rest;
        released.extend(mine);
        state.record_gauges();

        let count = released.len();
        for slot in released {
            let _ = slot.sender.send(Assignment::Released);
        }
        if count > 0 {
            info!("Worker {} 注销，释放 {} 个等待槽位", worker_id, count);
        }
        count
    }

    /// 关闭时调用：释放所有等待槽位并取消所有运行中的任务，返回被取消的任务
    ///
    /// 之后到来的 `GetTask` 直接返回 `NoTask`，不再进入等待。
    pub async fn drain(&self) -> Vec<i64> {
        let mut state = self.inner.guard.write().await;
        state.draining = true;

        let mut slots: Vec<ParkedSlot> = state.shared_workers.drain(..).collect();
        for (_, queue) in state.available_workers.drain() {
            slots.extend(queue);
        }
        for slot in slots {
            let _ = slot.sender.send(Assignment::Released);
        }

        let running: Vec<(i64, Arc<RunningEntry>)> = state.running.drain().collect();
        state.record_gauges();

        let mut canceled = Vec::with_capacity(running.len());
        for (tid, entry) in running {
            let _ = entry.cancel_tx.try_send(true);
            counter!(CANCELS_TOTAL).increment(1);
            match self
                .inner
                .store
                .update_task_status(tid, TaskStatus::Canceled)
                .await
            {
                Ok(()) => canceled.push(tid),
                Err(e) => error!("关闭时取消任务 {} 失败: {}", tid, e),
            }
        }
        if !canceled.is_empty() {
            info!("关闭时取消了 {} 个运行中的任务", canceled.len());
        }
        canceled
    }

    /// 回收交出超过 `max_wait` 仍未 `PublishStarted` 的任务
    ///
    /// Worker 可能在领取后、开始前崩溃，或者 `GetTask` 的响应在途中丢失。这类任务移出运行表，
    /// 退回 `Pending` 后重新分配。返回被回收的任务。
    pub async fn reclaim_unstarted(&self, max_wait: Duration) -> Vec<i64> {
        let reclaimed = {
            let mut state = self.inner.guard.write().await;
            let stale: Vec<i64> = state
                .running
                .iter()
                .filter(|(_, entry)| entry.is_stale(max_wait))
                .map(|(tid, _)| *tid)
                .collect();

            let mut reclaimed = Vec::with_capacity(stale.len());
            for tid in stale {
                if let Err(e) = self
                    .inner
                    .store
                    .update_task_status(tid, TaskStatus::Pending)
                    .await
                {
                    error!("任务 {} 退回Pending失败: {}", tid, e);
                    continue;
                }
                if let Some(entry) = state.running.remove(&tid) {
                    // 迟到的 WaitForCancel 收到取消，Worker 放弃这个任务
                    let _ = entry.cancel_tx.try_send(true);
                }
                counter!(RECLAIMED_TOTAL).increment(1);
                warn!("任务 {} 交出 {:?} 后仍未开始，退回Pending", tid, max_wait);
                reclaimed.push(tid);
            }
            state.record_gauges();
            reclaimed
        };

        for tid in &reclaimed {
            let task = match self.inner.store.get_task(*tid).await {
                Ok(task) => task,
                Err(e) => {
                    error!("读取回收任务 {} 失败: {}", tid, e);
                    continue;
                }
            };
            if let Err(e) = self.assign(task).await {
                error!("回收任务 {} 重新分配失败: {}", tid, e);
            }
        }
        reclaimed
    }

    /// 取回在送达途中丢失的任务：仍在运行表中说明尚未被取消，退回 `Pending` 后重新分配
    async fn requeue(&self, task: Task) {
        let tid = task.id;
        {
            let mut state = self.inner.guard.write().await;
            if state.running.remove(&tid).is_none() {
                return;
            }
            state.record_gauges();
            if let Err(e) = self
                .inner
                .store
                .update_task_status(tid, TaskStatus::Pending)
                .await
            {
                error!("任务 {} 退回Pending失败: {}", tid, e);
                return;
            }
        }
        warn!("任务 {} 的接收方已断开，重新分配", tid);
        if let Err(e) = self.assign(task).await {
            error!("任务 {} 重新分配失败: {}", tid, e);
        }
    }

    pub async fn is_running(&self, tid: i64) -> bool {
        self.inner.guard.read().await.running.contains_key(&tid)
    }

    pub async fn running_tasks(&self) -> Vec<i64> {
        let mut tids: Vec<i64> = self.inner.guard.read().await.running.keys().copied().collect();
        tids.sort_unstable();
        tids
    }

    pub async fn parked_count(&self) -> usize {
        self.inner.guard.read().await.parked_count()
    }

    /// 仍然存活的等待槽位数
    pub async fn live_parked_count(&self) -> usize {
        let state = self.inner.guard.read().await;
        state
            .available_workers
            .values()
            .flat_map(|queue| queue.iter())
            .chain(state.shared_workers.iter())
            .filter(|slot| !slot.sender.is_closed())
            .count()
    }
}
