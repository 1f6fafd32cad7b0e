//! End-to-end agent loop test: real services, in-process control plane,
//! scripted runner.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use foreman::agent::{ControlPlane, LocalControlPlane, TaskContext, TaskRunner, WorkerAgent};
use foreman::config::AgentConfig;
use foreman::dispatch::{Dispatcher, NewTask};
use foreman::model::{TaskPriority, TaskStatus, TaskType, WorkOrderStatus};
use foreman::orchestrator::Orchestrator;
use foreman::queue::{JobBroker, QueueManager, WorkOrderPayload};
use foreman::session::{SessionPolicy, SessionRegistry};
use foreman::store::{Database, LibSqlBackend};

struct Harness {
    db: Arc<dyn Database>,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    control: Arc<dyn ControlPlane>,
}

async fn harness(max_retries: u32) -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let broker = Arc::new(JobBroker::new_memory().await.unwrap());
    let queue = Arc::new(QueueManager::new(broker));
    let sessions = Arc::new(SessionRegistry::new(
        Arc::clone(&db),
        SessionPolicy::default(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        max_retries,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        Arc::clone(&sessions),
    ));
    let control: Arc<dyn ControlPlane> = Arc::new(LocalControlPlane::new(
        Arc::clone(&dispatcher),
        Arc::clone(&orchestrator),
        Arc::clone(&sessions),
    ));

    Harness {
        db,
        dispatcher,
        orchestrator,
        control,
    }
}

/// Runner that records executions, fails the first attempt of any task
/// whose title starts with "flaky", and asks the human reviewer a question
/// for any task whose title starts with "ask".
struct ScriptedRunner {
    executed: Mutex<Vec<String>>,
    failed_once: Mutex<HashSet<String>>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            failed_once: Mutex::new(HashSet::new()),
        }
    }

    fn executions(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, order: &WorkOrderPayload, ctx: &TaskContext) -> anyhow::Result<String> {
        self.executed.lock().unwrap().push(order.title.clone());

        if order.title.starts_with("ask") {
            ctx.ask_human("Should I target the release branch?", order.task_id)
                .await?;
        }

        if order.title.starts_with("flaky")
            && self.failed_once.lock().unwrap().insert(order.title.clone())
        {
            anyhow::bail!("transient failure");
        }

        Ok(format!("done: {}", order.title))
    }
}

fn fast_config() -> AgentConfig {
    AgentConfig {
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(50),
        error_backoff: Duration::from_millis(10),
        ..AgentConfig::default()
    }
}

fn new_task(title: &str, priority: TaskPriority) -> NewTask {
    NewTask {
        title: title.to_string(),
        description: "integration".to_string(),
        task_type: TaskType::Feature,
        priority,
        repository_url: "https://example.com/repo.git".to_string(),
        branch_name: "main".to_string(),
    }
}

/// Poll until the condition holds or the deadline passes.
async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn agent_drains_queue_in_priority_order() {
    let h = harness(3).await;
    let (low, _) = h
        .dispatcher
        .create_task(new_task("low-task", TaskPriority::Low))
        .await
        .unwrap();
    let (high, _) = h
        .dispatcher
        .create_task(new_task("high-task", TaskPriority::High))
        .await
        .unwrap();

    let runner = Arc::new(ScriptedRunner::new());
    let (tx, rx) = watch::channel(false);
    let agent = WorkerAgent::new(fast_config(), Arc::clone(&h.control), runner.clone(), rx);
    let handle = tokio::spawn(agent.run());

    let db = Arc::clone(&h.db);
    let (low_id, high_id) = (low.id, high.id);
    wait_for(|| {
        let db = Arc::clone(&db);
        async move {
            let low = db.get_task(low_id).await.unwrap().unwrap();
            let high = db.get_task(high_id).await.unwrap().unwrap();
            low.status == TaskStatus::Completed && high.status == TaskStatus::Completed
        }
    })
    .await;

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // High-priority lane drained before low, despite enqueue order.
    assert_eq!(runner.executions(), ["high-task", "low-task"]);

    // The agent deregistered on shutdown.
    assert!(h.dispatcher.list_workers(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_task_is_retried_and_recovers() {
    let h = harness(3).await;
    let (task, order) = h
        .dispatcher
        .create_task(new_task("flaky-task", TaskPriority::Normal))
        .await
        .unwrap();

    let runner = Arc::new(ScriptedRunner::new());
    let (tx, rx) = watch::channel(false);
    let agent = WorkerAgent::new(fast_config(), Arc::clone(&h.control), runner.clone(), rx);
    let handle = tokio::spawn(agent.run());

    let db = Arc::clone(&h.db);
    let task_id = task.id;
    wait_for(|| {
        let db = Arc::clone(&db);
        async move {
            let task = db.get_task(task_id).await.unwrap().unwrap();
            task.status == TaskStatus::Completed
        }
    })
    .await;

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // Two executions: the failing first attempt and the retry.
    assert_eq!(runner.executions(), ["flaky-task", "flaky-task"]);

    let order = h.db.get_work_order(order.id).await.unwrap().unwrap();
    assert_eq!(order.status, WorkOrderStatus::Completed);
    assert_eq!(order.retry_count, 1);
}

#[tokio::test]
async fn retries_exhaust_into_permanent_failure() {
    let h = harness(0).await; // No re-enqueues allowed.
    let (task, order) = h
        .dispatcher
        .create_task(new_task("flaky-task", TaskPriority::Normal))
        .await
        .unwrap();

    let runner = Arc::new(ScriptedRunner::new());
    let (tx, rx) = watch::channel(false);
    let agent = WorkerAgent::new(fast_config(), Arc::clone(&h.control), runner.clone(), rx);
    let handle = tokio::spawn(agent.run());

    let db = Arc::clone(&h.db);
    let task_id = task.id;
    wait_for(|| {
        let db = Arc::clone(&db);
        async move {
            let task = db.get_task(task_id).await.unwrap().unwrap();
            task.status == TaskStatus::Failed
        }
    })
    .await;

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(runner.executions(), ["flaky-task"]);
    let order = h.db.get_work_order(order.id).await.unwrap().unwrap();
    assert_eq!(order.status, WorkOrderStatus::Failed);
}

#[tokio::test]
async fn clarification_round_trip_through_the_router() {
    let h = harness(3).await;
    let (task, _) = h
        .dispatcher
        .create_task(new_task("ask-about-branch", TaskPriority::Normal))
        .await
        .unwrap();

    let runner = Arc::new(ScriptedRunner::new());
    let (tx, rx) = watch::channel(false);
    let agent = WorkerAgent::new(fast_config(), Arc::clone(&h.control), runner.clone(), rx);
    let handle = tokio::spawn(agent.run());

    let db = Arc::clone(&h.db);
    let task_id = task.id;
    wait_for(|| {
        let db = Arc::clone(&db);
        async move {
            let task = db.get_task(task_id).await.unwrap().unwrap();
            task.status == TaskStatus::Completed
        }
    })
    .await;

    // Assert while the agent is still registered: deregistration cascades
    // the worker's sessions (and their messages) away.
    let pending = h.orchestrator.pending_messages(50).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, Some(task.id));
    let external_id = pending[0].external_session_id.clone().unwrap();

    // Answering it clears the pending set and threads the conversation.
    h.orchestrator
        .send_human_response(pending[0].message_id, "Yes, target release.")
        .await
        .unwrap();

    assert!(h.orchestrator.pending_messages(50).await.unwrap().is_empty());
    let conversation = h.orchestrator.conversation(&external_id).await.unwrap();
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[1].in_reply_to, Some(pending[0].message_id));

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
