/// End-to-end scheduler tests
///
/// Each test parses a markdown task document, persists the graph and
/// drives it with the deterministic mock runner. Mock behavior is
/// scripted through step bullets (`[delay:…]`, `[exit:…]`, `[output:…]`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use taskmill_engine::parser::parse_task_markdown;
use taskmill_engine::runner::MockRunner;
use taskmill_engine::scheduler::Scheduler;
use taskmill_engine::supervisor::{Supervisor, SupervisorConfig};
use taskmill_shared::db::pool::DatabaseConfig;
use taskmill_shared::db::store::Store;
use taskmill_shared::error::TaskmillError;
use taskmill_shared::models::subtask::SubTask;
use taskmill_shared::models::task::{ReturnMode, Task, TaskStatus};
use taskmill_shared::models::task_log::TaskLog;
use taskmill_shared::models::task_result::{ResultStatus, TaskResult};
use taskmill_shared::events::EventBus;
use tempfile::TempDir;

async fn setup(dir: &TempDir) -> (Store, Arc<Scheduler>) {
    let store = Store::open(
        DatabaseConfig {
            path: dir.path().join("scheduler_test.db"),
            min_connections: 1,
            max_connections: 5,
            connection_timeout_ms: 5_000,
            busy_timeout_ms: 2_000,
            idle_timeout_ms: 60_000,
        },
        1,
    )
    .await
    .expect("store open");

    let bus = EventBus::default();
    let supervisor = Arc::new(Supervisor::new(
        store.pool().clone(),
        bus.clone(),
        Arc::new(MockRunner::new()),
        SupervisorConfig {
            heartbeat_interval_ms: 200,
            execution_timeout_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 20,
            max_instances: 5,
            kill_grace_ms: 100,
        },
    ));
    let scheduler = Arc::new(Scheduler::new(store.pool().clone(), bus, supervisor));

    (store, scheduler)
}

async fn assert_invariants(store: &Store, root_id: &str) {
    // Every terminal task has exactly one result row; every completed
    // sub-task has only completed dependencies.
    let subtasks = SubTask::list_by_parent(store.pool(), root_id).await.unwrap();
    for sub in &subtasks {
        let task = Task::find_by_id(store.pool(), &sub.task_id).await.unwrap().unwrap();
        if task.status.is_terminal() {
            assert_eq!(
                TaskResult::count_for_task(store.pool(), &sub.task_id).await.unwrap(),
                1,
                "terminal sub-task {} must have exactly one result",
                sub.task_id
            );
        }
        if task.status == TaskStatus::Completed {
            for dep in &sub.dependencies {
                let dep_task = Task::find_by_id(store.pool(), dep).await.unwrap().unwrap();
                assert_eq!(
                    dep_task.status,
                    TaskStatus::Completed,
                    "completed sub-task {} has non-completed dependency {}",
                    sub.task_id,
                    dep
                );
            }
        }
        if task.status == TaskStatus::Completed {
            assert_eq!(task.progress, 100);
            assert!(task.started_at.unwrap() <= task.completed_at.unwrap());
        }
    }

    let root = Task::find_by_id(store.pool(), root_id).await.unwrap().unwrap();
    if root.status.is_terminal() {
        assert_eq!(
            TaskResult::count_for_task(store.pool(), root_id).await.unwrap(),
            1
        );
    }
}

#[tokio::test]
async fn test_single_quick_subtask() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = setup(&dir).await;

    let doc = r#"# Task quick: Quick math

**Objective**: Answer a trivial question.

## Requirements

- [ ] The answer is produced

### Task 1: Ask

- **Timeout**: 5000
- [output:4] What is 2+2?
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();

    let result = scheduler.run_graph(&root.id).await.unwrap();

    assert_eq!(result.status, ResultStatus::Success);
    assert!(result.execution_time_ms < 5_000);

    let root = Task::find_by_id(store.pool(), "quick").await.unwrap().unwrap();
    assert_eq!(root.status, TaskStatus::Completed);

    let sub = Task::find_by_id(store.pool(), "quick-sub-1").await.unwrap().unwrap();
    assert_eq!(sub.status, TaskStatus::Completed);

    let sub_result = TaskResult::for_task(store.pool(), "quick-sub-1").await.unwrap().unwrap();
    assert_eq!(sub_result.status, ResultStatus::Success);
    assert_eq!(sub_result.output, "4");

    assert_invariants(&store, "quick").await;
}

#[tokio::test]
async fn test_parallel_siblings_overlap() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = setup(&dir).await;

    let doc = r#"# Task par: Parallel wave

**Objective**: Three independent slices run together.

**Execution mode**: parallel

## Requirements

- [ ] All slices finish

### Task 1: Slow

- [delay:1000] slice one

### Task 2: Slower

- [delay:1200] slice two

### Task 3: Slowest

- [delay:1500] slice three
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();

    let started = Instant::now();
    let result = scheduler.run_graph(&root.id).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, ResultStatus::Success);
    assert!(
        elapsed >= Duration::from_millis(1_500),
        "cannot finish before the slowest sibling"
    );
    assert!(
        elapsed < Duration::from_millis(2_500),
        "parallel siblings must overlap, took {:?}",
        elapsed
    );

    for ordinal in 1..=3 {
        let id = format!("par-sub-{}", ordinal);
        let sub_result = TaskResult::for_task(store.pool(), &id).await.unwrap().unwrap();
        assert_eq!(sub_result.status, ResultStatus::Success);
    }

    assert_invariants(&store, "par").await;
}

#[tokio::test]
async fn test_sequential_dependency_chain() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = setup(&dir).await;

    let doc = r#"# Task chain: Dependency chain

**Objective**: Four steps in strict order.

## Requirements

- [ ] Steps run in order

### Task 1: A

- [delay:50] step a

### Task 2: B

- **Dependencies**: Task 1
- [delay:50] step b

### Task 3: C

- **Dependencies**: Task 2
- [delay:50] step c

### Task 4: D

- **Dependencies**: Task 3
- [delay:50] step d
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();

    let result = scheduler.run_graph(&root.id).await.unwrap();
    assert_eq!(result.status, ResultStatus::Success);

    for pair in [(1, 2), (2, 3), (3, 4)] {
        let earlier = Task::find_by_id(store.pool(), &format!("chain-sub-{}", pair.0))
            .await
            .unwrap()
            .unwrap();
        let later = Task::find_by_id(store.pool(), &format!("chain-sub-{}", pair.1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(earlier.status, TaskStatus::Completed);
        assert!(
            earlier.completed_at.unwrap() <= later.started_at.unwrap(),
            "task {} must finish before task {} starts",
            pair.0,
            pair.1
        );
    }

    assert_invariants(&store, "chain").await;
}

#[tokio::test]
async fn test_subtask_timeout() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = setup(&dir).await;

    let doc = r#"# Task slow: Timeout case

**Objective**: A sub-task sleeps past its deadline.

## Requirements

- [ ] Deadline is enforced

### Task 1: Sleeper

- **Timeout**: 1000
- [delay:5000] sleep long
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();

    let started = Instant::now();
    let result = scheduler.run_graph(&root.id).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, ResultStatus::Timeout);
    assert!(
        elapsed < Duration::from_millis(3_000),
        "child must be reaped promptly after the timer fires, took {:?}",
        elapsed
    );

    let sub = Task::find_by_id(store.pool(), "slow-sub-1").await.unwrap().unwrap();
    assert_eq!(sub.status, TaskStatus::Timeout);
    assert!(sub.timeout_handled);

    let sub_result = TaskResult::for_task(store.pool(), "slow-sub-1").await.unwrap().unwrap();
    assert_eq!(sub_result.status, ResultStatus::Timeout);

    // The instance that ran the sleeper folded one timeout into its
    // rolling metrics.
    let (timeouts,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(json_extract(metrics, '$.timeout_tasks')), 0) FROM instances",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(timeouts, 1);

    assert_invariants(&store, "slow").await;
}

#[tokio::test]
async fn test_dependency_failure_cascade() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = setup(&dir).await;

    let doc = r#"# Task casc: Failure cascade

**Objective**: A failure blocks its dependents only.

**Execution mode**: parallel

## Requirements

- [ ] Independent branches are unaffected

### Task 1: Breaks

- [exit:1] this one fails

### Task 2: Blocked

- **Dependencies**: Task 1
- never runs

### Task 3: Independent

- [output:fine] keeps going
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();

    let result = scheduler.run_graph(&root.id).await.unwrap();
    assert_eq!(result.status, ResultStatus::Error);

    let a = Task::find_by_id(store.pool(), "casc-sub-1").await.unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Failed);

    let b = Task::find_by_id(store.pool(), "casc-sub-2").await.unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::Cancelled);

    let c = Task::find_by_id(store.pool(), "casc-sub-3").await.unwrap().unwrap();
    assert_eq!(c.status, TaskStatus::Completed);

    // The blocked node's log names the unsatisfied dependency.
    let logs = TaskLog::list_by_task(store.pool(), "casc-sub-2", None, None, 100)
        .await
        .unwrap();
    assert!(
        logs.iter().any(|l| l.message.contains("casc-sub-1")),
        "cancel log must name the blocked dependency"
    );

    let root = Task::find_by_id(store.pool(), "casc").await.unwrap().unwrap();
    assert_eq!(root.status, TaskStatus::Failed);

    assert_invariants(&store, "casc").await;
}

#[tokio::test]
async fn test_sequential_mode_stops_later_siblings_on_failure() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = setup(&dir).await;

    let doc = r#"# Task seqfail: Sequential stop

**Objective**: A sequential failure cancels later siblings.

## Requirements

- [ ] Later siblings never dispatch

### Task 1: Fails

- [exit:2] break here

### Task 2: Never

- would have run second
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();

    let result = scheduler.run_graph(&root.id).await.unwrap();
    assert_eq!(result.status, ResultStatus::Error);

    let second = Task::find_by_id(store.pool(), "seqfail-sub-2").await.unwrap().unwrap();
    assert_eq!(second.status, TaskStatus::Cancelled);
    assert!(second.started_at.is_none(), "cancelled sibling never dispatched");

    assert_invariants(&store, "seqfail").await;
}

#[tokio::test]
async fn test_dependency_cycle_fails_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = setup(&dir).await;

    let doc = r#"# Task cyc: Cycle

**Objective**: Two tasks depend on each other.

## Requirements

- [ ] Never dispatched

### Task 1: A

- **Dependencies**: Task 2
- a

### Task 2: B

- **Dependencies**: Task 1
- b
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();

    let err = scheduler.run_graph(&root.id).await.unwrap_err();
    assert!(matches!(err, TaskmillError::InvalidGraph(_)));

    let root = Task::find_by_id(store.pool(), "cyc").await.unwrap().unwrap();
    assert_eq!(root.status, TaskStatus::Failed);

    // No sub-task was ever dispatched.
    for ordinal in 1..=2 {
        let sub = Task::find_by_id(store.pool(), &format!("cyc-sub-{}", ordinal))
            .await
            .unwrap()
            .unwrap();
        assert!(sub.started_at.is_none());
    }
}

#[tokio::test]
async fn test_cancel_running_graph() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = setup(&dir).await;

    let doc = r#"# Task canc: Cancel target

**Objective**: A long-running graph gets cancelled.

## Requirements

- [ ] Cancel cascades

### Task 1: Long

- [delay:30000] runs forever-ish

### Task 2: Queued

- **Dependencies**: Task 1
- waits on task one
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();
    let root_id = root.id.clone();

    let driver = {
        let scheduler = scheduler.clone();
        let root_id = root_id.clone();
        tokio::spawn(async move { scheduler.run_graph(&root_id).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(scheduler.is_active(&root_id).await);
    assert!(scheduler.cancel(&root_id).await.unwrap());

    let result = driver.await.unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Cancelled);

    let root = Task::find_by_id(store.pool(), &root_id).await.unwrap().unwrap();
    assert_eq!(root.status, TaskStatus::Cancelled);

    let running = Task::find_by_id(store.pool(), "canc-sub-1").await.unwrap().unwrap();
    assert_eq!(running.status, TaskStatus::Cancelled);

    let pending = Task::find_by_id(store.pool(), "canc-sub-2").await.unwrap().unwrap();
    assert_eq!(pending.status, TaskStatus::Cancelled);
    assert!(pending.started_at.is_none());

    // Cancellation is idempotent.
    assert!(!scheduler.cancel(&root_id).await.unwrap());

    assert_invariants(&store, &root_id).await;
}

#[tokio::test]
async fn test_summary_return_mode() {
    let dir = TempDir::new().unwrap();
    let (_store, scheduler) = setup(&dir).await;

    let doc = r#"# Task summ: Summary output

**Objective**: Output is reduced to a digest.

## Requirements

- [ ] Digest lists each sub-task

### Task 1: One

- [output:first] one

### Task 2: Two

- **Dependencies**: Task 1
- [output:second] two
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler
        .persist_graph(&graph, "/tmp", Some(ReturnMode::Summary))
        .await
        .unwrap();

    let result = scheduler.run_graph(&root.id).await.unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert!(result.output.starts_with("2/2 sub-tasks completed"));
    assert!(result.output.contains("Task 1 (One): completed"));
    assert!(result.output.contains("Task 2 (Two): completed"));
}

#[tokio::test]
async fn test_full_return_mode_concatenates_outputs() {
    let dir = TempDir::new().unwrap();
    let (_store, scheduler) = setup(&dir).await;

    let doc = r#"# Task fullo: Full output

**Objective**: Output carries every sub-task's stdout.

## Requirements

- [ ] Both outputs present

### Task 1: One

- [output:alpha-payload] one

### Task 2: Two

- [output:beta-payload] two
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler
        .persist_graph(&graph, "/tmp", Some(ReturnMode::Full))
        .await
        .unwrap();

    let result = scheduler.run_graph(&root.id).await.unwrap();
    assert!(result.output.contains("alpha-payload"));
    assert!(result.output.contains("beta-payload"));
}

#[tokio::test]
async fn test_rerun_of_terminal_root_returns_existing_result() {
    let dir = TempDir::new().unwrap();
    let (_store, scheduler) = setup(&dir).await;

    let doc = r#"# Task rerun: Idempotent rerun

**Objective**: Driving a finished graph returns its stored result.

## Requirements

- [ ] No second execution

### Task 1: Once

- [output:only-once] run once
"#;
    let graph = parse_task_markdown(doc).unwrap();
    let root = scheduler.persist_graph(&graph, "/tmp", None).await.unwrap();

    let first = scheduler.run_graph(&root.id).await.unwrap();
    let second = scheduler.run_graph(&root.id).await.unwrap();

    assert_eq!(first.id, second.id, "same stored result row");
    assert_eq!(second.status, ResultStatus::Success);
}
