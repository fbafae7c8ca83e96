//! Worker loops, wake signalling, periodic triggers and housekeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus_work_queue::core::store::WORKER_LOST_ERROR;
use prometheus_work_queue::core::{
    handler_fn, AppResult, Backend, DueItem, ExecutionEngine, HandlerContext, HandlerError,
    FailureCategory, HandlerOutcome, HandlerRegistry, Housekeeper, HousekeepingSettings, NewTask,
    NotifyWake, PeriodicJob, PeriodicTrigger, PollOnlyWake, RetryPolicies, RetryPolicy,
    ScheduleDefinition, TaskFilter, TaskStatus, TaskStore, UserNotification, WakeChannel,
    WorkerGroup, WorkerSettings, NOTIFY_USER_TASK,
};
use prometheus_work_queue::infra::MemoryStore;
use prometheus_work_queue::runtime::{EnqueueOptions, Producer, TokioSpawner};
use prometheus_work_queue::util::clock::{Clock, ManualClock, SystemClock};
use serde_json::json;
use tokio::sync::mpsc;

const START: i64 = 1_767_225_600_000;

fn recording_registry(tx: mpsc::UnboundedSender<u64>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "publish",
            handler_fn(move |ctx: HandlerContext| {
                let tx = tx.clone();
                async move {
                    let n: u64 = ctx.payload()?;
                    tx.send(n)
                        .map_err(|e| HandlerError::transient(e.to_string()))?;
                    Ok::<_, HandlerError>(HandlerOutcome::Done)
                }
            }),
        )
        .unwrap();
    registry
}

async fn run_group(wake: Arc<dyn WakeChannel>, settings: WorkerSettings) {
    let store: Arc<dyn Backend> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Arc::new(
        ExecutionEngine::new(
            Arc::clone(&store),
            recording_registry(tx),
            RetryPolicies::default(),
            Arc::clone(&clock),
        )
        .with_wake(Arc::clone(&wake)),
    );
    let group = WorkerGroup::new(engine, Arc::clone(&wake), settings, 3);
    let handle = group.start(&TokioSpawner::current());
    assert_eq!(handle.worker_ids().len(), 3);

    let producer = Producer::new(
        Arc::clone(&store),
        wake,
        RetryPolicies::default(),
        clock,
    );
    for n in 0..6_u64 {
        producer.enqueue("publish", &n, EnqueueOptions::default()).unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 6 {
        let n = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("worker picked up the task")
            .unwrap();
        seen.push(n);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..6).collect::<Vec<_>>());

    let stats = handle.shutdown().await;
    assert_eq!(stats.processed, 6);
    let done = store
        .list(&TaskFilter::default().with_type("publish"))
        .unwrap();
    assert!(done.iter().all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wake_signal_starts_work_without_waiting_for_poll() {
    let settings = WorkerSettings {
        // Long enough that only the wake signal can explain prompt pickup.
        poll_interval: Duration::from_secs(30),
        ..WorkerSettings::default()
    };
    run_group(Arc::new(NotifyWake::new()), settings).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polling_alone_drains_the_queue() {
    let settings = WorkerSettings {
        poll_interval: Duration::from_millis(20),
        ..WorkerSettings::default()
    };
    run_group(Arc::new(PollOnlyWake), settings).await;
}

#[tokio::test]
async fn idle_group_shuts_down_promptly() {
    let wake: Arc<dyn WakeChannel> = Arc::new(NotifyWake::new());
    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(MemoryStore::new()),
        HandlerRegistry::new(),
        RetryPolicies::default(),
        Arc::new(SystemClock),
    ));
    let settings = WorkerSettings {
        poll_interval: Duration::from_secs(60),
        ..WorkerSettings::default()
    };
    let handle = WorkerGroup::new(engine, wake, settings, 2).start(&TokioSpawner::current());
    let stats = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("shutdown does not wait for the poll interval");
    assert_eq!(stats.processed, 0);
}

struct ImagesToPost {
    images: Vec<u32>,
}

#[async_trait]
impl PeriodicJob for ImagesToPost {
    async fn scan(&self, now: i64) -> AppResult<Vec<DueItem>> {
        Ok(self
            .images
            .iter()
            .map(|image| {
                DueItem::new("publish", format!("image-{image}"), json!({ "image": image }))
                    .owner("gus")
                    .scheduled_for(now)
            })
            .collect())
    }
}

#[tokio::test]
async fn periodic_trigger_never_duplicates_live_work() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(START));
    let trigger = PeriodicTrigger::new(store.clone(), Arc::new(NotifyWake::new()), clock.clone());
    let job = ImagesToPost { images: vec![1, 2] };

    let first = trigger.run_job_once(&job).await.unwrap();
    assert_eq!((first.enqueued, first.skipped), (2, 0));

    let again = trigger.run_job_once(&job).await.unwrap();
    assert_eq!((again.enqueued, again.skipped), (0, 2));

    // Once an entity's task finishes, the next scan may enqueue it again.
    let claimed = store.claim_next("w", clock.now_ms()).unwrap().unwrap();
    store.complete(claimed.id, "w", None, clock.now_ms()).unwrap();
    let after = trigger.run_job_once(&job).await.unwrap();
    assert_eq!((after.enqueued, after.skipped), (1, 1));

    let pending = store.list(&TaskFilter::pending()).unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|t| t.owner.as_deref() == Some("gus")));
}

#[tokio::test]
async fn periodic_items_take_their_type_ceiling() {
    let store = Arc::new(MemoryStore::new());
    let patient = RetryPolicy {
        max_attempts: 5,
        ..RetryPolicy::default()
    };
    let trigger = PeriodicTrigger::new(
        store.clone(),
        Arc::new(NotifyWake::new()),
        Arc::new(ManualClock::new(START)),
    )
    .with_policies(RetryPolicies::default().with_type("publish", patient));

    trigger
        .run_job_once(&ImagesToPost { images: vec![3] })
        .await
        .unwrap();
    let pending = store.list(&TaskFilter::pending()).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].max_attempts, 5);
}

#[tokio::test]
async fn spawned_trigger_stops_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let trigger = PeriodicTrigger::new(
        store.clone(),
        Arc::new(NotifyWake::new()),
        Arc::new(SystemClock),
    );
    let (tx, rx) = tokio::sync::watch::channel(false);
    let job = Arc::new(ImagesToPost { images: vec![9] });
    let task = trigger.spawn(
        ScheduleDefinition::new("images", Duration::from_millis(10), job),
        rx,
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.list(&TaskFilter::pending()).unwrap().len(), 1);
}

#[tokio::test]
async fn housekeeper_releases_tasks_of_lost_workers() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(START));
    let keeper = Housekeeper::new(store.clone(), clock.clone(), HousekeepingSettings::default());

    let stuck = store.insert(NewTask::new("publish", json!({})), START).unwrap();
    store.claim_next("crashed-worker", START).unwrap().unwrap();

    clock.advance(Duration::from_secs(5 * 60));
    assert_eq!(keeper.run_once().unwrap().recovered, 0);

    clock.advance(Duration::from_secs(11 * 60));
    let report = keeper.run_once().unwrap();
    assert_eq!(report.recovered, 1);

    let task = store.get(stuck).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.last_error.as_deref(), Some(WORKER_LOST_ERROR));
    assert!(task.claimed_by.is_none());
    assert_eq!(
        store.claim_next("w2", clock.now_ms()).unwrap().unwrap().id,
        stuck
    );
}

#[tokio::test]
async fn lost_worker_on_last_attempt_notifies_owner() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(START));
    let keeper = Housekeeper::new(store.clone(), clock.clone(), HousekeepingSettings::default());

    let id = store
        .insert(
            NewTask::new("publish", json!({})).owner("ivy").max_attempts(1),
            START,
        )
        .unwrap();
    store.claim_next("crashed-worker", START).unwrap().unwrap();

    clock.advance(Duration::from_secs(16 * 60));
    assert_eq!(keeper.run_once().unwrap().recovered, 1);

    let task = store.get(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error.as_deref(), Some(WORKER_LOST_ERROR));

    let notes: Vec<UserNotification> = store
        .list(&TaskFilter::pending().with_type(NOTIFY_USER_TASK))
        .unwrap()
        .into_iter()
        .map(|t| serde_json::from_value(t.payload).unwrap())
        .collect();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].user, "ivy");
    assert_eq!(notes[0].task_id, id);
    assert_eq!(notes[0].category, FailureCategory::RetriesExhausted);
}
