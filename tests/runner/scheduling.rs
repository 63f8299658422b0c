use std::time::Duration;

use playrun::jobs::JobStatus;
use playrun::scheduler::TickSource;

use crate::runner_harness::{RunnerHarness, next_record, request, wait_for_file};

/// Blocks until the test drops a `release.<job id>` file into the checkout.
const GATED_PLAYBOOK: &str = "touch \"started.$JOB_ID\"\n\
while [ ! -f \"release.$JOB_ID\" ]; do sleep 0.05; done\n";

#[tokio::test]
async fn second_job_of_a_template_waits_for_the_first() {
    let h = RunnerHarness::new(GATED_PLAYBOOK);
    let (scheduler, mut results, _) = h.start(TickSource::Manual);

    scheduler.submit(request("a", "deploy", false));
    scheduler.submit(request("b", "deploy", false));
    scheduler.tick().await;
    wait_for_file(&h.project_dir().join("started.a")).await;

    scheduler.tick().await;
    let snapshot = scheduler.snapshot().await;
    assert_eq!(snapshot.running, vec!["a"]);
    assert_eq!(snapshot.queued, vec!["b"]);
    assert!(!h.project_dir().join("started.b").exists());

    std::fs::write(h.project_dir().join("release.a"), "").unwrap();
    let first = next_record(&mut results).await;
    assert_eq!(first.id, "a");
    assert_eq!(first.status, JobStatus::Successful);

    // The completion guard deregisters "a" before the next tick is handled.
    scheduler.tick().await;
    wait_for_file(&h.project_dir().join("started.b")).await;
    std::fs::write(h.project_dir().join("release.b"), "").unwrap();
    let second = next_record(&mut results).await;
    assert_eq!(second.id, "b");
    assert_eq!(second.status, JobStatus::Successful);
}

#[tokio::test]
async fn simultaneous_template_runs_side_by_side() {
    let h = RunnerHarness::new(GATED_PLAYBOOK);
    let (scheduler, mut results, _) = h.start(TickSource::Manual);

    scheduler.submit(request("a", "deploy", true));
    scheduler.submit(request("b", "deploy", true));
    wait_for_file(&h.project_dir().join("started.a")).await;
    wait_for_file(&h.project_dir().join("started.b")).await;
    assert_eq!(scheduler.snapshot().await.running, vec!["a", "b"]);

    std::fs::write(h.project_dir().join("release.a"), "").unwrap();
    std::fs::write(h.project_dir().join("release.b"), "").unwrap();
    let mut finished = vec![
        next_record(&mut results).await.id,
        next_record(&mut results).await.id,
    ];
    finished.sort();
    assert_eq!(finished, vec!["a", "b"]);
}

#[tokio::test]
async fn interval_ticks_keep_queue_order() {
    let h = RunnerHarness::new(GATED_PLAYBOOK);
    let (scheduler, mut results, store) =
        h.start(TickSource::Interval(Duration::from_millis(20)));

    scheduler.submit(request("a", "deploy", false));
    scheduler.submit(request("b", "deploy", false));
    scheduler.submit(request("c", "backup", false));
    wait_for_file(&h.project_dir().join("started.a")).await;

    // "c" could run now, but it sits behind the blocked "b".
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(scheduler.snapshot().await.queued, vec!["b", "c"]);
    assert!(!h.project_dir().join("started.c").exists());

    std::fs::write(h.project_dir().join("release.a"), "").unwrap();
    wait_for_file(&h.project_dir().join("started.b")).await;
    wait_for_file(&h.project_dir().join("started.c")).await;
    std::fs::write(h.project_dir().join("release.b"), "").unwrap();
    std::fs::write(h.project_dir().join("release.c"), "").unwrap();

    for _ in 0..3 {
        let record = next_record(&mut results).await;
        assert_eq!(record.status, JobStatus::Successful, "{}", record.explanation);
    }
    assert_eq!(store.load("c").unwrap().status, JobStatus::Successful);
}

#[tokio::test]
async fn canceling_a_running_job_kills_the_playbook() {
    let h = RunnerHarness::new("touch \"started.$JOB_ID\"\nexec sleep 30\n");
    let (scheduler, mut results, store) = h.start(TickSource::Manual);

    scheduler.submit(request("a", "deploy", true));
    wait_for_file(&h.project_dir().join("started.a")).await;

    assert!(scheduler.cancel("a").await);
    assert!(!scheduler.can_cancel("a").await);

    let record = next_record(&mut results).await;
    assert_eq!(record.status, JobStatus::Canceled);
    assert_eq!(store.load("a").unwrap().status, JobStatus::Canceled);
}

#[tokio::test]
async fn canceling_a_queued_job_never_starts_it() {
    let h = RunnerHarness::new(GATED_PLAYBOOK);
    let (scheduler, mut results, store) = h.start(TickSource::Manual);

    scheduler.submit(request("a", "deploy", false));
    scheduler.tick().await;
    scheduler.submit(request("b", "deploy", false));
    wait_for_file(&h.project_dir().join("started.a")).await;

    assert!(scheduler.cancel("b").await);
    std::fs::write(h.project_dir().join("release.a"), "").unwrap();
    assert_eq!(next_record(&mut results).await.id, "a");
    scheduler.tick().await;

    assert!(scheduler.snapshot().await.running.is_empty());
    assert!(!h.project_dir().join("started.b").exists());
    assert_eq!(store.load("b").unwrap().status, JobStatus::Canceled);
}

#[tokio::test]
async fn unknown_job_cannot_be_canceled() {
    let h = RunnerHarness::new("exit 0\n");
    let (scheduler, _, _) = h.start(TickSource::Manual);
    assert!(!scheduler.cancel("missing").await);
    assert!(!scheduler.can_cancel("missing").await);
}
