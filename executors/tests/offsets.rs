use fixtures::*;

use relayer_executors::offsets::{CompletionCommitter, TrackOutcome};
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread")]
async fn test_commits_only_the_contiguous_done_prefix() {
    init_tracing();
    let broker = RecordingCommitter::default();
    let committer = CompletionCommitter::new(broker.clone());

    let jobs: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    for (offset, job_uuid) in jobs.iter().enumerate() {
        committer.track(0, offset as i64, *job_uuid).await;
    }

    // Out-of-order completions behind an open offset commit nothing.
    committer.complete(jobs[3]).await.unwrap();
    committer.complete(jobs[1]).await.unwrap();
    assert!(broker.commits().is_empty());

    // Closing the lowest offset walks forward over everything done.
    committer.complete(jobs[0]).await.unwrap();
    assert_eq!(broker.commits(), vec![(0, 0), (0, 1)]);

    committer.complete(jobs[2]).await.unwrap();
    assert_eq!(broker.commits(), vec![(0, 0), (0, 1), (0, 2), (0, 3)]);

    committer.complete(jobs[4]).await.unwrap();
    assert_eq!(
        broker.commits(),
        vec![(0, 0), (0, 1), (0, 2), (0, 3), (0, 4)]
    );
    assert_eq!(committer.outstanding(0).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_children_gate_the_parent_offset() {
    init_tracing();
    let broker = RecordingCommitter::default();
    let committer = CompletionCommitter::new(broker.clone());

    let parent = Uuid::new_v4();
    let child = Uuid::new_v4();
    committer.track(0, 0, parent).await;
    assert!(committer.register_child(parent, child).await);

    // The parent finished processing, but its escalation child is open.
    committer.complete(parent).await.unwrap();
    assert!(broker.commits().is_empty());

    committer.complete(child).await.unwrap();
    assert_eq!(broker.commits(), vec![(0, 0)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_of_untracked_parent_is_rejected() {
    init_tracing();
    let committer = CompletionCommitter::new(RecordingCommitter::default());
    assert!(!committer.register_child(Uuid::new_v4(), Uuid::new_v4()).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_delivery_is_detected_and_both_offsets_commit() {
    init_tracing();
    let broker = RecordingCommitter::default();
    let committer = CompletionCommitter::new(broker.clone());

    let job_uuid = Uuid::new_v4();
    assert_eq!(committer.track(0, 0, job_uuid).await, TrackOutcome::Tracked);
    assert_eq!(
        committer.track(0, 1, job_uuid).await,
        TrackOutcome::DuplicateJob
    );

    // Closing the duplicate alone cannot move past the open original.
    committer.complete_delivery(0, 1).await.unwrap();
    assert!(broker.commits().is_empty());

    // The job completing closes every offset that carried it.
    committer.complete(job_uuid).await.unwrap();
    assert_eq!(broker.commits(), vec![(0, 0), (0, 1)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partitions_commit_independently() {
    init_tracing();
    let broker = RecordingCommitter::default();
    let committer = CompletionCommitter::new(broker.clone());

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    committer.track(0, 4, a).await;
    committer.track(1, 9, b).await;

    committer.complete(b).await.unwrap();
    assert_eq!(broker.commits(), vec![(1, 9)]);

    committer.complete(a).await.unwrap();
    assert_eq!(broker.commits(), vec![(1, 9), (0, 4)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_completion_of_untracked_job_is_a_no_op() {
    init_tracing();
    let broker = RecordingCommitter::default();
    let committer = CompletionCommitter::new(broker.clone());

    let committed = committer.complete(Uuid::new_v4()).await.unwrap();
    assert!(committed.is_empty());
    assert!(broker.commits().is_empty());
}
