//! Lease service behaviour: batched renewal, return-instead-of-renew for
//! rejected jobs, teardown of lost leases, finalization of finished jobs.


use std::sync::Arc;
use std::time::Duration;

use test_harness::{
    create_batch_pod_for_job_set, make_context, pod_job_id, set_phase, submit_pod_with_wait,
    FakeAction, FakeClusterApi, FakeQueueApi, RecordingEventSink,
};

use convoy_executor::context::ClusterContext;
use convoy_executor::job::ClusterJobContext;
use convoy_executor::service::JobLeaseService;

const REPEAT_PERIOD: Duration = Duration::from_secs(120);

struct Setup {
    api: FakeClusterApi,
    context: Arc<convoy_executor::context::KubeClusterContext>,
    job_context: Arc<ClusterJobContext>,
    queue: FakeQueueApi,
    events: RecordingEventSink,
    service: JobLeaseService,
}

async fn setup(minimum_pod_age: Duration, failed_pod_expiry: Duration) -> Setup {
    let api = FakeClusterApi::new();
    let context = Arc::new(make_context(&api, REPEAT_PERIOD).await);
    let job_context = Arc::new(ClusterJobContext::new(context.clone()));
    let queue = FakeQueueApi::new();
    let events = RecordingEventSink::new();
    let service = JobLeaseService::new(
        "cluster-1",
        context.clone(),
        job_context.clone(),
        Arc::new(queue.clone()),
        Arc::new(events.clone()),
        minimum_pod_age,
        failed_pod_expiry,
    );
    Setup {
        api,
        context,
        job_context,
        queue,
        events,
        service,
    }
}

#[tokio::test]
async fn test_active_leases_renew_in_one_batched_call() {
    let setup = setup(Duration::from_secs(60), Duration::from_secs(60)).await;

    let mut first = create_batch_pod_for_job_set("queue-a", "set-1");
    set_phase(&mut first, "Running");
    let mut second = create_batch_pod_for_job_set("queue-a", "set-1");
    set_phase(&mut second, "Running");
    submit_pod_with_wait(&setup.context, &first).await;
    submit_pod_with_wait(&setup.context, &second).await;

    setup.service.manage_job_leases().await.unwrap();

    let renewals = setup.queue.renew_requests();
    assert_eq!(renewals.len(), 1);
    let mut renewed = renewals[0].clone();
    renewed.sort();
    let mut expected = vec![pod_job_id(&first), pod_job_id(&second)];
    expected.sort();
    assert_eq!(renewed, expected);
}

#[tokio::test]
async fn test_rejected_jobs_are_returned_not_renewed() {
    let setup = setup(Duration::from_secs(60), Duration::from_secs(60)).await;

    let mut pod = create_batch_pod_for_job_set("queue-a", "set-1");
    set_phase(&mut pod, "Pending");
    let job = pod_job_id(&pod);
    submit_pod_with_wait(&setup.context, &pod).await;

    setup
        .job_context
        .register_submission_failure(&job, "admission refused");

    setup.service.manage_job_leases().await.unwrap();

    assert_eq!(
        setup.queue.returned_leases(),
        vec![(job.clone(), "admission refused".to_string())]
    );
    for renewal in setup.queue.renew_requests() {
        assert!(!renewal.contains(&job));
    }
}

#[tokio::test]
async fn test_return_lease_failure_is_retried_next_tick() {
    let setup = setup(Duration::from_secs(60), Duration::from_secs(60)).await;

    setup
        .job_context
        .register_submission_failure("job-x", "quota");
    setup.queue.fail_next_return();

    setup.service.manage_job_leases().await.unwrap();
    assert!(setup.queue.returned_leases().is_empty());

    setup.service.manage_job_leases().await.unwrap();
    assert_eq!(
        setup.queue.returned_leases(),
        vec![("job-x".to_string(), "quota".to_string())]
    );
}

#[tokio::test]
async fn test_lost_lease_tears_the_job_down() {
    let setup = setup(Duration::from_secs(60), Duration::from_secs(60)).await;

    let mut kept = create_batch_pod_for_job_set("queue-a", "set-1");
    set_phase(&mut kept, "Running");
    let mut lost = create_batch_pod_for_job_set("queue-a", "set-1");
    set_phase(&mut lost, "Running");
    submit_pod_with_wait(&setup.context, &kept).await;
    let lost_pod = submit_pod_with_wait(&setup.context, &lost).await;

    setup.queue.set_renew_response(vec![pod_job_id(&kept)]);

    setup.service.manage_job_leases().await.unwrap();

    assert!(setup
        .events
        .variant_names()
        .contains(&"lease_expired"));

    setup.api.clear_actions();
    setup.context.process_pods_to_delete().await.unwrap();
    assert!(setup
        .api
        .actions()
        .contains(&FakeAction::Delete(lost_pod.metadata.name.clone().unwrap())));
}

#[tokio::test]
async fn test_finished_jobs_are_finalized_once_old_enough() {
    let setup = setup(Duration::ZERO, Duration::ZERO).await;

    let mut pod = create_batch_pod_for_job_set("queue-a", "set-1");
    set_phase(&mut pod, "Succeeded");
    let job = pod_job_id(&pod);
    let pod = submit_pod_with_wait(&setup.context, &pod).await;

    setup.service.manage_job_leases().await.unwrap();

    assert_eq!(setup.queue.reported_done(), vec![vec![job]]);

    setup.api.clear_actions();
    setup.context.process_pods_to_delete().await.unwrap();
    assert!(setup
        .api
        .actions()
        .contains(&FakeAction::Delete(pod.metadata.name.clone().unwrap())));
}

#[tokio::test]
async fn test_fresh_finished_jobs_are_left_alone() {
    let setup = setup(Duration::from_secs(3600), Duration::from_secs(3600)).await;

    let mut pod = create_batch_pod_for_job_set("queue-a", "set-1");
    set_phase(&mut pod, "Failed");
    submit_pod_with_wait(&setup.context, &pod).await;

    setup.service.manage_job_leases().await.unwrap();

    assert!(setup.queue.reported_done().is_empty());
    // A finished job is no longer renewed either.
    assert!(setup.queue.renew_requests().is_empty());
}
