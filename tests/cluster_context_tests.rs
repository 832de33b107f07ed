//! Cluster context behaviour against a scripted cluster fake: submission,
//! transient deduplication, staged deletion rate limiting, annotation
//! patching.


use std::collections::HashSet;
use std::time::Duration;

use test_harness::{
    assert_eventually, create_batch_pod, create_pod, make_context, pod_job_id,
    submit_pod_with_wait, FakeAction, FakeClusterApi, Reaction,
};

use convoy_executor::context::ClusterContext;
use convoy_executor::util::pod::extract_names;

const DEFAULT_REPEAT_PERIOD: Duration = Duration::from_secs(120);

/// Wait until the informer itself (not the submitted-pods cache) holds `pod`.
async fn wait_for_informer_pod(
    context: &convoy_executor::context::KubeClusterContext,
    pod: &k8s_openapi::api::core::v1::Pod,
) {
    let name = pod.metadata.name.clone().unwrap();
    assert_eventually(
        || async {
            extract_names(&context.get_all_pods()).contains(&name)
                && context.submitted_pods().get(&pod_job_id(pod)).is_none()
        },
        Duration::from_secs(2),
        "pod never reached the informer cache",
    )
    .await;
}

#[tokio::test]
async fn test_submit_pod_issues_one_create_call() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    let pod = create_batch_pod();
    api.clear_actions();

    let created = context.submit_pod(&pod, "user1").await.unwrap();
    assert_eq!(created, pod);

    let actions = api.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(
        actions[0],
        FakeAction::Create(pod.metadata.name.clone().unwrap())
    );
}

#[tokio::test]
async fn test_submit_pod_is_visible_in_get_all_pods_immediately() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    let pod = create_batch_pod();
    context.submit_pod(&pod, "user1").await.unwrap();

    let names = extract_names(&context.get_all_pods());
    assert!(names.contains(pod.metadata.name.as_ref().unwrap()));
}

#[tokio::test]
async fn test_submit_pod_uses_user_specific_client() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    context
        .submit_pod(&create_batch_pod(), "alice")
        .await
        .unwrap();
    assert!(api.users().contains(&"alice".to_string()));
}

#[tokio::test]
async fn test_process_pods_to_delete_without_staged_pods_makes_no_calls() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    api.clear_actions();
    context.process_pods_to_delete().await.unwrap();
    assert!(api.actions().is_empty());
}

#[tokio::test]
async fn test_process_pods_to_delete_calls_delete_for_staged_pod() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;
    let pod = submit_pod_with_wait(&context, &create_batch_pod()).await;

    api.clear_actions();
    context.delete_pods(vec![pod.clone()]);
    context.process_pods_to_delete().await.unwrap();

    let actions = api.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(
        actions[0],
        FakeAction::Delete(pod.metadata.name.clone().unwrap())
    );
}

#[tokio::test]
async fn test_repeated_delete_is_suppressed_after_success() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;
    let pod = submit_pod_with_wait(&context, &create_batch_pod()).await;

    api.clear_actions();
    context.delete_pods(vec![pod.clone()]);
    context.process_pods_to_delete().await.unwrap();
    assert_eq!(api.actions().len(), 1);

    api.clear_actions();
    context.delete_pods(vec![pod]);
    context.process_pods_to_delete().await.unwrap();
    assert_eq!(api.actions().len(), 0);
}

#[tokio::test]
async fn test_repeated_delete_is_suppressed_after_not_found() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;
    let pod = submit_pod_with_wait(&context, &create_batch_pod()).await;

    api.react_on_delete(Reaction::NotFound);

    api.clear_actions();
    context.delete_pods(vec![pod.clone()]);
    context.process_pods_to_delete().await.unwrap();
    assert_eq!(api.actions().len(), 1);

    api.clear_actions();
    context.delete_pods(vec![pod]);
    context.process_pods_to_delete().await.unwrap();
    assert_eq!(api.actions().len(), 0);
}

#[tokio::test]
async fn test_delete_is_retried_after_server_error() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;
    let pod = submit_pod_with_wait(&context, &create_batch_pod()).await;

    api.react_on_delete(Reaction::ServerError);

    api.clear_actions();
    context.delete_pods(vec![pod.clone()]);
    context.process_pods_to_delete().await.unwrap();
    assert_eq!(api.actions().len(), 1);

    api.clear_actions();
    context.delete_pods(vec![pod]);
    context.process_pods_to_delete().await.unwrap();
    assert_eq!(api.actions().len(), 1);
}

#[tokio::test]
async fn test_delete_repeats_after_minimum_period_has_passed() {
    let repeat_period = Duration::from_millis(500);
    let api = FakeClusterApi::new();
    let context = make_context(&api, repeat_period).await;
    let pod = submit_pod_with_wait(&context, &create_batch_pod()).await;

    api.clear_actions();
    context.delete_pods(vec![pod.clone()]);
    context.process_pods_to_delete().await.unwrap();
    assert_eq!(api.actions().len(), 1);

    tokio::time::sleep(repeat_period + Duration::from_millis(200)).await;

    api.clear_actions();
    context.delete_pods(vec![pod]);
    context.process_pods_to_delete().await.unwrap();
    assert_eq!(api.actions().len(), 1);
}

#[tokio::test]
async fn test_add_annotation_patches_the_pod() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;
    let pod = submit_pod_with_wait(&context, &create_batch_pod()).await;

    let annotations = [("test".to_string(), "annotation".to_string())].into();
    context.add_annotation(&pod, &annotations).await.unwrap();

    assert_eventually(
        || async {
            context.get_active_batch_pods().iter().any(|pod| {
                pod.metadata
                    .annotations
                    .as_ref()
                    .map(|annotations| annotations.get("test") == Some(&"annotation".to_string()))
                    .unwrap_or(false)
            })
        },
        Duration::from_secs(2),
        "annotation never became visible through the informer",
    )
    .await;
}

#[tokio::test]
async fn test_add_annotation_surfaces_client_errors() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;
    let pod = submit_pod_with_wait(&context, &create_batch_pod()).await;

    api.react_on_patch(Reaction::ServerError);
    let annotations = [("test".to_string(), "\\".to_string())].into();
    assert!(context.add_annotation(&pod, &annotations).await.is_err());
}

#[tokio::test]
async fn test_get_all_pods_includes_transient_submissions() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    let non_batch_pod = create_pod();
    let batch_pod = create_batch_pod();
    context.submit_pod(&non_batch_pod, "user").await.unwrap();
    submit_pod_with_wait(&context, &batch_pod).await;
    wait_for_informer_pod(&context, &non_batch_pod).await;

    // Halting the informers prevents newly submitted pods being observed.
    context.stop();
    let transient_pod = create_batch_pod();
    context.submit_pod(&transient_pod, "user").await.unwrap();

    let all_pods = context.get_all_pods();
    assert_eq!(all_pods.len(), 3);

    let names: HashSet<String> = extract_names(&all_pods).into_iter().collect();
    assert!(names.contains(non_batch_pod.metadata.name.as_ref().unwrap()));
    assert!(names.contains(batch_pod.metadata.name.as_ref().unwrap()));
    assert!(names.contains(transient_pod.metadata.name.as_ref().unwrap()));
}

#[tokio::test]
async fn test_get_all_pods_deduplicates_transient_pods() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;
    let pod = submit_pod_with_wait(&context, &create_batch_pod()).await;

    // Forcibly add the pod back, so it exists in the cluster and the cache.
    context.submitted_pods().add(&pod);

    let all_pods = context.get_all_pods();
    assert_eq!(all_pods.len(), 1);
    assert_eq!(
        extract_names(&all_pods),
        vec![pod.metadata.name.clone().unwrap()]
    );
}

#[tokio::test]
async fn test_get_batch_pods_filters_unlabelled_pods_and_keeps_transient() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    let non_batch_pod = create_pod();
    let batch_pod = create_batch_pod();
    context.submit_pod(&non_batch_pod, "user").await.unwrap();
    submit_pod_with_wait(&context, &batch_pod).await;
    wait_for_informer_pod(&context, &non_batch_pod).await;

    context.stop();
    let transient_pod = create_batch_pod();
    context.submit_pod(&transient_pod, "user").await.unwrap();

    let batch_pods = context.get_batch_pods();
    assert_eq!(batch_pods.len(), 2);

    let names: HashSet<String> = extract_names(&batch_pods).into_iter().collect();
    assert!(names.contains(batch_pod.metadata.name.as_ref().unwrap()));
    assert!(names.contains(transient_pod.metadata.name.as_ref().unwrap()));
}

#[tokio::test]
async fn test_get_batch_pods_is_subset_of_get_all_pods() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    context.submit_pod(&create_pod(), "user").await.unwrap();
    submit_pod_with_wait(&context, &create_batch_pod()).await;

    let all_names: HashSet<String> = extract_names(&context.get_all_pods()).into_iter().collect();
    let batch_names: HashSet<String> = extract_names(&context.get_batch_pods())
        .into_iter()
        .collect();
    let active_names: HashSet<String> = extract_names(&context.get_active_batch_pods())
        .into_iter()
        .collect();

    assert!(batch_names.is_subset(&all_names));
    assert!(active_names.is_subset(&batch_names));
}

#[tokio::test]
async fn test_failed_submission_leaves_no_transient_pod() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    api.react_on_create(Reaction::ServerError);
    let result = context.submit_pod(&create_batch_pod(), "user").await;
    assert!(result.is_err());

    assert!(context.get_batch_pods().is_empty());
    assert!(context.submitted_pods().is_empty());
}

#[tokio::test]
async fn test_get_active_batch_pods_excludes_transient() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    let batch_pod = create_batch_pod();
    context.submit_pod(&create_pod(), "user").await.unwrap();
    submit_pod_with_wait(&context, &batch_pod).await;

    context.stop();
    let transient_pod = create_batch_pod();
    context.submit_pod(&transient_pod, "user").await.unwrap();

    let active = context.get_active_batch_pods();
    assert_eq!(active.len(), 1);
    assert_eq!(
        extract_names(&active),
        vec![batch_pod.metadata.name.clone().unwrap()]
    );
}

#[tokio::test]
async fn test_get_nodes_returns_informer_cached_nodes() {
    let api = FakeClusterApi::new();

    let mut node = k8s_openapi::api::core::v1::Node::default();
    node.metadata.name = Some("node-1".to_string());
    api.set_nodes(vec![node]);

    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    assert_eventually(
        || async {
            let nodes = context.get_nodes();
            nodes.len() == 1 && nodes[0].metadata.name.as_deref() == Some("node-1")
        },
        Duration::from_secs(2),
        "node never appeared through the informer",
    )
    .await;
}

#[tokio::test]
async fn test_informer_observation_evicts_submitted_cache_entry() {
    let api = FakeClusterApi::new();
    let context = make_context(&api, DEFAULT_REPEAT_PERIOD).await;

    let pod = create_batch_pod();
    let job = pod_job_id(&pod);
    context.submit_pod(&pod, "user").await.unwrap();

    assert_eventually(
        || async { context.submitted_pods().get(&job).is_none() },
        Duration::from_secs(2),
        "informer observation did not evict the transient entry",
    )
    .await;

    // Still exactly one pod visible after eviction.
    assert_eq!(context.get_all_pods().len(), 1);
}
