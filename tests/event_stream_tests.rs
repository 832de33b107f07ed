//! Event stream reader behaviour: cursor tracking, malformed and unknown
//! records, reconnect-and-resume, bounded error tolerance.


use std::sync::{Arc, Mutex};

use test_harness::FakeStreamConnector;
use tokio_util::sync::CancellationToken;

use convoy_executor::api::event_stream::EventStreamReader;
use convoy_executor::reporter::EventMessage;

fn running_record(id: &str, job: &str) -> String {
    format!(
        r#"{{"result":{{"id":"{}","message":{{"running":{{"job_id":"{}","job_set_id":"set-1","queue":"queue-a","created_at":"2026-08-02T10:00:00Z"}}}}}}}}"#,
        id, job
    )
}

#[tokio::test]
async fn test_reader_skips_malformed_and_unknown_records() {
    let connector = FakeStreamConnector::new();
    connector.push_lines(&[
        &running_record("1", "job-a"),
        r#"{"result":{"id":"2","message"#,
        r#"{"result":{"id":"3","message":{"defragmented":{"job_id":"job-b"}}}}"#,
        &running_record("4", "job-c"),
    ]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_callback = seen.clone();

    let reader = EventStreamReader::new(connector, 3);
    let cursor = reader
        .run(
            "queue-a",
            "set-1",
            None,
            false,
            &CancellationToken::new(),
            move |id, event: EventMessage| {
                seen_in_callback
                    .lock()
                    .unwrap()
                    .push((id.to_string(), event.info().job_id.clone()));
            },
        )
        .await
        .unwrap();

    // The callback fired for the two valid records only, and the cursor
    // advanced past the unknown-variant record to the last id.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ("1".to_string(), "job-a".to_string()));
    assert_eq!(seen[1], ("4".to_string(), "job-c".to_string()));
    assert_eq!(cursor.as_deref(), Some("4"));
}

#[tokio::test]
async fn test_reader_ignores_blank_lines_and_error_records() {
    let connector = FakeStreamConnector::new();
    connector.push_lines(&[
        "",
        r#"{"error":"server hiccup"}"#,
        &running_record("10", "job-a"),
    ]);

    let calls = Arc::new(Mutex::new(0));
    let calls_in_callback = calls.clone();

    let reader = EventStreamReader::new(connector, 3);
    let cursor = reader
        .run(
            "queue-a",
            "set-1",
            None,
            false,
            &CancellationToken::new(),
            move |_, _| *calls_in_callback.lock().unwrap() += 1,
        )
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(cursor.as_deref(), Some("10"));
}

#[tokio::test]
async fn test_watch_mode_reconnects_resuming_from_cursor() {
    let connector = FakeStreamConnector::new();
    // First connection delivers two records then ends; the second delivers
    // one more; the third is cancelled by shutdown.
    connector.push_lines(&[&running_record("1", "job-a"), &running_record("2", "job-a")]);
    connector.push_lines(&[&running_record("3", "job-a")]);

    let shutdown = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let stop_after_three = {
        let shutdown = shutdown.clone();
        let seen = seen.clone();
        move |id: &str, _event: EventMessage| {
            seen.lock().unwrap().push(id.to_string());
            if seen.lock().unwrap().len() == 3 {
                shutdown.cancel();
            }
        }
    };

    let reader = EventStreamReader::new(connector.clone(), 3);
    let cursor = reader
        .run("queue-a", "set-1", None, true, &shutdown, stop_after_three)
        .await
        .unwrap();

    assert_eq!(cursor.as_deref(), Some("3"));
    assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3"]);

    // The second connection resumed from the highest id of the first.
    let resume_ids = connector.resume_ids();
    assert_eq!(resume_ids[0], None);
    assert_eq!(resume_ids[1].as_deref(), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn test_bounded_mode_escalates_after_consecutive_failures() {
    let connector = FakeStreamConnector::new();
    connector.push_connection(vec![Err(std::io::Error::other("reset"))]);
    connector.push_connection(vec![Err(std::io::Error::other("reset"))]);
    // Third connection attempt finds nothing scripted and fails too.

    let reader = EventStreamReader::new(connector, 2);
    let result = reader
        .run(
            "queue-a",
            "set-1",
            None,
            false,
            &CancellationToken::new(),
            |_, _| {},
        )
        .await;

    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_successful_line_resets_error_count() {
    let connector = FakeStreamConnector::new();
    // Two failures, then a good line followed by a failure, repeatedly
    // staying under the tolerance because the line read resets the counter.
    connector.push_connection(vec![Err(std::io::Error::other("reset"))]);
    connector.push_connection(vec![Err(std::io::Error::other("reset"))]);
    connector.push_connection(vec![
        Ok(running_record("5", "job-a")),
        Err(std::io::Error::other("reset")),
    ]);
    connector.push_connection(vec![Ok(running_record("6", "job-a"))]);

    let reader = EventStreamReader::new(connector, 2);
    let cursor = reader
        .run(
            "queue-a",
            "set-1",
            None,
            false,
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .unwrap();

    assert_eq!(cursor.as_deref(), Some("6"));
}
