use std::time::Duration;

use petrel::testutils::{ALICE_TOKEN, BOB_TOKEN};
use reqwest::StatusCode;
use serde_json::json;

use crate::test_petrel;

const NOTES: &str = "/api/collections/notes/records";
const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_events_respect_read_policy() {
    let petrel = test_petrel().await;
    let mut bob = petrel.subscribe("notes", None, Some(BOB_TOKEN)).await;

    petrel
        .post(NOTES, ALICE_TOKEN, json!({"owner_id": "alice", "body": "private"}))
        .await;
    let (_, public) = petrel
        .post(
            NOTES,
            ALICE_TOKEN,
            json!({"owner_id": "alice", "body": "public", "is_public": true}),
        )
        .await;

    let event = bob.next_event_within(WAIT).await.unwrap();
    assert_eq!(event.event, "message");
    assert_eq!(event.data["table"], "notes");
    assert_eq!(event.data["action"], "create");
    assert_eq!(event.data["record"], public);
    assert_eq!(event.data["id"], public["id"]);
    // The private note took sequence 1
    assert_eq!(event.data["sequence"], 2);
    assert!(event.data["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_events_are_ordered_and_filtered() {
    let petrel = test_petrel().await;
    let mut alice = petrel
        .subscribe("notes", Some("score >= 10"), Some(ALICE_TOKEN))
        .await;

    for score in [5, 10, 20, 1, 30] {
        let (status, _) = petrel
            .post(NOTES, ALICE_TOKEN, json!({"owner_id": "alice", "score": score}))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let mut sequences = vec![];
    let mut scores = vec![];
    for _ in 0..3 {
        let event = alice.next_event_within(WAIT).await.unwrap();
        sequences.push(event.data["sequence"].as_i64().unwrap());
        scores.push(event.data["record"]["score"].as_i64().unwrap());
    }
    assert_eq!(scores, vec![10, 20, 30]);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_failed_writes_publish_nothing() {
    let petrel = test_petrel().await;
    let mut alice = petrel.subscribe("notes", None, Some(ALICE_TOKEN)).await;

    // Forged owner: inserted, fails the create policy, rolled back
    let (status, _) = petrel
        .post(NOTES, BOB_TOKEN, json!({"owner_id": "alice", "body": "forged"}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert!(alice
        .next_event_within(Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn test_disconnect_unsubscribes() {
    let petrel = test_petrel().await;
    let client = petrel.subscribe("notes", None, Some(ALICE_TOKEN)).await;
    assert_eq!(petrel.engine.bus().subscriber_count("notes"), 1);

    drop(client);

    // The server notices once it tries to write to the closed connection
    let mut remaining = None;
    for _ in 0..40 {
        petrel
            .post(NOTES, ALICE_TOKEN, json!({"owner_id": "alice"}))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        remaining = Some(petrel.engine.bus().subscriber_count("notes"));
        if remaining == Some(0) {
            break;
        }
    }
    assert_eq!(remaining, Some(0));
}

#[tokio::test]
async fn test_subscribe_errors() {
    let petrel = test_petrel().await;

    let response = petrel
        .client
        .get(petrel.url("/api/realtime"))
        .query(&[("table", "notes"), ("filter", "status#invalid")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = petrel
        .client
        .get(petrel.url("/api/realtime"))
        .query(&[("table", "attachments")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
