//! End-to-end walkthroughs over the polls/options/votes fixtures.

use std::collections::HashMap;
use std::time::Duration;

use petrel::testutils::{ALICE_TOKEN, BOB_TOKEN};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};

use crate::{test_petrel, TestPetrel};

const POLLS: &str = "/api/collections/polls/records";
const OPTIONS: &str = "/api/collections/options/records";
const VOTES: &str = "/api/collections/votes/records";

/// A poll owned by alice with "Yes" and "No" options; returns the poll id
/// and the option ids.
async fn create_poll(petrel: &TestPetrel) -> (String, i64, i64) {
    let (status, poll) = petrel
        .post(
            POLLS,
            ALICE_TOKEN,
            json!({"owner_id": "alice", "question": "Pizza on Friday?"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(poll["is_closed"], false);
    let poll_id = poll["id"].as_str().unwrap().to_string();

    let mut options = vec![];
    for label in ["Yes", "No"] {
        let (status, option) = petrel
            .post(
                OPTIONS,
                ALICE_TOKEN,
                json!({"poll_id": poll_id, "label": label}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        options.push(option["id"].as_i64().unwrap());
    }
    (poll_id, options[0], options[1])
}

fn vote(poll_id: &str, option_id: i64, user_id: &str) -> JsonValue {
    json!({"poll_id": poll_id, "option_id": option_id, "user_id": user_id})
}

#[tokio::test]
async fn test_scenario_a_tally_votes() {
    let petrel = test_petrel().await;
    let (poll_id, yes, no) = create_poll(&petrel).await;

    let (status, _) = petrel.post(VOTES, ALICE_TOKEN, vote(&poll_id, yes, "alice")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = petrel.post(VOTES, BOB_TOKEN, vote(&poll_id, no, "bob")).await;
    assert_eq!(status, StatusCode::OK);

    let filter = format!("poll_id = '{poll_id}'");
    let response = petrel
        .client
        .get(petrel.url(VOTES))
        .query(&[("filter", filter.as_str())])
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: JsonValue = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
    assert_eq!(body["totalItems"], 2);

    let items = body["items"].as_array().unwrap();
    let mut tally: HashMap<i64, usize> = HashMap::new();
    for item in items {
        *tally.entry(item["option_id"].as_i64().unwrap()).or_default() += 1;
    }
    let total = items.len() as f64;
    assert_eq!(tally[&yes], 1);
    assert_eq!(tally[&no], 1);
    assert_eq!(tally[&yes] as f64 / total * 100.0, 50.0);
    assert_eq!(tally[&no] as f64 / total * 100.0, 50.0);
}

#[tokio::test]
async fn test_scenario_b_close_poll_is_streamed() {
    let petrel = test_petrel().await;
    let (poll_id, _, _) = create_poll(&petrel).await;
    let (other_id, _, _) = create_poll(&petrel).await;

    let filter = format!("id = '{poll_id}'");
    let mut stream = petrel
        .subscribe("polls", Some(&filter), Some(BOB_TOKEN))
        .await;

    // Not the poll we're watching
    let (status, _) = petrel
        .patch(
            &format!("{POLLS}/{other_id}"),
            ALICE_TOKEN,
            json!({"is_closed": true}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = petrel
        .patch(
            &format!("{POLLS}/{poll_id}"),
            ALICE_TOKEN,
            json!({"is_closed": true}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let event = stream
        .next_event_within(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(event.event, "message");
    assert_eq!(event.data["action"], "update");
    assert_eq!(event.data["id"], poll_id);
    assert_eq!(event.data["record"]["is_closed"], true);

    // Exactly one
    assert!(stream
        .next_event_within(Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn test_scenario_c_non_owner_update_is_forbidden() {
    let petrel = test_petrel().await;
    let (poll_id, _, _) = create_poll(&petrel).await;
    let path = format!("{POLLS}/{poll_id}");

    let (status, body) = petrel
        .patch(&path, BOB_TOKEN, json!({"question": "Salad on Friday?"}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (_, poll) = petrel.get(&path, Some(BOB_TOKEN)).await;
    assert_eq!(poll["question"], "Pizza on Friday?");
}

#[tokio::test]
async fn test_scenario_d_malformed_filter() {
    let petrel = test_petrel().await;

    let response = petrel
        .client
        .get(petrel.url(POLLS))
        .query(&[("filter", "status#invalid")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: JsonValue = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
    assert_eq!(body["code"], "filter_error");
}

#[tokio::test]
async fn test_scenario_e_concurrent_duplicate_votes() {
    let petrel = test_petrel().await;
    let (poll_id, yes, no) = create_poll(&petrel).await;

    let (first, second) = tokio::join!(
        petrel.post(VOTES, ALICE_TOKEN, vote(&poll_id, yes, "alice")),
        petrel.post(VOTES, ALICE_TOKEN, vote(&poll_id, no, "alice")),
    );

    let mut statuses = vec![first.0, second.0];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);

    let conflict = if first.0 == StatusCode::CONFLICT {
        first.1
    } else {
        second.1
    };
    assert_eq!(conflict["code"], "conflict");
}
