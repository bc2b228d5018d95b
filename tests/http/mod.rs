use std::collections::HashSet;

use petrel::testutils::{ADMIN_TOKEN, ALICE_TOKEN, BOB_TOKEN};
use reqwest::{Method, StatusCode};
use serde_json::json;

use crate::test_petrel;

const NOTES: &str = "/api/collections/notes/records";

#[tokio::test]
async fn test_health_and_cors() {
    let petrel = test_petrel().await;

    let (status, body) = petrel.get("/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"code": 200, "message": "API is healthy."}));

    let response = petrel
        .client
        .request(Method::OPTIONS, petrel.url(NOTES))
        .header("Origin", "https://app.example.com")
        .header("Access-Control-Request-Method", "PATCH")
        .header("Access-Control-Request-Headers", "authorization")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://app.example.com"
    );
}

#[tokio::test]
async fn test_record_lifecycle() {
    let petrel = test_petrel().await;

    let (status, created) = petrel
        .post(
            NOTES,
            ALICE_TOKEN,
            json!({"owner_id": "alice", "body": "draft", "meta": {"tags": ["x"]}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["meta"], json!({"tags": ["x"]}));
    let path = format!("{NOTES}/{}", created["id"]);

    let (status, fetched) = petrel.get(&path, Some(ALICE_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);

    let (status, updated) = petrel
        .patch(&path, ALICE_TOKEN, json!({"body": "final", "is_public": true}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["body"], "final");

    // Now public, so anyone can read it
    let (status, fetched) = petrel.get(&path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, updated);

    let (status, _) = petrel
        .request(Method::DELETE, &path, Some(ALICE_TOKEN), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = petrel.get(&path, Some(ALICE_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_pagination_is_complete_and_ordered() {
    let petrel = test_petrel().await;

    // Duplicate scores so that the primary key tie-break matters
    let scores = [3, 1, 2, 3, 1, 2, 3];
    for score in scores {
        let (status, _) = petrel
            .post(
                NOTES,
                ALICE_TOKEN,
                json!({"owner_id": "alice", "score": score, "is_public": true}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let mut seen = vec![];
    let mut page = 1;
    loop {
        let (status, body) = petrel
            .get(
                &format!("{NOTES}?sort=-score&perPage=3&page={page}&filter=score%20%3E%3D%202"),
                Some(BOB_TOKEN),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalItems"], 5);
        assert_eq!(body["totalPages"], 2);

        let items = body["items"].as_array().unwrap();
        if items.is_empty() {
            break;
        }
        seen.extend(
            items
                .iter()
                .map(|item| (item["score"].as_i64().unwrap(), item["id"].as_i64().unwrap())),
        );
        page += 1;
    }

    assert_eq!(seen.len(), 5);
    assert_eq!(seen.iter().map(|(_, id)| id).collect::<HashSet<_>>().len(), 5);
    // Score descending, then id ascending
    assert_eq!(seen, vec![(3, 1), (3, 4), (3, 7), (2, 3), (2, 6)]);
}

#[tokio::test]
async fn test_list_is_idempotent() {
    let petrel = test_petrel().await;
    for body in ["a", "b"] {
        petrel
            .post(NOTES, ALICE_TOKEN, json!({"owner_id": "alice", "body": body}))
            .await;
    }

    let path = format!("{NOTES}?sort=body");
    let (_, first) = petrel.get(&path, Some(ALICE_TOKEN)).await;
    let (_, second) = petrel.get(&path, Some(ALICE_TOKEN)).await;
    assert_eq!(first["totalItems"], 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_error_envelopes() {
    let petrel = test_petrel().await;

    let (status, body) = petrel.get(&format!("{NOTES}?perPage=1000"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({"code": "filter_error", "message": "perPage exceeds maximum of 500"})
    );

    let (status, body) = petrel.get(&format!("{NOTES}?sort=meta"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "filter_error");

    let (status, body) = petrel
        .post(
            "/api/collections/polls/records",
            ALICE_TOKEN,
            json!({"owner_id": "alice"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["data"], json!({"field": "question"}));

    let (status, body) = petrel.get(NOTES, Some("not-a-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    // Tables the catalog skipped are simply not there
    for table in ["attachments", "pairs", "_petrel_sequences"] {
        let (status, _) = petrel
            .get(&format!("/api/collections/{table}/records"), Some(ADMIN_TOKEN))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
