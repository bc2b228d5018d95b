// Single main.rs for all integration tests
// https://endler.dev/2020/rust-compile-times/#combine-all-integration-tests-in-a-single-binary

use std::net::SocketAddr;
use std::time::Duration;

use petrel::engine::RecordsEngine;
use petrel::frontend::http::filters;
use petrel::testutils::make_test_context;
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use tempfile::TempDir;

mod http;
mod policy_property;
mod realtime;
mod scenarios;

/// A petrel HTTP frontend served in-process on a free port, over a fresh
/// copy of the fixture database.
struct TestPetrel {
    addr: SocketAddr,
    client: reqwest::Client,
    engine: RecordsEngine,
    _dir: TempDir,
}

async fn test_petrel() -> TestPetrel {
    let (context, dir) = make_test_context().await;
    let engine = context.engine.clone();

    let (addr, server) = warp::serve(filters(context)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    TestPetrel {
        addr,
        client: reqwest::Client::new(),
        engine,
        _dir: dir,
    }
}

impl TestPetrel {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Send a request and decode the (possibly empty) JSON response.
    async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<JsonValue>,
    ) -> (StatusCode, JsonValue) {
        let mut request = self.client.request(method, self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body.to_string());
        }

        let response = request.send().await.unwrap();
        let status = response.status();
        let bytes = response.bytes().await.unwrap();
        let json = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, JsonValue) {
        self.request(Method::GET, path, token, None).await
    }

    async fn post(&self, path: &str, token: &str, body: JsonValue) -> (StatusCode, JsonValue) {
        self.request(Method::POST, path, Some(token), Some(body))
            .await
    }

    async fn patch(&self, path: &str, token: &str, body: JsonValue) -> (StatusCode, JsonValue) {
        self.request(Method::PATCH, path, Some(token), Some(body))
            .await
    }

    /// Open a realtime stream and wait for its `connect` event.
    async fn subscribe(&self, table: &str, filter: Option<&str>, token: Option<&str>) -> SseClient {
        let mut query = vec![("table", table)];
        if let Some(filter) = filter {
            query.push(("filter", filter));
        }
        let mut request = self
            .client
            .get(self.url("/api/realtime"))
            .query(&query);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let mut client = SseClient {
            response,
            buffer: String::new(),
        };
        let connect = client.next_event_within(Duration::from_secs(2)).await.unwrap();
        assert_eq!(connect.event, "connect");
        assert!(connect.data["subscriptionId"].is_string());
        client
    }
}

#[derive(Debug)]
struct SseEvent {
    event: String,
    data: JsonValue,
}

/// Minimal `text/event-stream` reader: splits frames on blank lines and
/// skips keep-alive comments.
struct SseClient {
    response: reqwest::Response,
    buffer: String,
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data = String::new();
    for line in frame.lines() {
        match line.split_once(':') {
            Some(("event", value)) => event = Some(value.trim_start().to_string()),
            Some(("data", value)) => data.push_str(value.trim_start()),
            _ => {}
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: serde_json::from_str(&data).unwrap_or(JsonValue::Null),
    })
}

impl SseClient {
    /// `None` once the server ended the stream.
    async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let frame: String = self.buffer.drain(..end + 2).collect();
                match parse_frame(&frame) {
                    Some(event) => return Some(event),
                    None => continue,
                }
            }
            let chunk = self.response.chunk().await.ok()??;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    async fn next_event_within(&mut self, timeout: Duration) -> Option<SseEvent> {
        tokio::time::timeout(timeout, self.next_event())
            .await
            .ok()
            .flatten()
    }
}
