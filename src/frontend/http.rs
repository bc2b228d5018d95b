use std::convert::Infallible;
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::hyper::{Body, Response};
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::http_utils::{into_response, ApiError};
use crate::auth::{header_to_token, Authenticator, Principal};
use crate::config::context::PetrelContext;
use crate::config::schema::{HttpFrontend, Realtime};
use crate::engine::{RecordsEngine, RecordsError, RequestContext};
use crate::query::ListRequest;
use crate::realtime::{ChangeEvent, CloseReason, SubscriptionHandle};

const MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct RealtimeQuery {
    table: String,
    filter: Option<String>,
}

/// State shared by all handlers.
struct Handlers {
    engine: RecordsEngine,
    authenticator: Arc<dyn Authenticator>,
    request_timeout: Duration,
    keep_alive: Duration,
}

type HandlerResult = Result<Response<Body>, ApiError>;

fn json_response(status: StatusCode, body: &JsonValue) -> Response<Body> {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn parse_body(body: &[u8]) -> Result<JsonValue, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::MalformedBody(e.to_string()))
}

impl Handlers {
    async fn principal(&self, authorization: Option<String>) -> Result<Principal, ApiError> {
        let token = header_to_token(authorization.as_deref())?;
        Ok(self.authenticator.resolve_principal(token.as_deref()).await?)
    }

    /// The returned guard cancels the request's token when dropped, which
    /// happens when warp drops the handler future because the client went
    /// away.
    async fn request_context(
        &self,
        authorization: Option<String>,
    ) -> Result<(RequestContext, DropGuard), ApiError> {
        let principal = self.principal(authorization).await?;
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let context = RequestContext::new(principal)
            .with_cancellation(cancel)
            .with_timeout(self.request_timeout);
        Ok((context, guard))
    }

    async fn list(
        &self,
        table: String,
        request: ListRequest,
        authorization: Option<String>,
    ) -> HandlerResult {
        let (context, _guard) = self.request_context(authorization).await?;
        let response = self.engine.list(&table, &request, &context).await?;
        Ok(json_response(StatusCode::OK, &response.to_json()))
    }

    async fn get(&self, table: String, id: String, authorization: Option<String>) -> HandlerResult {
        let (context, _guard) = self.request_context(authorization).await?;
        let record = self.engine.get(&table, &id, &context).await?;
        Ok(json_response(StatusCode::OK, &record.to_json()))
    }

    async fn create(
        &self,
        table: String,
        body: Bytes,
        authorization: Option<String>,
    ) -> HandlerResult {
        let (context, _guard) = self.request_context(authorization).await?;
        let payload = parse_body(&body)?;
        let record = self.engine.create(&table, &payload, &context).await?;
        Ok(json_response(StatusCode::OK, &record.to_json()))
    }

    async fn update(
        &self,
        table: String,
        id: String,
        body: Bytes,
        authorization: Option<String>,
    ) -> HandlerResult {
        let (context, _guard) = self.request_context(authorization).await?;
        let payload = parse_body(&body)?;
        let record = self.engine.update(&table, &id, &payload, &context).await?;
        Ok(json_response(StatusCode::OK, &record.to_json()))
    }

    async fn delete(
        &self,
        table: String,
        id: String,
        authorization: Option<String>,
    ) -> HandlerResult {
        let (context, _guard) = self.request_context(authorization).await?;
        self.engine.delete(&table, &id, &context).await?;
        Ok(StatusCode::NO_CONTENT.into_response())
    }

    async fn health(&self) -> HandlerResult {
        if self.engine.health_check().await {
            Ok(json_response(
                StatusCode::OK,
                &json!({"code": 200, "message": "API is healthy."}),
            ))
        } else {
            Ok(json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({"code": 503, "message": "API is unavailable."}),
            ))
        }
    }

    async fn refresh_catalog(&self, authorization: Option<String>) -> HandlerResult {
        let principal = self.principal(authorization).await?;
        let tables = self.engine.refresh_catalog(&principal).await?;
        Ok(json_response(StatusCode::OK, &json!({ "tables": tables })))
    }

    async fn realtime(&self, query: RealtimeQuery, authorization: Option<String>) -> HandlerResult {
        let principal = Arc::new(self.principal(authorization).await?);
        let handle = self
            .engine
            .subscribe(&query.table, query.filter.as_deref(), principal)?;
        debug!(
            subscription = handle.id(),
            table = %query.table,
            "Streaming realtime events"
        );

        let stream = event_stream(handle).map(Ok::<_, Infallible>);
        Ok(warp::sse::reply(
            warp::sse::keep_alive()
                .interval(self.keep_alive)
                .stream(stream),
        )
        .into_response())
    }
}

fn message_event(event: &ChangeEvent) -> Event {
    Event::default()
        .event("message")
        .id(event.sequence.to_string())
        .data(event.payload().to_string())
}

/// `connect`, then one `message` per change event, then `close` if the
/// server dropped the subscription. The handle (and with it the
/// subscription) lives as long as the stream, so a disconnecting client
/// unsubscribes by dropping it.
fn event_stream(handle: SubscriptionHandle) -> impl Stream<Item = Event> + Send {
    let connect = Event::default()
        .event("connect")
        .data(json!({ "subscriptionId": handle.id() }).to_string());

    let events = stream::unfold(Some(handle), |state| async move {
        let mut handle = state?;
        match handle.recv().await {
            Some(event) => Some((message_event(&event), Some(handle))),
            None => match handle.close_reason() {
                Some(reason) if reason != CloseReason::Disconnected => {
                    let reason: &'static str = reason.into();
                    let close = Event::default()
                        .event("close")
                        .data(json!({ "reason": reason }).to_string());
                    Some((close, None))
                }
                _ => None,
            },
        }
    });

    stream::once(async move { connect }).chain(events)
}

async fn handle_rejection(rejection: Rejection) -> Result<Response<Body>, Infallible> {
    let (status, code, message) = if rejection.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            "not_found",
            "The requested resource wasn't found.".to_string(),
        )
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "Method not allowed.".to_string(),
        )
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "validation_error",
            "Request body is too large.".to_string(),
        )
    } else if let Some(e) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "filter_error", e.to_string())
    } else if let Some(e) = rejection.find::<warp::reject::InvalidHeader>() {
        (StatusCode::BAD_REQUEST, "bad_request", e.to_string())
    } else if rejection.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "bad_request",
            "A Content-Length header is required.".to_string(),
        )
    } else {
        error!("Unhandled rejection: {rejection:?}");
        let error = ApiError::from(RecordsError::Internal(format!("{rejection:?}")));
        return Ok(error.into_response());
    };
    Ok(json_response(
        status,
        &json!({"code": code, "message": message}),
    ))
}

fn authorization() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
}

fn json_body() -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes())
}

/// Count the response against its route and turn it into a response.
fn finish(route: &'static str, result: HandlerResult) -> Response<Body> {
    let response = into_response(result);
    crate::metrics::http_request(route, response.status().as_u16());
    response
}

pub fn filters(
    context: PetrelContext,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let http = context.config.frontend.http.clone().unwrap_or_default();
    routes(
        context.engine,
        context.authenticator,
        &http,
        &context.config.realtime,
    )
}

fn routes(
    engine: RecordsEngine,
    authenticator: Arc<dyn Authenticator>,
    http: &HttpFrontend,
    realtime: &Realtime,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let handlers = Arc::new(Handlers {
        engine,
        authenticator,
        request_timeout: http.request_timeout(),
        keep_alive: Duration::from_millis(realtime.keep_alive_ms),
    });
    let with_handlers = warp::any().map(move || handlers.clone());

    // GET /api/collections/:table/records
    let list = warp::path!("api" / "collections" / String / "records")
        .and(warp::get())
        .and(warp::query::<ListRequest>())
        .and(authorization())
        .and(with_handlers.clone())
        .then(
            |table: String, request: ListRequest, auth: Option<String>, handlers: Arc<Handlers>| async move {
                finish("list", handlers.list(table, request, auth).await)
            },
        );

    // GET /api/collections/:table/records/:id
    let get = warp::path!("api" / "collections" / String / "records" / String)
        .and(warp::get())
        .and(authorization())
        .and(with_handlers.clone())
        .then(
            |table: String, id: String, auth: Option<String>, handlers: Arc<Handlers>| async move {
                finish("get", handlers.get(table, id, auth).await)
            },
        );

    // POST /api/collections/:table/records
    let create = warp::path!("api" / "collections" / String / "records")
        .and(warp::post())
        .and(json_body())
        .and(authorization())
        .and(with_handlers.clone())
        .then(
            |table: String, body: Bytes, auth: Option<String>, handlers: Arc<Handlers>| async move {
                finish("create", handlers.create(table, body, auth).await)
            },
        );

    // PATCH /api/collections/:table/records/:id
    let update = warp::path!("api" / "collections" / String / "records" / String)
        .and(warp::patch())
        .and(json_body())
        .and(authorization())
        .and(with_handlers.clone())
        .then(
            |table: String,
             id: String,
             body: Bytes,
             auth: Option<String>,
             handlers: Arc<Handlers>| async move {
                finish("update", handlers.update(table, id, body, auth).await)
            },
        );

    // DELETE /api/collections/:table/records/:id
    let delete = warp::path!("api" / "collections" / String / "records" / String)
        .and(warp::delete())
        .and(authorization())
        .and(with_handlers.clone())
        .then(
            |table: String, id: String, auth: Option<String>, handlers: Arc<Handlers>| async move {
                finish("delete", handlers.delete(table, id, auth).await)
            },
        );

    // GET /api/health
    let health = warp::path!("api" / "health")
        .and(warp::get())
        .and(with_handlers.clone())
        .then(|handlers: Arc<Handlers>| async move {
            finish("health", handlers.health().await)
        });

    // POST /api/catalog/refresh
    let refresh = warp::path!("api" / "catalog" / "refresh")
        .and(warp::post())
        .and(authorization())
        .and(with_handlers.clone())
        .then(|auth: Option<String>, handlers: Arc<Handlers>| async move {
            finish("refresh_catalog", handlers.refresh_catalog(auth).await)
        });

    // GET /api/realtime?table=...&filter=...
    let realtime = warp::path!("api" / "realtime")
        .and(warp::get())
        .and(warp::query::<RealtimeQuery>())
        .and(authorization())
        .and(with_handlers)
        .then(
            |query: RealtimeQuery, auth: Option<String>, handlers: Arc<Handlers>| async move {
                finish("realtime", handlers.realtime(query, auth).await)
            },
        );

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["Authorization", "Content-Type"])
        .allow_methods(vec!["GET", "POST", "PATCH", "DELETE"]);

    list.or(get)
        .unify()
        .or(create)
        .unify()
        .or(update)
        .unify()
        .or(delete)
        .unify()
        .or(health)
        .unify()
        .or(refresh)
        .unify()
        .or(realtime)
        .unify()
        .recover(handle_rejection)
        .unify()
        .with(cors)
}

pub async fn run_server(
    context: PetrelContext,
    config: HttpFrontend,
) -> Result<(), AddrParseError> {
    let filters = filters(context);

    let socket_addr: SocketAddr = format!("{}:{}", config.bind_host, config.bind_port).parse()?;
    info!("Starting the HTTP frontend on {socket_addr}");
    warp::serve(filters).run(socket_addr).await;
    Ok(())
}
