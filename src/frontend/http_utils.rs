// Warp error handling and propagation
// Courtesy of https://github.com/seanmonstar/warp/pull/909#issuecomment-1184854848
//
// Usage:
//
//   1) A handler function, instead of returning a Warp reply/rejection, returns a
//   `Result<Reply, ApiError>.`
//
//   Rejections mean "this filter can't handle the request, try another one". Our
//   handler errors are final, and returning a Result lets handlers bail out with `?`.
//
//   2) ApiError knows how to convert itself to an HTTP response + status code, so it
//   implements Reply.
//
//   3) We can't implement Reply for Result<Reply, Reply>, so a final `into_response`
//   converts the Result into a Response:
//
//   ```
//   .then(my_handler_func)
//   .map(into_response)
//   ```
//

use serde_json::{json, Value as JsonValue};
use tracing::error;
use warp::http::header::CONTENT_TYPE;
use warp::hyper::{Body, Response, StatusCode};
use warp::Reply;

use crate::auth::AuthError;
use crate::engine::RecordsError;
use crate::query::ValidationError;

#[derive(Debug)]
pub enum ApiError {
    Records(RecordsError),
    Auth(AuthError),
    /// The request body isn't valid JSON
    MalformedBody(String),
}

impl From<RecordsError> for ApiError {
    fn from(err: RecordsError) -> Self {
        ApiError::Records(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

fn validation_field(error: &ValidationError) -> Option<&str> {
    match error {
        ValidationError::UnknownField(field)
        | ValidationError::NullNotAllowed(field)
        | ValidationError::MissingField(field)
        | ValidationError::PrimaryKeyImmutable(field)
        | ValidationError::InvalidValue { field, .. } => Some(field),
        ValidationError::NotAnObject
        | ValidationError::EmptyUpdate
        | ValidationError::RequiredValueMissing => None,
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Records(e) => match e {
                RecordsError::Filter(_) | RecordsError::Validation(_) => StatusCode::BAD_REQUEST,
                RecordsError::Forbidden => StatusCode::FORBIDDEN,
                RecordsError::NotFound => StatusCode::NOT_FOUND,
                RecordsError::Conflict { .. } => StatusCode::CONFLICT,
                RecordsError::Cancelled => StatusCode::REQUEST_TIMEOUT,
                RecordsError::Unusable(_) | RecordsError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Auth(_) => "unauthorized",
            ApiError::MalformedBody(_) => "validation_error",
            ApiError::Records(e) => e.code(),
        }
    }

    /// The `{code, message, data?}` envelope. Internal causes are never
    /// included; they were logged by the engine.
    pub fn envelope(&self) -> JsonValue {
        let message = match self {
            ApiError::Auth(e) => e.to_string(),
            ApiError::MalformedBody(e) => format!("Invalid JSON body: {e}"),
            ApiError::Records(e) => e.to_string(),
        };

        let data = match self {
            ApiError::Records(RecordsError::Validation(e)) => {
                validation_field(e).map(|field| json!({ "field": field }))
            }
            _ => None,
        };

        match data {
            Some(data) => json!({"code": self.code(), "message": message, "data": data}),
            None => json!({"code": self.code(), "message": message}),
        }
    }
}

impl Reply for ApiError {
    fn into_response(self) -> Response<Body> {
        let status = self.status_code();
        let body = self.envelope().to_string();
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap_or_else(|e| {
                error!("Could not construct an error response: {e}");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            })
    }
}

pub fn into_response<S: Reply, E: Reply>(reply_res: Result<S, E>) -> Response<Body> {
    match reply_res {
        Ok(resp) => resp.into_response(),
        Err(err) => err.into_response(),
    }
}
