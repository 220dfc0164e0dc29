//! HTTP/JSON transport for movie records
//!
//! # API Endpoints
//!
//! ## GET /v1/healthcheck
//!
//! ```json
//! {"status": "available", "system_info": {"environment": "development", "version": "0.1.0"}}
//! ```
//!
//! ## GET /v1/movies
//!
//! Query parameters, all optional:
//!
//! - `title`: case-insensitive substring match
//! - `genres`: comma-separated; a movie must carry every one
//! - `page` (default 1) and `page_size` (default 20, at most 100)
//! - `sort`: `id`, `title`, `year` or `runtime`, prefixed with `-` for
//!   descending (default `id`)
//!
//! ```json
//! {"metadata": {"current_page": 1, "page_size": 20, "first_page": 1, "last_page": 1, "total_records": 2}, "movies": [...]}
//! ```
//!
//! ## POST /v1/movies
//!
//! ```json
//! {"title": "Moana", "year": 2016, "runtime": "107 mins", "genres": ["animation", "adventure"]}
//! ```
//!
//! Answers 201 with a `Location` header and the stored movie at version 1.
//!
//! ## GET /v1/movies/{id}
//!
//! ## PATCH /v1/movies/{id}
//!
//! Any subset of the create fields. An optional `X-Expected-Version` header
//! makes the update fail with 409 unless the stored version matches it.
//!
//! ## DELETE /v1/movies/{id}
//!
//! # Errors
//!
//! Every failure is a JSON object with a single `error` member. For failed
//! validation it maps field names to messages; otherwise it is a string.

use crate::config::Environment;
use crate::shutdown::FatalReporter;
use crate::store::{CatalogStore, OptimisticStore, StoreError};
use crate::types::{
    CreateMovieInput, FieldErrors, ListMoviesQuery, Metadata, Movie, MovieFilter, MovieView,
    UpdateMovieInput, validate_movie,
};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1_048_576;

/// Header carrying the version a client expects to overwrite
pub const EXPECTED_VERSION: &str = "x-expected-version";

/// Shared state for the movie handlers
#[derive(Clone)]
pub struct AppState {
    pub movies: OptimisticStore<Movie>,
    pub catalog: CatalogStore,
    pub env: Environment,
    pub fatal: FatalReporter,
}

impl AppState {
    fn store_error(&self, err: StoreError) -> ApiError {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Conflict => ApiError::Conflict,
            StoreError::Timeout { .. } => ApiError::Unavailable,
            StoreError::Invariant(reason) => {
                self.fatal.report(reason);
                ApiError::Internal
            }
            StoreError::Backend(reason) => {
                tracing::error!(error = %reason, "store failure");
                ApiError::Internal
            }
        }
    }
}

/// Error responses produced by the HTTP layer
#[derive(Debug)]
pub enum ApiError {
    RateLimited,
    NotFound,
    MethodNotAllowed(Method),
    Conflict,
    BadRequest(String),
    Validation(FieldErrors),
    Unavailable,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, json!("rate limit exceeded")),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                json!("the requested resource could not be found"),
            ),
            ApiError::MethodNotAllowed(method) => (
                StatusCode::METHOD_NOT_ALLOWED,
                json!(format!("the {method} method is not supported for this resource")),
            ),
            ApiError::Conflict => (
                StatusCode::CONFLICT,
                json!("unable to update the record due to an edit conflict, please try again"),
            ),
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, json!(reason)),
            ApiError::Validation(errors) => (StatusCode::UNPROCESSABLE_ENTITY, json!(errors)),
            ApiError::Unavailable => {
                let mut response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": "the store did not respond in time, please try again"})),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
                return response;
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!("the server encountered a problem and could not process your request"),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::BadRequest(format!(
                "body must not be larger than {MAX_BODY_BYTES} bytes"
            ));
        }
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Movie routes with their state applied
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthcheck", get(healthcheck))
        .route("/v1/movies", get(list_movies).post(create_movie))
        .route(
            "/v1/movies/{id}",
            get(show_movie).patch(update_movie).delete(delete_movie),
        )
        .fallback(|| async { ApiError::NotFound })
        .method_not_allowed_fallback(|method: Method| async move {
            ApiError::MethodNotAllowed(method)
        })
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthcheck(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "available",
        "system_info": {
            "environment": state.env.as_str(),
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

async fn list_movies(
    State(state): State<AppState>,
    query: Result<Query<ListMoviesQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let filter = MovieFilter::from_query(query).map_err(ApiError::Validation)?;
    let (page, page_size) = (filter.page, filter.page_size);

    let listing = state
        .catalog
        .list(filter)
        .await
        .map_err(|e| state.store_error(e))?;

    let movies: Vec<MovieView> = listing.records.iter().map(MovieView::from).collect();
    Ok(Json(json!({
        "metadata": Metadata::new(listing.total, page, page_size),
        "movies": movies,
    })))
}

async fn create_movie(
    State(state): State<AppState>,
    payload: Result<Json<CreateMovieInput>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(input) = payload?;
    let movie = input.into_movie(Utc::now());
    validate_movie(&movie, Utc::now()).map_err(ApiError::Validation)?;

    let record = state
        .movies
        .insert(movie)
        .await
        .map_err(|e| state.store_error(e))?;

    let location = format!("/v1/movies/{}", record.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(json!({ "movie": MovieView::from(&record) })),
    )
        .into_response())
}

async fn show_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let record = state
        .movies
        .read(id)
        .await
        .map_err(|e| state.store_error(e))?;
    Ok(Json(json!({ "movie": MovieView::from(&record) })))
}

async fn update_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<UpdateMovieInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let mut record = state
        .movies
        .read(id)
        .await
        .map_err(|e| state.store_error(e))?;

    if let Some(expected) = expected_version(&headers)? {
        if expected != record.version {
            return Err(ApiError::Conflict);
        }
    }

    let Json(input) = payload?;
    input.apply(&mut record.payload);
    validate_movie(&record.payload, Utc::now()).map_err(ApiError::Validation)?;

    record.version = state
        .movies
        .conditional_update(record.clone())
        .await
        .map_err(|e| state.store_error(e))?;

    Ok(Json(json!({ "movie": MovieView::from(&record) })))
}

async fn delete_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    state
        .movies
        .delete(id)
        .await
        .map_err(|e| state.store_error(e))?;
    Ok(Json(json!({ "message": "movie successfully deleted" })))
}

/// Anything but a positive integer names no movie
fn parse_id(raw: &str) -> Result<i64, ApiError> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::NotFound),
    }
}

fn expected_version(headers: &HeaderMap) -> Result<Option<i64>, ApiError> {
    let Some(value) = headers.get(EXPECTED_VERSION) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(Some)
        .ok_or_else(|| {
            ApiError::BadRequest(format!("{EXPECTED_VERSION} header must be an integer"))
        })
}
