//! Movie catalog endpoints.
//!
//! Reads require `movies:read`, writes `movies:write`; the permission check
//! happens in the route layer before these handlers run.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::data::filters::{DEFAULT_PAGE_SIZE, validate_filters};
use crate::data::movies::validate_movie;
use crate::data::{Filters, Movie, MovieQuery};
use crate::error::{AppError, AppResult};
use crate::extract::{JsonBody, parse_id};
use crate::state::AppState;
use crate::store;
use crate::validation::Validator;

/// Optimistic concurrency precondition for `PATCH`.
pub const EXPECTED_VERSION_HEADER: &str = "x-expected-version";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMovieRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub runtime: i32,
    #[serde(default)]
    pub genres: Vec<String>,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMovieRequest {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub runtime: Option<i32>,
    pub genres: Option<Vec<String>>,
}

impl UpdateMovieRequest {
    fn apply(self, movie: &mut Movie) {
        if let Some(title) = self.title {
            movie.title = title;
        }
        if let Some(year) = self.year {
            movie.year = year;
        }
        if let Some(runtime) = self.runtime {
            movie.runtime = runtime;
        }
        if let Some(genres) = self.genres {
            movie.genres = genres;
        }
    }
}

/// Integer query parameter. Out-of-range values saturate so the filter
/// validation reports them.
fn read_int(
    params: &HashMap<String, String>,
    key: &str,
    default: u32,
    v: &mut Validator,
) -> u32 {
    let Some(raw) = params.get(key) else {
        return default;
    };

    match raw.trim().parse::<i64>() {
        Ok(value) => u32::try_from(value.max(0)).unwrap_or(u32::MAX),
        Err(_) => {
            v.add_error(key, "must be an integer value");
            default
        }
    }
}

fn read_csv(params: &HashMap<String, String>, key: &str) -> Vec<String> {
    params
        .get(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Build a validated [`MovieQuery`] from raw query parameters.
pub fn parse_movie_query(params: &HashMap<String, String>) -> AppResult<MovieQuery> {
    let mut v = Validator::new();

    let page = read_int(params, "page", 1, &mut v);
    let page_size = read_int(params, "page_size", DEFAULT_PAGE_SIZE, &mut v);
    let sort = params
        .get("sort")
        .cloned()
        .unwrap_or_else(|| "id".to_string());

    let query = MovieQuery {
        title: params.get("title").cloned().unwrap_or_default(),
        genres: read_csv(params, "genres"),
        filters: Filters::movies(page, page_size, sort),
    };

    validate_filters(&mut v, &query.filters);
    v.finish()?;
    Ok(query)
}

/// `GET /v1/movies`
#[instrument(skip(state))]
pub async fn list_movies(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Json<Value>> {
    let query = parse_movie_query(&params)?;

    let (movies, metadata) = store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move { tx.list_movies(&query).await })
    })
    .await?;

    Ok(Json(json!({ "movies": movies, "metadata": metadata })))
}

/// `POST /v1/movies`
///
/// Responds 201 with a `Location` header for the new record.
#[instrument(skip(state, input))]
pub async fn create_movie(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<CreateMovieRequest>,
) -> AppResult<Response> {
    let mut movie = Movie::new(input.title, input.year, input.runtime, input.genres);

    let mut v = Validator::new();
    validate_movie(&mut v, &movie);
    v.finish()?;

    let movie = store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move {
            tx.insert_movie(&mut movie).await?;
            Ok::<_, AppError>(movie)
        })
    })
    .await?;

    info!(movie_id = movie.id, "Movie created");

    let location = format!("/v1/movies/{}", movie.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(json!({ "movie": movie })),
    )
        .into_response())
}

/// `GET /v1/movies/{id}`
#[instrument(skip(state))]
pub async fn show_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;

    let movie = store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move { tx.get_movie(id).await })
    })
    .await?;

    Ok(Json(json!({ "movie": movie })))
}

/// `PATCH /v1/movies/{id}`
///
/// With `X-Expected-Version` set, a mismatch with the stored version is an
/// edit conflict before anything is written. A concurrent writer between read
/// and update is caught by the store's version check.
#[instrument(skip(state, headers, input))]
pub async fn update_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    JsonBody(input): JsonBody<UpdateMovieRequest>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    let expected_version = headers
        .get(EXPECTED_VERSION_HEADER)
        .map(|value| value.to_str().unwrap_or_default().trim().to_string());

    let movie = store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move {
            let mut movie = tx.get_movie(id).await?;

            if let Some(expected) = expected_version
                && expected != movie.version.to_string()
            {
                return Err(AppError::EditConflict(format!(
                    "movie {id} is at version {}, expected {expected}",
                    movie.version
                )));
            }

            input.apply(&mut movie);

            let mut v = Validator::new();
            validate_movie(&mut v, &movie);
            v.finish()?;

            tx.update_movie(&mut movie).await?;
            Ok(movie)
        })
    })
    .await?;

    info!(movie_id = movie.id, version = movie.version, "Movie updated");
    Ok(Json(json!({ "movie": movie })))
}

/// `DELETE /v1/movies/{id}`
#[instrument(skip(state))]
pub async fn delete_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;

    store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move { tx.delete_movie(id).await })
    })
    .await?;

    info!(movie_id = id, "Movie deleted");
    Ok(Json(json!({ "message": "movie successfully deleted" })))
}
