//! Movie records.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;

use crate::validation::{Validator, unique};

/// The first film is dated 1888.
pub const EARLIEST_MOVIE_YEAR: i32 = 1888;
pub const MAX_TITLE_BYTES: usize = 500;
pub const MAX_GENRES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Movie {
    pub id: i64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    pub title: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub year: i32,
    /// Runtime in minutes.
    #[serde(skip_serializing_if = "is_zero")]
    pub runtime: i32,
    pub genres: Vec<String>,
    pub version: i32,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl Movie {
    /// A not-yet-persisted movie.
    pub fn new(title: String, year: i32, runtime: i32, genres: Vec<String>) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            title,
            year,
            runtime,
            genres,
            version: 1,
        }
    }
}

pub fn validate_movie(v: &mut Validator, movie: &Movie) {
    v.check(!movie.title.is_empty(), "title", "must be provided");
    v.check(
        movie.title.len() <= MAX_TITLE_BYTES,
        "title",
        "must not be more than 500 bytes long",
    );

    v.check(movie.year != 0, "year", "must be provided");
    v.check(
        movie.year >= EARLIEST_MOVIE_YEAR,
        "year",
        "must be greater than 1888",
    );
    v.check(
        movie.year <= Utc::now().year(),
        "year",
        "must not be in the future",
    );

    v.check(movie.runtime != 0, "runtime", "must be provided");
    v.check(movie.runtime > 0, "runtime", "must be a positive integer");

    v.check(!movie.genres.is_empty(), "genres", "must contain at least 1 genre");
    v.check(
        movie.genres.len() <= MAX_GENRES,
        "genres",
        "must not contain more than 5 genres",
    );
    v.check(
        movie.genres.iter().all(|g| !g.is_empty()),
        "genres",
        "must not contain empty values",
    );
    v.check(unique(&movie.genres), "genres", "must not contain duplicate values");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn casablanca() -> Movie {
        Movie::new(
            "Casablanca".into(),
            1942,
            102,
            vec!["drama".into(), "romance".into()],
        )
    }

    fn field_errors(movie: &Movie) -> crate::error::FieldErrors {
        let mut v = Validator::new();
        validate_movie(&mut v, movie);
        match v.finish() {
            Err(AppError::FailedValidation(fields)) => fields,
            Ok(()) => Default::default(),
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_valid_movie() {
        assert!(field_errors(&casablanca()).is_empty());
    }

    #[test]
    fn test_year_bounds() {
        let mut movie = casablanca();
        movie.year = 1887;
        assert_eq!(field_errors(&movie)["year"], "must be greater than 1888");

        movie.year = Utc::now().year() + 1;
        assert_eq!(field_errors(&movie)["year"], "must not be in the future");
    }

    #[test]
    fn test_genres_rules() {
        let mut movie = casablanca();
        movie.genres = vec![];
        assert!(field_errors(&movie).contains_key("genres"));

        movie.genres = vec!["a", "b", "c", "d", "e", "f"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(field_errors(&movie)["genres"], "must not contain more than 5 genres");

        movie.genres = vec!["drama".into(), "drama".into()];
        assert_eq!(field_errors(&movie)["genres"], "must not contain duplicate values");
    }

    #[test]
    fn test_runtime_must_be_positive() {
        let mut movie = casablanca();
        movie.runtime = -5;
        assert_eq!(field_errors(&movie)["runtime"], "must be a positive integer");
    }

    #[test]
    fn test_json_shape() {
        let mut movie = casablanca();
        movie.id = 3;
        let json = serde_json::to_value(&movie).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["runtime"], 102);
        assert!(json.get("created_at").is_none());
    }
}
