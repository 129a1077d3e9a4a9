//! Pagination and sorting for list endpoints.

use serde::Serialize;

use crate::validation::{Validator, permitted_value};

pub const MAX_PAGE: u32 = 10_000_000;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Sort values accepted by `GET /v1/movies`.
pub const MOVIE_SORT_SAFELIST: &[&str] = &[
    "id", "title", "year", "runtime", "-id", "-title", "-year", "-runtime",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filters {
    pub page: u32,
    pub page_size: u32,
    pub sort: String,
    pub sort_safelist: &'static [&'static str],
}

impl Filters {
    pub fn movies(page: u32, page_size: u32, sort: String) -> Self {
        Self {
            page,
            page_size,
            sort,
            sort_safelist: MOVIE_SORT_SAFELIST,
        }
    }

    /// Column to order by, or `None` if the sort value is not in the safelist.
    pub fn sort_column(&self) -> Option<&'static str> {
        self.sort_safelist
            .iter()
            .find(|safe| **safe == self.sort)
            .map(|safe| safe.trim_start_matches('-'))
    }

    pub fn descending(&self) -> bool {
        self.sort.starts_with('-')
    }

    pub fn limit(&self) -> u32 {
        self.page_size
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

impl Default for Filters {
    fn default() -> Self {
        Self::movies(1, DEFAULT_PAGE_SIZE, "id".to_string())
    }
}

pub fn validate_filters(v: &mut Validator, f: &Filters) {
    v.check(f.page > 0, "page", "must be greater than zero");
    v.check(f.page <= MAX_PAGE, "page", "must be a maximum of 10 million");
    v.check(f.page_size > 0, "page_size", "must be greater than zero");
    v.check(
        f.page_size <= MAX_PAGE_SIZE,
        "page_size",
        "must be a maximum of 100",
    );
    v.check(
        permitted_value(&f.sort.as_str(), f.sort_safelist),
        "sort",
        "invalid sort value",
    );
}

/// Pagination metadata returned alongside list results.
///
/// Empty when there are no records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
}

impl Metadata {
    pub fn calculate(total_records: u64, page: u32, page_size: u32) -> Self {
        if total_records == 0 || page_size == 0 {
            return Self::default();
        }

        Self {
            current_page: Some(page),
            page_size: Some(page_size),
            first_page: Some(1),
            last_page: Some(total_records.div_ceil(u64::from(page_size))),
            total_records: Some(total_records),
        }
    }
}

/// Search parameters for listing movies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovieQuery {
    pub title: String,
    pub genres: Vec<String>,
    pub filters: Filters,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn errors(f: &Filters) -> crate::error::FieldErrors {
        let mut v = Validator::new();
        validate_filters(&mut v, f);
        match v.finish() {
            Err(AppError::FailedValidation(fields)) => fields,
            _ => Default::default(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(errors(&Filters::default()).is_empty());
    }

    #[test]
    fn test_page_bounds() {
        assert_eq!(
            errors(&Filters::movies(0, 20, "id".into()))["page"],
            "must be greater than zero"
        );
        assert_eq!(
            errors(&Filters::movies(MAX_PAGE + 1, 20, "id".into()))["page"],
            "must be a maximum of 10 million"
        );
    }

    #[test]
    fn test_page_size_checked_independently_of_page() {
        let fields = errors(&Filters::movies(1, 0, "id".into()));
        assert!(!fields.contains_key("page"));
        assert_eq!(fields["page_size"], "must be greater than zero");

        let fields = errors(&Filters::movies(1, 101, "id".into()));
        assert_eq!(fields["page_size"], "must be a maximum of 100");
    }

    #[test]
    fn test_sort_safelist() {
        assert_eq!(
            errors(&Filters::movies(1, 20, "rating".into()))["sort"],
            "invalid sort value"
        );

        let f = Filters::movies(1, 20, "-year".into());
        assert_eq!(f.sort_column(), Some("year"));
        assert!(f.descending());

        let f = Filters::movies(1, 20, "title; DROP TABLE movies".into());
        assert_eq!(f.sort_column(), None);
    }

    #[test]
    fn test_offset() {
        assert_eq!(Filters::movies(1, 20, "id".into()).offset(), 0);
        assert_eq!(Filters::movies(3, 20, "id".into()).offset(), 40);
    }

    #[test]
    fn test_metadata() {
        assert_eq!(Metadata::calculate(0, 1, 20), Metadata::default());

        let m = Metadata::calculate(41, 2, 20);
        assert_eq!(m.last_page, Some(3));
        assert_eq!(m.current_page, Some(2));
        assert_eq!(m.total_records, Some(41));
    }
}
