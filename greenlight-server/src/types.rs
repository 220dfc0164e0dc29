//! Movie records and their wire shapes
//!
//! [`Movie`] is the payload stored inside a [`VersionedRecord`]. What clients
//! see is [`MovieView`], which adds the id and version and hides the creation
//! timestamp. [`MovieFilter`] is the validated form of a listing query.

use chrono::{DateTime, Datelike, Utc};
use greenlight::VersionedRecord;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

const MAX_TITLE_BYTES: usize = 500;
const FIRST_FILM_YEAR: i32 = 1888;
const MAX_GENRES: usize = 5;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE: u32 = 10_000_000;
const MAX_PAGE_SIZE: u32 = 100;

/// Movie payload as stored
#[derive(Debug, Clone, PartialEq)]
pub struct Movie {
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub year: i32,
    pub runtime: Runtime,
    pub genres: Vec<String>,
}

/// Running time in minutes, written as `"<n> mins"` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Runtime(pub i32);

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mins", self.0)
    }
}

impl std::str::FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let minutes = s
            .strip_suffix(" mins")
            .ok_or_else(|| "runtime must be formatted as \"<n> mins\"".to_string())?;
        minutes
            .parse()
            .map(Runtime)
            .map_err(|_| "runtime must be formatted as \"<n> mins\"".to_string())
    }
}

impl Serialize for Runtime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Runtime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Movie as returned to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MovieView {
    pub id: i64,
    pub title: String,
    pub year: i32,
    pub runtime: Runtime,
    pub genres: Vec<String>,
    pub version: i64,
}

impl From<&VersionedRecord<Movie>> for MovieView {
    fn from(record: &VersionedRecord<Movie>) -> Self {
        MovieView {
            id: record.id,
            title: record.payload.title.clone(),
            year: record.payload.year,
            runtime: record.payload.runtime,
            genres: record.payload.genres.clone(),
            version: record.version,
        }
    }
}

/// Body of `POST /v1/movies`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMovieInput {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub year: i32,
    #[serde(default = "Runtime::unset")]
    pub runtime: Runtime,
    #[serde(default)]
    pub genres: Vec<String>,
}

/// Body of `PATCH /v1/movies/{id}`; absent fields are left unchanged
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMovieInput {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub runtime: Option<Runtime>,
    pub genres: Option<Vec<String>>,
}

impl Runtime {
    fn unset() -> Self {
        Runtime(0)
    }
}

impl CreateMovieInput {
    pub fn into_movie(self, created_at: DateTime<Utc>) -> Movie {
        Movie {
            created_at,
            title: self.title,
            year: self.year,
            runtime: self.runtime,
            genres: self.genres,
        }
    }
}

impl UpdateMovieInput {
    pub fn apply(self, movie: &mut Movie) {
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

/// Field name to message, in a stable order
pub type FieldErrors = BTreeMap<&'static str, &'static str>;

/// Check a movie against the field rules, keeping the first failure per field
pub fn validate_movie(movie: &Movie, now: DateTime<Utc>) -> Result<(), FieldErrors> {
    let mut errors = FieldErrors::new();
    let mut check = |ok: bool, field: &'static str, message: &'static str| {
        if !ok {
            errors.entry(field).or_insert(message);
        }
    };

    check(!movie.title.is_empty(), "title", "must be provided");
    check(
        movie.title.len() <= MAX_TITLE_BYTES,
        "title",
        "must not be more than 500 bytes long",
    );

    check(movie.year != 0, "year", "must be provided");
    check(movie.year >= FIRST_FILM_YEAR, "year", "must be greater than 1888");
    check(movie.year <= now.year(), "year", "must not be in the future");

    check(movie.runtime.0 != 0, "runtime", "must be provided");
    check(movie.runtime.0 > 0, "runtime", "must be a positive integer");

    check(!movie.genres.is_empty(), "genres", "must contain at least 1 genre");
    check(
        movie.genres.len() <= MAX_GENRES,
        "genres",
        "must not contain more than 5 genres",
    );
    let unique: HashSet<&str> = movie.genres.iter().map(String::as_str).collect();
    check(
        unique.len() == movie.genres.len(),
        "genres",
        "must not contain duplicate values",
    );

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Query string of `GET /v1/movies`, before validation
#[derive(Debug, Default, Deserialize)]
pub struct ListMoviesQuery {
    pub title: Option<String>,
    pub genres: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
    pub sort: Option<String>,
}

/// Columns a listing may be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Id,
    Title,
    Year,
    Runtime,
}

impl SortColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortColumn::Id => "id",
            SortColumn::Title => "title",
            SortColumn::Year => "year",
            SortColumn::Runtime => "runtime",
        }
    }
}

/// Listing order; a leading `-` on the wire means descending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovieSort {
    pub column: SortColumn,
    pub descending: bool,
}

impl Default for MovieSort {
    fn default() -> Self {
        MovieSort {
            column: SortColumn::Id,
            descending: false,
        }
    }
}

impl std::str::FromStr for MovieSort {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (descending, name) = match s.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, s),
        };
        let column = match name {
            "id" => SortColumn::Id,
            "title" => SortColumn::Title,
            "year" => SortColumn::Year,
            "runtime" => SortColumn::Runtime,
            _ => return Err(()),
        };
        Ok(MovieSort { column, descending })
    }
}

/// Validated listing query
#[derive(Debug, Clone, PartialEq)]
pub struct MovieFilter {
    /// Case-insensitive substring of the title; empty matches everything
    pub title: String,
    /// Every listed genre must be present on a matching movie
    pub genres: Vec<String>,
    pub page: u32,
    pub page_size: u32,
    pub sort: MovieSort,
}

impl Default for MovieFilter {
    fn default() -> Self {
        MovieFilter {
            title: String::new(),
            genres: Vec::new(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: MovieSort::default(),
        }
    }
}

impl MovieFilter {
    /// Validate a raw query, collecting the first failure per parameter
    pub fn from_query(query: ListMoviesQuery) -> Result<Self, FieldErrors> {
        let mut errors = FieldErrors::new();
        let mut filter = MovieFilter::default();

        filter.title = query.title.unwrap_or_default();
        if let Some(genres) = query.genres.filter(|g| !g.is_empty()) {
            filter.genres = genres.split(',').map(str::to_string).collect();
        }
        if let Some(page) = read_int(query.page, "page", &mut errors) {
            filter.page = page;
        }
        if let Some(page_size) = read_int(query.page_size, "page_size", &mut errors) {
            filter.page_size = page_size;
        }
        if let Some(sort) = query.sort.filter(|s| !s.is_empty()) {
            match sort.parse() {
                Ok(sort) => filter.sort = sort,
                Err(()) => {
                    errors.insert("sort", "invalid sort value");
                }
            }
        }

        if !errors.contains_key("page") {
            if filter.page == 0 {
                errors.insert("page", "must be greater than zero");
            } else if filter.page > MAX_PAGE {
                errors.insert("page", "must be a maximum of 10 million");
            }
        }
        if !errors.contains_key("page_size") {
            if filter.page_size == 0 {
                errors.insert("page_size", "must be greater than zero");
            } else if filter.page_size > MAX_PAGE_SIZE {
                errors.insert("page_size", "must be a maximum of 100");
            }
        }

        if errors.is_empty() { Ok(filter) } else { Err(errors) }
    }

    pub fn limit(&self) -> u32 {
        self.page_size
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

/// Negative or non-numeric values are reported under `field`
fn read_int(raw: Option<String>, field: &'static str, errors: &mut FieldErrors) -> Option<u32> {
    let raw = raw.filter(|r| !r.is_empty())?;
    match raw.parse::<i64>() {
        Ok(n) if n <= 0 => {
            errors.insert(field, "must be greater than zero");
            None
        }
        Ok(n) => Some(u32::try_from(n).unwrap_or(u32::MAX)),
        Err(_) => {
            errors.insert(field, "must be an integer value");
            None
        }
    }
}

/// One page of a listing plus the total number of matches
#[derive(Debug, Clone, PartialEq)]
pub struct MoviePage {
    pub records: Vec<VersionedRecord<Movie>>,
    pub total: u64,
}

/// Paging summary of a listing; serializes as `{}` when nothing matched
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
}

impl Metadata {
    pub fn new(total: u64, page: u32, page_size: u32) -> Self {
        if total == 0 {
            return Metadata::default();
        }
        Metadata {
            current_page: Some(page),
            page_size: Some(page_size),
            first_page: Some(1),
            last_page: Some(total.div_ceil(u64::from(page_size))),
            total_records: Some(total),
        }
    }
}
