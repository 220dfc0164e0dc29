//! SQLite-backed movie repository
//!
//! The version check lives inside the `UPDATE` statement itself
//! (`WHERE id = ? AND version = ?`), so SQLite applies check and write
//! atomically. When that statement matches no row, an existence check on the
//! same locked connection tells a vanished record apart from a stale version.
//!
//! Listings filter by title substring and genre containment in SQL, using
//! SQLite's JSON functions over the stored genre array, and count the total
//! matches with a window function so paging needs a single query.

use crate::store::MovieCatalog;
use crate::types::{Movie, MovieFilter, MoviePage, Runtime};
use chrono::{DateTime, Utc};
use greenlight::{RecordError, Repository, VersionedRecord};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::time::Duration;

const MEMORY_DSN: &str = ":memory:";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS movies (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at  TEXT    NOT NULL,
    title       TEXT    NOT NULL,
    year        INTEGER NOT NULL,
    runtime     INTEGER NOT NULL,
    genres      TEXT    NOT NULL,
    version     INTEGER NOT NULL DEFAULT 1
);
";

/// [`Repository`] for [`Movie`] records in a SQLite database
pub struct SqliteMovieRepository {
    conn: Mutex<Connection>,
}

impl SqliteMovieRepository {
    /// Open (or create) the database at `dsn` and make sure the schema exists
    ///
    /// `":memory:"` opens a private in-memory database. `busy_timeout` bounds
    /// how long SQLite waits on a lock held by another connection.
    pub fn open(dsn: &str, busy_timeout: Duration) -> Result<Self, RecordError> {
        let conn = if dsn == MEMORY_DSN {
            Connection::open_in_memory()
        } else {
            Connection::open(Path::new(dsn))
        }
        .map_err(backend)?;

        if dsn != MEMORY_DSN {
            conn.execute_batch("PRAGMA journal_mode = WAL;")
                .map_err(backend)?;
        }
        conn.busy_timeout(busy_timeout).map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;

        tracing::debug!(dsn, "movie store ready");
        Ok(SqliteMovieRepository {
            conn: Mutex::new(conn),
        })
    }

    /// Overwrite a record's version without touching anything else
    #[cfg(test)]
    pub(crate) fn force_version(&self, id: i64, version: i64) -> Result<(), RecordError> {
        self.conn
            .lock()
            .execute(
                "UPDATE movies SET version = ?1 WHERE id = ?2",
                params![version, id],
            )
            .map(|_| ())
            .map_err(backend)
    }

    /// Overwrite a record's raw genres column
    #[cfg(test)]
    pub(crate) fn force_genres(&self, id: i64, raw: &str) -> Result<(), RecordError> {
        self.conn
            .lock()
            .execute(
                "UPDATE movies SET genres = ?1 WHERE id = ?2",
                params![raw, id],
            )
            .map(|_| ())
            .map_err(backend)
    }
}

impl Repository<Movie> for SqliteMovieRepository {
    fn insert(&self, movie: Movie) -> Result<VersionedRecord<Movie>, RecordError> {
        let genres = encode_genres(&movie.genres)?;
        let (id, version) = self
            .conn
            .lock()
            .query_row(
                "INSERT INTO movies (created_at, title, year, runtime, genres)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 RETURNING id, version",
                params![
                    movie.created_at.to_rfc3339(),
                    movie.title,
                    movie.year,
                    movie.runtime.0,
                    genres
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .map_err(backend)?;

        Ok(VersionedRecord {
            id,
            version,
            payload: movie,
        })
    }

    fn fetch(&self, id: i64) -> Result<VersionedRecord<Movie>, RecordError> {
        let raw = self
            .conn
            .lock()
            .query_row(
                "SELECT id, created_at, title, year, runtime, genres, version
                 FROM movies
                 WHERE id = ?1",
                params![id],
                RawMovie::from_row,
            )
            .optional()
            .map_err(backend)?;

        raw.ok_or(RecordError::NotFound)?.decode()
    }

    fn update_if_version(&self, record: &VersionedRecord<Movie>) -> Result<i64, RecordError> {
        let movie = &record.payload;
        let genres = encode_genres(&movie.genres)?;

        let conn = self.conn.lock();
        let updated = conn
            .query_row(
                "UPDATE movies
                 SET title = ?1, year = ?2, runtime = ?3, genres = ?4, version = version + 1
                 WHERE id = ?5 AND version = ?6
                 RETURNING version",
                params![
                    movie.title,
                    movie.year,
                    movie.runtime.0,
                    genres,
                    record.id,
                    record.version
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(backend)?;

        if let Some(version) = updated {
            return Ok(version);
        }

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM movies WHERE id = ?1)",
                params![record.id],
                |row| row.get(0),
            )
            .map_err(backend)?;

        if exists {
            Err(RecordError::Conflict)
        } else {
            Err(RecordError::NotFound)
        }
    }

    fn delete(&self, id: i64) -> Result<(), RecordError> {
        let affected = self
            .conn
            .lock()
            .execute("DELETE FROM movies WHERE id = ?1", params![id])
            .map_err(backend)?;

        if affected == 0 {
            return Err(RecordError::NotFound);
        }
        Ok(())
    }
}

impl MovieCatalog for SqliteMovieRepository {
    fn list(&self, filter: &MovieFilter) -> Result<MoviePage, RecordError> {
        let genres = encode_genres(&filter.genres)?;
        let direction = if filter.sort.descending { "DESC" } else { "ASC" };
        // The sort column comes from a closed enum, never from the request text
        let sql = format!(
            "SELECT id, created_at, title, year, runtime, genres, version, count(*) OVER ()
             FROM movies
             WHERE (?1 = '' OR instr(lower(title), lower(?1)) > 0)
               AND NOT EXISTS (
                   SELECT 1 FROM json_each(?2) AS wanted
                   WHERE wanted.value NOT IN (SELECT value FROM json_each(movies.genres))
               )
             ORDER BY {column} {direction}, id ASC
             LIMIT ?3 OFFSET ?4",
            column = filter.sort.column.as_str(),
        );
        let offset = i64::try_from(filter.offset()).unwrap_or(i64::MAX);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(
                params![filter.title, genres, i64::from(filter.limit()), offset],
                |row| Ok((RawMovie::from_row(row)?, row.get::<_, i64>(7)?)),
            )
            .map_err(backend)?;

        let mut page = MoviePage {
            records: Vec::new(),
            total: 0,
        };
        for row in rows {
            let (raw, total) = row.map_err(backend)?;
            page.total = u64::try_from(total).unwrap_or_default();
            page.records.push(raw.decode()?);
        }
        Ok(page)
    }
}

struct RawMovie {
    id: i64,
    created_at: String,
    title: String,
    year: i32,
    runtime: i32,
    genres: String,
    version: i64,
}

impl RawMovie {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawMovie {
            id: row.get(0)?,
            created_at: row.get(1)?,
            title: row.get(2)?,
            year: row.get(3)?,
            runtime: row.get(4)?,
            genres: row.get(5)?,
            version: row.get(6)?,
        })
    }

    fn decode(self) -> Result<VersionedRecord<Movie>, RecordError> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| {
                RecordError::Backend(format!("movie {} created_at: {e}", self.id))
            })?
            .with_timezone(&Utc);
        let genres: Vec<String> = serde_json::from_str(&self.genres)
            .map_err(|e| RecordError::Backend(format!("movie {} genres: {e}", self.id)))?;

        Ok(VersionedRecord {
            id: self.id,
            version: self.version,
            payload: Movie {
                created_at,
                title: self.title,
                year: self.year,
                runtime: Runtime(self.runtime),
                genres,
            },
        })
    }
}

fn encode_genres(genres: &[String]) -> Result<String, RecordError> {
    serde_json::to_string(genres).map_err(|e| RecordError::Backend(e.to_string()))
}

fn backend(err: rusqlite::Error) -> RecordError {
    RecordError::Backend(err.to_string())
}
