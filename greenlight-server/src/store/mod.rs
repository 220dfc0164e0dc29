//! Version-checked record access with bounded waits
//!
//! [`OptimisticStore`] wraps a blocking [`Repository`] for use from request
//! handlers. Each call runs on tokio's blocking pool under a deadline, so a
//! stalled database cannot pin a request forever. [`CatalogStore`] does the
//! same for filtered listings over a [`MovieCatalog`].
//!
//! The store never retries a [`StoreError::Conflict`]. Whether to re-read
//! and try again, or to hand the conflict back to the user, is the caller's
//! decision.

pub mod sqlite;

use crate::types::{MovieFilter, MoviePage};
use greenlight::{RecordError, Repository, VersionedRecord};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed store operation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("edit conflict")]
    Conflict,
    #[error("store operation `{operation}` exceeded its {timeout:?} deadline")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    /// Stored data broke a record invariant; continuing would spread the damage
    #[error("record invariant violated: {0}")]
    Invariant(String),
    #[error("store failure: {0}")]
    Backend(String),
}

impl From<RecordError> for StoreError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::NotFound => StoreError::NotFound,
            RecordError::Conflict => StoreError::Conflict,
            RecordError::Corrupt(msg) => StoreError::Invariant(msg),
            RecordError::Backend(msg) => StoreError::Backend(msg),
        }
    }
}

/// Async, deadline-bounded front for a [`Repository`]
pub struct OptimisticStore<P> {
    repository: Arc<dyn Repository<P>>,
    timeout: Duration,
}

impl<P> Clone for OptimisticStore<P> {
    fn clone(&self) -> Self {
        OptimisticStore {
            repository: Arc::clone(&self.repository),
            timeout: self.timeout,
        }
    }
}

impl<P: Send + 'static> OptimisticStore<P> {
    pub fn new(repository: Arc<dyn Repository<P>>, timeout: Duration) -> Self {
        OptimisticStore {
            repository,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read the current state of a record
    ///
    /// A record whose version is below 1 is reported as
    /// [`StoreError::Invariant`] rather than handed to the caller.
    pub async fn read(&self, id: i64) -> Result<VersionedRecord<P>, StoreError> {
        let record = self.run("read", move |repo| repo.fetch(id)).await?;
        record.check_version()?;
        Ok(record)
    }

    /// Store a new record at version 1
    pub async fn insert(&self, payload: P) -> Result<VersionedRecord<P>, StoreError> {
        self.run("insert", move |repo| repo.insert(payload)).await
    }

    /// Write `record` only if the stored version still equals `record.version`
    ///
    /// Returns the new version on success. Two writers holding the same
    /// version race; exactly one gets `version + 1`, the other
    /// [`StoreError::Conflict`].
    pub async fn conditional_update(&self, record: VersionedRecord<P>) -> Result<i64, StoreError> {
        if record.version < 1 {
            return Err(StoreError::Invariant(format!(
                "update of record {} carries version {}",
                record.id, record.version
            )));
        }
        self.run("update", move |repo| repo.update_if_version(&record))
            .await
    }

    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.run("delete", move |repo| repo.delete(id)).await
    }

    async fn run<T, F>(&self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Repository<P>) -> Result<T, RecordError> + Send + 'static,
    {
        let repository = Arc::clone(&self.repository);
        bounded(operation, self.timeout, move || op(repository.as_ref())).await
    }
}

/// Filtered, paged reads over stored movies
pub trait MovieCatalog: Send + Sync {
    fn list(&self, filter: &MovieFilter) -> Result<MoviePage, RecordError>;
}

/// Async, deadline-bounded front for a [`MovieCatalog`]
#[derive(Clone)]
pub struct CatalogStore {
    catalog: Arc<dyn MovieCatalog>,
    timeout: Duration,
}

impl CatalogStore {
    pub fn new(catalog: Arc<dyn MovieCatalog>, timeout: Duration) -> Self {
        CatalogStore { catalog, timeout }
    }

    /// One page of movies matching `filter`
    ///
    /// Like [`OptimisticStore::read`], a listed record with a version below 1
    /// is reported as [`StoreError::Invariant`].
    pub async fn list(&self, filter: MovieFilter) -> Result<MoviePage, StoreError> {
        let catalog = Arc::clone(&self.catalog);
        let page = bounded("list", self.timeout, move || catalog.list(&filter)).await?;
        for record in &page.records {
            record.check_version()?;
        }
        Ok(page)
    }
}

/// Run `op` on the blocking pool, giving up after `timeout`
async fn bounded<T, F>(operation: &'static str, timeout: Duration, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RecordError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(op);

    // On timeout the blocking call is abandoned, not interrupted
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result.map_err(StoreError::from),
        Ok(Err(join_error)) => {
            tracing::error!(operation, error = %join_error, "store task failed");
            Err(StoreError::Backend(format!(
                "{operation} task failed: {join_error}"
            )))
        }
        Err(_) => {
            tracing::warn!(operation, ?timeout, "store operation timed out");
            Err(StoreError::Timeout { operation, timeout })
        }
    }
}
