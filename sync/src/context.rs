//! Handles shared by the sync components.

use crate::backend::SharedBackend;
use crate::error::SyncResult;
use crate::row_index::RowIndex;
use crate::scheduler::RequestScheduler;
use checkin_engine::{row, LocalStore, RawRow};
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct SyncContext {
    pub store: Arc<LocalStore>,
    pub backend: SharedBackend,
    pub scheduler: RequestScheduler,
    pub rows: Arc<RowIndex>,
}

impl SyncContext {
    pub fn new(store: Arc<LocalStore>, backend: SharedBackend, scheduler: RequestScheduler) -> Self {
        Self {
            store,
            backend,
            scheduler,
            rows: Arc::new(RowIndex::new()),
        }
    }

    /// Read every data row through the lane, refreshing the row index in the
    /// same job.
    pub async fn read_rows(&self, name: &'static str) -> SyncResult<Vec<RawRow>> {
        self.read_indexed(name).await.map(|(rows, _)| rows)
    }

    /// Like [`read_rows`](Self::read_rows), also returning the row index
    /// generation the read produced.
    pub async fn read_indexed(&self, name: &'static str) -> SyncResult<(Vec<RawRow>, u64)> {
        let ctx = self.clone();
        self.scheduler
            .submit(name, move || {
                let ctx = ctx.clone();
                async move {
                    let rows = ctx.backend.read_all().await?;
                    ctx.rows.replace(row::index(&rows), rows.len());
                    Ok((rows, ctx.rows.generation()))
                }
            })
            .await
    }
}
