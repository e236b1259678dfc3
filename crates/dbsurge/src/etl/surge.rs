//! Surge: batched, fault-tolerant bulk DML over a [`Table`].
//!
//! Streams records from a source iterable, resolves each through the
//! table pipeline, batches the bound payloads, and drives them through
//! the driver's batch call. Batch-level failures under the `continue`
//! policy fall back to per-row execution so one bad row cannot sink its
//! batch. Databases without a batchable upsert get the temp-table merge
//! strategy.

use tracing::{debug, error, info};

use crate::core::record::Record;
use crate::dialect::{
    create_temp_table_sql, drop_temp_table_sql, temp_table_name, truncate_temp_table_sql,
    MergeFlavor, Params,
};
use crate::error::{EtlError, Result};
use crate::etl::column::Operation;
use crate::etl::table::Table;

/// Transaction handling for a bulk run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// No explicit transaction; the driver's autocommit applies.
    #[default]
    None,
    /// One transaction around the whole run; rolled back on abort.
    Run,
    /// One transaction per batch flush.
    Batch,
}

/// What to do when a row or batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Isolate failing rows, count them, keep going.
    #[default]
    Continue,
    /// Stop the run on the first failure.
    Abort,
}

/// Cumulative progress counters reported to the progress sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub merged: u64,
    pub incomplete: u64,
    pub error: u64,
}

/// Callback receiving cumulative progress after each flush and at end
/// of run.
pub type ProgressSink = Box<dyn FnMut(&Progress) + Send>;

const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Bulk driver wrapping a [`Table`].
pub struct Surge {
    table: Table,
    batch_size: usize,
    tx_mode: TransactionMode,
    policy: ErrorPolicy,
    sink: Option<ProgressSink>,
    processed: u64,
}

impl Surge {
    /// Wrap a table with default settings: batch size 1 000, no
    /// transaction, `continue` error policy.
    #[must_use]
    pub fn new(table: Table) -> Self {
        Surge {
            table,
            batch_size: DEFAULT_BATCH_SIZE,
            tx_mode: TransactionMode::default(),
            policy: ErrorPolicy::default(),
            sink: None,
            processed: 0,
        }
    }

    /// Set the number of rows per batch flush.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the transaction mode.
    #[must_use]
    pub fn with_transaction(mut self, mode: TransactionMode) -> Self {
        self.tx_mode = mode;
        self
    }

    /// Set the on-error policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attach a progress sink.
    #[must_use]
    pub fn with_progress(mut self, sink: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// The wrapped table.
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Release the wrapped table.
    #[must_use]
    pub fn into_table(self) -> Table {
        self.table
    }

    /// Cumulative progress so far.
    #[must_use]
    pub fn progress(&self) -> Progress {
        let counts = self.table.counts();
        Progress {
            processed: self.processed,
            inserted: counts.insert,
            updated: counts.update,
            deleted: counts.delete,
            merged: counts.merge,
            incomplete: counts.incomplete,
            error: counts.error,
        }
    }

    fn emit_progress(&mut self) {
        let progress = self.progress();
        if let Some(sink) = &mut self.sink {
            sink(&progress);
        }
    }

    /// Bulk INSERT of every record in the source.
    pub async fn insert(
        &mut self,
        source: impl IntoIterator<Item = Record>,
    ) -> Result<Progress> {
        self.run(Operation::Insert, source).await
    }

    /// Bulk UPDATE by key columns.
    pub async fn update(
        &mut self,
        source: impl IntoIterator<Item = Record>,
    ) -> Result<Progress> {
        self.run(Operation::Update, source).await
    }

    /// Bulk DELETE by key columns.
    pub async fn delete(
        &mut self,
        source: impl IntoIterator<Item = Record>,
    ) -> Result<Progress> {
        self.run(Operation::Delete, source).await
    }

    /// Bulk MERGE (upsert).
    ///
    /// Uses the database's batchable upsert when available; otherwise
    /// batches are staged through a session temp table and applied with
    /// one native MERGE (or delete+insert) per flush.
    pub async fn merge(
        &mut self,
        source: impl IntoIterator<Item = Record>,
    ) -> Result<Progress> {
        if self.table.merge_flavor() == MergeFlavor::Upsert {
            self.run(Operation::Merge, source).await
        } else {
            self.merge_via_temp_table(source).await
        }
    }

    // -----------------------------------------------------------------
    // Standard batched path
    // -----------------------------------------------------------------

    async fn run(
        &mut self,
        op: Operation,
        source: impl IntoIterator<Item = Record>,
    ) -> Result<Progress> {
        let sql = self.table.sql(op)?;
        self.begin_run().await?;

        let result = self.drive(op, &sql, source).await;
        self.finish_run(result).await?;

        let progress = self.progress();
        info!(
            table = self.table.name(),
            op = %op,
            processed = progress.processed,
            completed = self.table.counts().get(op),
            incomplete = progress.incomplete,
            errors = progress.error,
            "bulk run finished"
        );
        self.emit_progress();
        Ok(progress)
    }

    async fn drive(
        &mut self,
        op: Operation,
        sql: &str,
        source: impl IntoIterator<Item = Record>,
    ) -> Result<()> {
        let mut batch: Vec<Params> = Vec::with_capacity(self.batch_size);
        for record in source {
            self.processed += 1;
            if let Err(e) = self.table.set_values(&record).await {
                if self.policy == ErrorPolicy::Abort {
                    return Err(e);
                }
                continue;
            }
            if !self.table.is_ready(op) {
                self.table.note_incomplete();
                self.emit_progress();
                continue;
            }
            batch.push(self.table.bind_params(op)?);
            if batch.len() >= self.batch_size {
                self.flush(op, sql, &mut batch).await?;
            }
        }
        if !batch.is_empty() {
            self.flush(op, sql, &mut batch).await?;
        }
        Ok(())
    }

    /// Flush one batch, isolating per-row failures under `continue`.
    async fn flush(&mut self, op: Operation, sql: &str, batch: &mut Vec<Params>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.tx_mode == TransactionMode::Batch {
            self.table.cursor().connection().begin().await?;
        }

        let outcome = self
            .table
            .cursor_mut()
            .execute_many_bound(sql, batch)
            .await;
        match outcome {
            Ok(_) => {
                self.table.note_success(op, batch.len() as u64);
            }
            Err(e) if self.policy == ErrorPolicy::Abort => {
                if self.tx_mode == TransactionMode::Batch {
                    self.table.cursor().connection().rollback().await?;
                }
                return Err(e);
            }
            Err(e) => {
                // Batch-level failure: re-execute row by row to isolate
                // the offenders.
                error!(
                    table = self.table.name(),
                    op = %op,
                    rows = batch.len(),
                    "batch failed ({e}); isolating per row"
                );
                for params in batch.iter() {
                    match self.table.cursor_mut().execute_raw(sql, params).await {
                        Ok(_) => self.table.note_success(op, 1),
                        Err(row_err) => {
                            error!(table = self.table.name(), op = %op, "row failed: {row_err}");
                            self.table.note_error(1);
                        }
                    }
                }
            }
        }

        if self.tx_mode == TransactionMode::Batch {
            self.table.cursor().connection().commit().await?;
        }
        batch.clear();
        self.emit_progress();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Temp-table merge strategy
    // -----------------------------------------------------------------

    async fn merge_via_temp_table(
        &mut self,
        source: impl IntoIterator<Item = Record>,
    ) -> Result<Progress> {
        let db = self.table.cursor().db_type();
        let temp = temp_table_name(db, self.table.name());
        let columns: Vec<String> = self
            .table
            .column_names()
            .iter()
            .map(ToString::to_string)
            .collect();

        let create_sql = create_temp_table_sql(db, &temp, self.table.name(), &columns);
        self.table
            .cursor_mut()
            .execute_raw(&create_sql, &Params::None)
            .await
            .map_err(|e| {
                EtlError::Resource(format!("temp table creation failed for {temp}: {e}"))
            })?;
        debug!(table = self.table.name(), temp = %temp, "staged merge temp table created");

        self.begin_run().await?;
        let result = self.drive_temp_merge(&temp, source).await;
        let finish = self.finish_run(result).await;

        // The temp table is dropped on success and failure alike.
        let drop_sql = drop_temp_table_sql(db, &temp);
        let dropped = self
            .table
            .cursor_mut()
            .execute_raw(&drop_sql, &Params::None)
            .await;
        finish?;
        dropped.map_err(|e| EtlError::Resource(format!("temp table drop failed for {temp}: {e}")))?;

        let progress = self.progress();
        info!(
            table = self.table.name(),
            op = "merge",
            strategy = "temp-table",
            processed = progress.processed,
            merged = progress.merged,
            incomplete = progress.incomplete,
            errors = progress.error,
            "bulk run finished"
        );
        self.emit_progress();
        Ok(progress)
    }

    async fn drive_temp_merge(
        &mut self,
        temp: &str,
        source: impl IntoIterator<Item = Record>,
    ) -> Result<()> {
        let insert_plan = self.table.temp_insert_plan(temp)?;
        let apply: TempApply = match self.table.merge_flavor() {
            MergeFlavor::DeleteInsert => {
                let (delete, insert) = self.table.delete_insert_from_temp_sql(temp)?;
                TempApply::DeleteInsert { delete, insert }
            }
            _ => TempApply::Merge {
                sql: self.table.merge_from_temp_sql(temp)?,
            },
        };
        let truncate_sql = truncate_temp_table_sql(temp);

        let mut batch: Vec<Params> = Vec::with_capacity(self.batch_size);
        for record in source {
            self.processed += 1;
            if let Err(e) = self.table.set_values(&record).await {
                if self.policy == ErrorPolicy::Abort {
                    return Err(e);
                }
                continue;
            }
            if !self.table.is_ready(Operation::Merge) {
                self.table.note_incomplete();
                self.emit_progress();
                continue;
            }
            batch.push(self.table.bind_into(&insert_plan));
            if batch.len() >= self.batch_size {
                self.flush_temp_merge(&insert_plan, &apply, &truncate_sql, &mut batch)
                    .await?;
            }
        }
        if !batch.is_empty() {
            self.flush_temp_merge(&insert_plan, &apply, &truncate_sql, &mut batch)
                .await?;
        }
        Ok(())
    }

    /// Stage a batch into the temp table, apply it to the target, and
    /// truncate the staging area.
    async fn flush_temp_merge(
        &mut self,
        insert_plan: &crate::dialect::TranslatedQuery,
        apply: &TempApply,
        truncate_sql: &str,
        batch: &mut Vec<Params>,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.tx_mode == TransactionMode::Batch {
            self.table.cursor().connection().begin().await?;
        }

        let mut staged = batch.len() as u64;
        let stage = self
            .table
            .cursor_mut()
            .execute_many_bound(insert_plan.sql(), batch)
            .await;
        match stage {
            Ok(_) => {}
            Err(e) if self.policy == ErrorPolicy::Abort => {
                if self.tx_mode == TransactionMode::Batch {
                    self.table.cursor().connection().rollback().await?;
                }
                return Err(e);
            }
            Err(e) => {
                error!(
                    table = self.table.name(),
                    rows = batch.len(),
                    "staging batch failed ({e}); isolating per row"
                );
                staged = 0;
                for params in batch.iter() {
                    match self
                        .table
                        .cursor_mut()
                        .execute_raw(insert_plan.sql(), params)
                        .await
                    {
                        Ok(_) => staged += 1,
                        Err(row_err) => {
                            error!(table = self.table.name(), "row failed: {row_err}");
                            self.table.note_error(1);
                        }
                    }
                }
            }
        }

        if staged > 0 {
            match apply {
                TempApply::Merge { sql } => {
                    self.table.cursor_mut().execute_raw(sql, &Params::None).await?;
                }
                TempApply::DeleteInsert { delete, insert } => {
                    self.table
                        .cursor_mut()
                        .execute_raw(delete, &Params::None)
                        .await?;
                    self.table
                        .cursor_mut()
                        .execute_raw(insert, &Params::None)
                        .await?;
                }
            }
            self.table.note_success(Operation::Merge, staged);
        }

        self.table
            .cursor_mut()
            .execute_raw(truncate_sql, &Params::None)
            .await
            .map_err(|e| EtlError::Resource(format!("temp table truncate failed: {e}")))?;

        if self.tx_mode == TransactionMode::Batch {
            self.table.cursor().connection().commit().await?;
        }
        batch.clear();
        self.emit_progress();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Transaction helpers
    // -----------------------------------------------------------------

    async fn begin_run(&mut self) -> Result<()> {
        if self.tx_mode == TransactionMode::Run {
            self.table.cursor().connection().begin().await?;
        }
        Ok(())
    }

    /// Close the run transaction: commit on success, roll back on abort.
    async fn finish_run(&mut self, result: Result<()>) -> Result<()> {
        if self.tx_mode == TransactionMode::Run {
            match &result {
                Ok(()) => self.table.cursor().connection().commit().await?,
                Err(_) => self.table.cursor().connection().rollback().await?,
            }
        }
        result
    }
}

enum TempApply {
    Merge { sql: String },
    DeleteInsert { delete: String, insert: String },
}
