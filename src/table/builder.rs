use super::{
    ClusterWriter, ColumnWriter, NewColumnWriter, PairBuffer, PairTableWriter, RowWriter,
    TableSummary,
};
use crate::config::{StrategyPolicy, TableConfig};
use crate::storage::MultiFileStorage;
use crate::types::Strategy;
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// Average group size from which the Cluster layout pays off
const CLUSTER_MIN_AVG_GROUP: u64 = 16;

/// Writer that picks the layout of each table once it has seen all of it
pub struct TableBuilder {
    storage: Arc<MultiFileStorage>,
    config: TableConfig,
    buffer: PairBuffer,
}

impl TableBuilder {
    pub fn new(storage: Arc<MultiFileStorage>, config: TableConfig) -> Self {
        Self {
            storage,
            config,
            buffer: PairBuffer::new(),
        }
    }

    /// Layout for a buffered table under `policy`
    pub fn choose(policy: StrategyPolicy, buffer: &PairBuffer) -> Strategy {
        match policy {
            StrategyPolicy::Fixed(strategy) => strategy,
            StrategyPolicy::Adaptive { threshold } => {
                let n = buffer.len();
                let groups = buffer.n_groups().max(1);
                if n <= threshold {
                    Strategy::Row
                } else if groups == n {
                    Strategy::NewColumn
                } else if n / groups >= CLUSTER_MIN_AVG_GROUP {
                    Strategy::Cluster
                } else {
                    Strategy::Column
                }
            }
        }
    }

    /// Write `buffer` with the chosen layout. Single-blob layouts that do
    /// not fit in one file fall back to Row.
    pub(crate) fn write(
        storage: &MultiFileStorage,
        config: &TableConfig,
        buffer: &PairBuffer,
    ) -> Result<TableSummary> {
        let strategy = Self::choose(config.strategy, buffer);
        let written = match strategy {
            Strategy::Row => {
                return RowWriter::write(
                    storage,
                    config.row_compression,
                    config.first_index_size,
                    buffer,
                )
            }
            Strategy::Column => ColumnWriter::write(storage, buffer),
            Strategy::Cluster => ClusterWriter::write(storage, config, buffer),
            Strategy::NewColumn => NewColumnWriter::write(storage, buffer),
        };

        match written {
            Err(e) if e.is_resource_exhausted() => {
                debug!(
                    strategy = strategy.name(),
                    rows = buffer.len(),
                    "table.fallback_to_row"
                );
                RowWriter::write(
                    storage,
                    config.row_compression,
                    config.first_index_size,
                    buffer,
                )
            }
            other => other,
        }
    }
}

impl PairTableWriter for TableBuilder {
    fn start_append(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn append(&mut self, t1: i64, t2: i64) -> Result<()> {
        self.buffer.push(t1, t2)
    }

    fn stop_append(&mut self) -> Result<TableSummary> {
        let summary = Self::write(&self.storage, &self.config, &self.buffer)?;
        debug!(
            strategy = summary.strategy.name(),
            rows = summary.n_elements,
            groups = summary.n_groups,
            file = summary.file,
            offset = summary.offset,
            "table.write"
        );
        self.buffer.clear();
        Ok(summary)
    }
}
