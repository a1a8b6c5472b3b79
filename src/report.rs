use std::sync::Arc;

use arrow::array::builder::{Float64Builder, Int64Builder, StringBuilder};
use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::isolation::IsolationLevel;
use crate::simulation::SimulationSummary;

/// One isolation level's line in a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub level: IsolationLevel,
    pub total_operations: u64,
    pub success_count: u64,
    /// Percentage of operations that succeeded, 0 when nothing ran.
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub deadlocks: u64,
    pub serialization_failures: u64,
    pub races_lost: u64,
}

impl ComparisonRow {
    pub fn from_summary(summary: &SimulationSummary) -> Self {
        let success_rate = if summary.total_operations == 0 {
            0.0
        } else {
            summary.success_count as f64 * 100.0 / summary.total_operations as f64
        };
        Self {
            level: summary.isolation_level,
            total_operations: summary.total_operations,
            success_count: summary.success_count,
            success_rate,
            avg_latency_ms: summary.latency.avg_ms,
            deadlocks: summary.contention.deadlocks,
            serialization_failures: summary.contention.serialization_failures,
            races_lost: summary.contention.races_lost,
        }
    }
}

/// Results of running the same workload once per isolation level, weakest
/// first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IsolationComparison {
    pub rows: Vec<ComparisonRow>,
}

impl IsolationComparison {
    pub fn row(&self, level: IsolationLevel) -> Option<&ComparisonRow> {
        self.rows.iter().find(|r| r.level == level)
    }

    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("isolation_level", DataType::Utf8, false),
            Field::new("total_operations", DataType::Int64, false),
            Field::new("success_count", DataType::Int64, false),
            Field::new("success_rate", DataType::Float64, false),
            Field::new("avg_latency_ms", DataType::Float64, false),
            Field::new("deadlocks", DataType::Int64, false),
            Field::new("serialization_failures", DataType::Int64, false),
            Field::new("races_lost", DataType::Int64, false),
        ]))
    }

    /// Tabulates the comparison, one row per level.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let capacity = self.rows.len();
        let mut level = StringBuilder::with_capacity(capacity, capacity * 16);
        let mut total = Int64Builder::with_capacity(capacity);
        let mut success = Int64Builder::with_capacity(capacity);
        let mut success_rate = Float64Builder::with_capacity(capacity);
        let mut latency = Float64Builder::with_capacity(capacity);
        let mut deadlocks = Int64Builder::with_capacity(capacity);
        let mut serialization = Int64Builder::with_capacity(capacity);
        let mut races = Int64Builder::with_capacity(capacity);

        for row in &self.rows {
            level.append_value(row.level.sql_name());
            total.append_value(row.total_operations as i64);
            success.append_value(row.success_count as i64);
            success_rate.append_value(row.success_rate);
            latency.append_value(row.avg_latency_ms);
            deadlocks.append_value(row.deadlocks as i64);
            serialization.append_value(row.serialization_failures as i64);
            races.append_value(row.races_lost as i64);
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(level.finish()),
            Arc::new(total.finish()),
            Arc::new(success.finish()),
            Arc::new(success_rate.finish()),
            Arc::new(latency.finish()),
            Arc::new(deadlocks.finish()),
            Arc::new(serialization.finish()),
            Arc::new(races.finish()),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }
}
