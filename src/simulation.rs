use std::collections::BTreeMap;
use std::thread;
use std::time::{Instant, SystemTime};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::booking::{BookingResult, BookingSimulator, BookingStatus};
use crate::config::SimulationConfig;
use crate::errors::{LabError, Result};
use crate::fixtures::{product, AVAILABLE_QUANTITY, RESERVED_QUANTITY};
use crate::isolation::IsolationLevel;
use crate::report::{ComparisonRow, IsolationComparison};
use crate::session::{CancellationToken, TransactionSession};

/// Contention class of a failed booking, recognised from its error text so
/// the counters work for any collaborator's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionKind {
    Deadlock,
    Serialization,
}

impl ContentionKind {
    pub fn classify(notes: &str) -> Option<ContentionKind> {
        let notes = notes.to_lowercase();
        if notes.contains("deadlock") || notes.contains("lock wait") {
            Some(ContentionKind::Deadlock)
        } else if notes.contains("serializ") {
            Some(ContentionKind::Serialization)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentionCounters {
    pub deadlocks: u64,
    pub serialization_failures: u64,
    pub races_lost: u64,
}

impl ContentionCounters {
    pub fn total(&self) -> u64 {
        self.deadlocks + self.serialization_failures + self.races_lost
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: SystemTime,
    pub end: SystemTime,
}

/// Outcome of one load run, reduced once after every worker has finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub isolation_level: IsolationLevel,
    pub total_operations: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub insufficient_stock: u64,
    /// Bookings with status `Failed`, timeouts included.
    pub failed: u64,
    pub timeouts: u64,
    pub contention: ContentionCounters,
    pub latency: LatencyStats,
    pub window: TimeWindow,
    pub initial_stock: i64,
    /// Stock read back after the run, if the collaborator still answered.
    pub final_stock: Option<i64>,
    pub units_booked: i64,
    pub extra_metrics: BTreeMap<String, f64>,
}

impl SimulationSummary {
    pub fn contention_event_count(&self) -> u64 {
        self.contention.total()
    }
}

/// Single-pass reduction over booking results.
#[derive(Debug, Default)]
pub struct Aggregator {
    total: u64,
    success: u64,
    insufficient_stock: u64,
    failed: u64,
    timeouts: u64,
    contention: ContentionCounters,
    units_booked: i64,
    /// Operations that actually ran; only these contribute latency.
    timed: u64,
    latency_sum_ms: f64,
    latency_min_ms: Option<f64>,
    latency_max_ms: f64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: &BookingResult) {
        self.total += 1;
        match result.status {
            BookingStatus::Success => {
                self.success += 1;
                self.units_booked += result.actual_quantity;
            }
            BookingStatus::InsufficientStock => self.insufficient_stock += 1,
            BookingStatus::RaceLost => self.contention.races_lost += 1,
            BookingStatus::Failed => {
                self.failed += 1;
                if result.issue_notes.starts_with("timeout") {
                    self.timeouts += 1;
                }
                match ContentionKind::classify(&result.issue_notes) {
                    Some(ContentionKind::Deadlock) => self.contention.deadlocks += 1,
                    Some(ContentionKind::Serialization) => {
                        self.contention.serialization_failures += 1
                    }
                    None => {}
                }
            }
        }

        let Some(ms) = result.execution_time_ms else {
            return;
        };
        self.timed += 1;
        self.latency_sum_ms += ms;
        self.latency_min_ms = Some(self.latency_min_ms.map_or(ms, |min| min.min(ms)));
        self.latency_max_ms = self.latency_max_ms.max(ms);
    }

    pub fn finish(self, level: IsolationLevel, window: TimeWindow) -> SimulationSummary {
        let avg_ms = if self.timed == 0 {
            0.0
        } else {
            self.latency_sum_ms / self.timed as f64
        };

        let mut extra_metrics = BTreeMap::new();
        extra_metrics.insert("total_response_time_ms".to_string(), self.latency_sum_ms);
        extra_metrics.insert("timed_operations".to_string(), self.timed as f64);

        SimulationSummary {
            isolation_level: level,
            total_operations: self.total,
            success_count: self.success,
            failure_count: self.total - self.success,
            insufficient_stock: self.insufficient_stock,
            failed: self.failed,
            timeouts: self.timeouts,
            contention: self.contention,
            latency: LatencyStats {
                avg_ms,
                min_ms: self.latency_min_ms.unwrap_or_default(),
                max_ms: self.latency_max_ms,
            },
            window,
            initial_stock: 0,
            final_stock: None,
            units_booked: self.units_booked,
            extra_metrics,
        }
    }
}

struct Job {
    index: usize,
    requester_id: u64,
    quantity: i64,
}

/// Drives many bookings of one product from a fixed pool of worker threads.
pub struct LoadSimulator {
    booking: BookingSimulator,
    sessions: TransactionSession,
    config: SimulationConfig,
}

impl LoadSimulator {
    pub fn new(
        booking: BookingSimulator,
        sessions: TransactionSession,
        config: SimulationConfig,
    ) -> Self {
        Self {
            booking,
            sessions,
            config,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Resets the product's stock, then runs `operation_count` bookings on
    /// `worker_count` threads at `level`.
    ///
    /// Operations still unfinished at the configured deadline are cancelled
    /// and counted as timed-out failures. Cancellation is cooperative, so the
    /// call can return later than the deadline: a booking blocked inside the
    /// collaborator finishes its current call first, which takes up to the
    /// collaborator's lock wait timeout plus one round trip. Operations that
    /// never started count toward the totals but not toward latency.
    ///
    /// # Errors
    ///
    /// [`LabError::InvalidInput`] for a zero worker count, and any error that
    /// kept the stock from being reset. Individual booking failures are
    /// counted, not returned.
    pub fn simulate(
        &self,
        worker_count: usize,
        operation_count: usize,
        level: IsolationLevel,
    ) -> Result<SimulationSummary> {
        if worker_count == 0 {
            return Err(LabError::InvalidInput(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.config.min_quantity <= 0 || self.config.min_quantity > self.config.max_quantity {
            return Err(LabError::InvalidInput(format!(
                "quantity range {}..={} is empty or not positive",
                self.config.min_quantity, self.config.max_quantity
            )));
        }

        info!(
            "Simulating {} bookings on {} workers at {}",
            operation_count, worker_count, level
        );
        self.reset_stock()?;

        let resource_id = self.config.resource_id;
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let (job_tx, job_rx) = unbounded();
        for index in 0..operation_count {
            let job = Job {
                index,
                requester_id: (index % worker_count) as u64 + 1,
                quantity: rng.random_range(self.config.min_quantity..=self.config.max_quantity),
            };
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        let token = CancellationToken::new();
        let booking = self.booking.with_cancellation(token.clone());
        let (result_tx, result_rx) = unbounded::<(usize, BookingResult)>();
        let mut slots: Vec<Option<BookingResult>> = vec![None; operation_count];

        let start = SystemTime::now();
        let deadline = Instant::now() + self.config.deadline;
        thread::scope(|s| {
            for _ in 0..worker_count.min(operation_count) {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                let booking = &booking;
                let token = &token;
                s.spawn(move || {
                    for job in jobs.iter() {
                        let result = if token.is_cancelled() {
                            BookingResult::failed(
                                resource_id,
                                job.requester_id,
                                job.quantity,
                                level,
                                LabError::Cancelled.to_string(),
                            )
                        } else {
                            booking.book(resource_id, job.requester_id, job.quantity, level)
                        };
                        if results.send((job.index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            loop {
                match result_rx.recv_deadline(deadline) {
                    Ok((index, result)) => slots[index] = Some(result),
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            "Simulation deadline of {:?} passed, cancelling remaining bookings",
                            self.config.deadline
                        );
                        token.cancel();
                        for (index, result) in result_rx.iter() {
                            slots[index] = Some(result);
                        }
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        let end = SystemTime::now();

        let mut aggregator = Aggregator::new();
        for (index, slot) in slots.into_iter().enumerate() {
            let result = slot.unwrap_or_else(|| {
                BookingResult::failed(
                    resource_id,
                    (index % worker_count) as u64 + 1,
                    0,
                    level,
                    LabError::Cancelled.to_string(),
                )
            });
            aggregator.record(&result);
        }

        let mut summary = aggregator.finish(level, TimeWindow { start, end });
        summary.initial_stock = self.config.initial_stock;
        summary.final_stock = match self.read_stock() {
            Ok(stock) => Some(stock),
            Err(e) => {
                warn!("Could not read final stock: {}", e);
                None
            }
        };
        summary
            .extra_metrics
            .insert("thread_pool_size".to_string(), worker_count as f64);
        summary
            .extra_metrics
            .insert("product_id".to_string(), resource_id as f64);

        info!(
            "{}: {}/{} succeeded, {} contention events, final stock {:?}",
            level,
            summary.success_count,
            summary.total_operations,
            summary.contention_event_count(),
            summary.final_stock
        );
        Ok(summary)
    }

    /// Runs the same workload once per isolation level, weakest first.
    pub fn compare_isolation_levels(
        &self,
        worker_count: usize,
        operation_count: usize,
    ) -> Result<IsolationComparison> {
        let mut comparison = IsolationComparison::default();
        for level in IsolationLevel::ALL {
            let summary = self.simulate(worker_count, operation_count, level)?;
            comparison.rows.push(ComparisonRow::from_summary(&summary));
        }
        Ok(comparison)
    }

    fn reset_stock(&self) -> Result<()> {
        let item = product(self.config.resource_id);
        let stock = self.config.initial_stock;
        let outcome = self.sessions.run(IsolationLevel::ReadCommitted, |scope| {
            scope.write_field(&item, AVAILABLE_QUANTITY, stock)?;
            scope.write_field(&item, RESERVED_QUANTITY, 0_i64)?;
            Ok(())
        })?;
        match outcome.error {
            Some(e) => Err(e),
            None => {
                debug!("Stock of {} reset to {}", item, stock);
                Ok(())
            }
        }
    }

    fn read_stock(&self) -> Result<i64> {
        let item = product(self.config.resource_id);
        let outcome = self.sessions.run(IsolationLevel::ReadCommitted, |scope| {
            scope.read(&item, AVAILABLE_QUANTITY)?.as_i64()
        })?;
        match (outcome.value, outcome.error) {
            (Some(stock), _) => Ok(stock),
            (None, Some(e)) => Err(e),
            (None, None) => Err(LabError::Other("stock read returned nothing".to_string())),
        }
    }
}
