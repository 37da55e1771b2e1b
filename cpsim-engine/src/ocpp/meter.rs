//! Periodic meter value emission
//!
//! While a transaction is charging, a background task wakes every meter
//! interval and asks the session for one MeterValues CALL. The task owns no
//! session state: each tick hands a [`MeterTick`] back to a callback that
//! runs inside the session lock and either returns the delay to the next
//! tick or `None` to end the task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;

use super::types::*;

/// Identity of one emitter run, checked by the session on every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterTick {
    pub epoch: u64,
    pub connector_id: u32,
    pub transaction_id: i64,
}

/// Handle to the running meter task, if any.
///
/// Stopping bumps the epoch, so a tick that was already waiting on the
/// session lock when `stop` ran is refused once it gets in.
#[derive(Debug, Default)]
pub struct MeterEmitter {
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

impl MeterEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin emitting. Any previous run is cancelled first.
    pub fn start<F>(&mut self, connector_id: u32, transaction_id: i64, interval: Duration, mut on_tick: F)
    where
        F: FnMut(MeterTick) -> Option<Duration> + Send + 'static,
    {
        self.stop();

        let tick = MeterTick {
            epoch: self.epoch,
            connector_id,
            transaction_id,
        };
        self.task = Some(tokio::spawn(async move {
            let mut delay = interval;
            loop {
                tokio::time::sleep(delay).await;
                match on_tick(tick) {
                    Some(next) => delay = next,
                    None => break,
                }
            }
        }));
    }

    /// Cancel the current run. Idempotent; returns whether a task was running.
    pub fn stop(&mut self) -> bool {
        self.epoch += 1;
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Whether `tick` belongs to the current run
    pub fn is_current(&self, tick: &MeterTick) -> bool {
        self.task.is_some() && tick.epoch == self.epoch
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for MeterEmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One energy register reading, built fresh for each MeterValues frame
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSample {
    pub timestamp: DateTime<Utc>,
    pub value: String,
    pub unit: UnitOfMeasure,
    pub measurand: Measurand,
    pub context: ReadingContext,
}

impl MeterSample {
    /// Periodic Energy.Active.Import.Register sample in kWh
    pub fn energy_register(energy_kwh: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            value: format!("{:.2}", energy_kwh),
            unit: UnitOfMeasure::KWh,
            measurand: Measurand::EnergyActiveImportRegister,
            context: ReadingContext::SamplePeriodic,
        }
    }

    pub fn into_meter_value(self) -> MeterValue {
        MeterValue {
            timestamp: self.timestamp,
            sampled_value: vec![SampledValue {
                value: self.value,
                unit: self.unit,
                measurand: self.measurand,
                context: self.context,
            }],
        }
    }
}

/// Advance the simulated register by 0.01 to 0.50 kWh
pub fn next_energy_reading<R: Rng + ?Sized>(previous_kwh: f64, rng: &mut R) -> f64 {
    previous_kwh + rng.gen_range(0.01..=0.50)
}

/// MeterValues payload for one sample
pub fn meter_values_request(
    connector_id: u32,
    transaction_id: i64,
    sample: MeterSample,
) -> MeterValuesRequest {
    MeterValuesRequest {
        connector_id,
        transaction_id,
        meter_value: vec![sample.into_meter_value()],
    }
}
