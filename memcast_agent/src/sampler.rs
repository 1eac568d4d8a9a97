//! Background sampler: reads host memory on a fixed period and pushes each
//! snapshot into the distribution channel, in order.

use chrono::Local;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::SamplingError;
use crate::types::Snapshot;

/// Anything that can produce a memory snapshot on demand.
pub trait MemorySource: Send + 'static {
    fn sample(&mut self) -> Result<Snapshot, SamplingError>;
}

/// Host memory via sysinfo. Only RAM counters are refreshed.
pub struct SystemMemory {
    sys: System,
}

impl SystemMemory {
    pub fn new() -> Self {
        let kind = RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram());
        Self {
            sys: System::new_with_specifics(kind),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SystemMemory {
    fn sample(&mut self) -> Result<Snapshot, SamplingError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(SamplingError::Unsupported);
        }
        self.sys
            .refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        let total = self.sys.total_memory();
        if total == 0 {
            return Err(SamplingError::Empty);
        }
        Ok(Snapshot::from_bytes(
            total,
            self.sys.used_memory(),
            self.sys.free_memory(),
            Local::now(),
        ))
    }
}

/// Spawn the sampling loop.
///
/// A failed sample skips that tick only. When `viewers` is given, sampling
/// pauses while the count is zero and resumes immediately once someone
/// connects. The loop ends when the receiving side of `tx` is dropped.
pub fn spawn_sampler<M: MemorySource>(
    mut source: M,
    tx: mpsc::Sender<Snapshot>,
    mut viewers: Option<watch::Receiver<usize>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(rx) = viewers.as_mut() {
                let idle = *rx.borrow_and_update() == 0;
                if idle {
                    debug!("no viewers connected, sampler idle");
                    let woke = rx.wait_for(|n| *n > 0).await.is_ok();
                    if !woke {
                        break;
                    }
                    ticker.reset_immediately();
                }
            }

            ticker.tick().await;

            match source.sample() {
                Ok(snapshot) => {
                    // Blocks while the channel is full; order is preserved.
                    if tx.send(snapshot).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "skipping sample tick"),
            }
        }
        info!("sampler stopped");
    })
}
