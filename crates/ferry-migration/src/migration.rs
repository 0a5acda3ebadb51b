//! Live migration over an asynchronous byte stream.
//!
//! The controller and every entity write synchronously into an in-memory channel; the driver
//! drains that buffer into the sink between phases, which is where the task yields. Pacing uses
//! the channel's rate limit, refilled once per `buffer_delay` tick.

use std::time::Duration;

use ferry_vmstate::{Channel, MemTransport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::config::MigrationParams;
use crate::error::Result;
use crate::registry::{IterationStatus, Registry};
use crate::savevm::{
    loadvm_state, savevm_state_begin, savevm_state_blocked, savevm_state_cancel,
    savevm_state_cleanup, savevm_state_complete, savevm_state_iterate, savevm_state_pending,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    /// Bytes written to the sink.
    pub total_bytes: u64,
    pub iterations: u64,
    pub duration: Duration,
    /// Time between stopping the guest and the last byte reaching the sink.
    pub downtime: Duration,
}

struct Staging {
    ch: Channel,
    mem: MemTransport,
}

impl Staging {
    fn new(rate_limit: u64) -> Self {
        let mem = MemTransport::new();
        let mut ch = Channel::new_writer(mem.clone());
        ch.set_rate_limit(rate_limit);
        Self { ch, mem }
    }

    /// Move everything staged so far into `sink`. Live entities are cancelled on failure.
    async fn drain<W>(
        &mut self,
        registry: &mut Registry,
        sink: &mut W,
        stats: &mut MigrationStats,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.write_out(sink, stats).await;
        if result.is_err() {
            savevm_state_cancel(registry);
        }
        result
    }

    async fn write_out<W>(&mut self, sink: &mut W, stats: &mut MigrationStats) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.ch.flush();
        self.ch.check_error()?;
        let bytes = self.mem.take();
        if !bytes.is_empty() {
            sink.write_all(&bytes).await?;
            stats.total_bytes += bytes.len() as u64;
        }
        Ok(())
    }
}

/// Migrate every registered entity to `sink` while the guest keeps running.
///
/// `stop_guest` is called once, right before the final pass. Cleanup callbacks run whether or
/// not the migration succeeds.
pub async fn migrate<W, F>(
    registry: &mut Registry,
    params: &MigrationParams,
    sink: &mut W,
    stop_guest: F,
) -> Result<MigrationStats>
where
    W: AsyncWrite + Unpin,
    F: FnOnce(),
{
    savevm_state_blocked(registry)?;

    tracing::info!(
        max_bandwidth = params.max_bandwidth,
        downtime_limit_ms = params.downtime_limit,
        "migration started"
    );
    let result = run(registry, params, sink, stop_guest).await;
    savevm_state_cleanup(registry);

    match &result {
        Ok(stats) => tracing::info!(
            total_bytes = stats.total_bytes,
            iterations = stats.iterations,
            duration_ms = stats.duration.as_millis() as u64,
            downtime_ms = stats.downtime.as_millis() as u64,
            "migration completed"
        ),
        Err(err) => tracing::warn!(%err, "migration failed"),
    }
    result
}

async fn run<W, F>(
    registry: &mut Registry,
    params: &MigrationParams,
    sink: &mut W,
    stop_guest: F,
) -> Result<MigrationStats>
where
    W: AsyncWrite + Unpin,
    F: FnOnce(),
{
    let start = Instant::now();
    let mut stats = MigrationStats::default();
    let mut staging = Staging::new(params.bytes_per_tick());
    let buffer_delay = Duration::from_millis(params.buffer_delay);
    let max_size = params.max_downtime_bytes();

    savevm_state_begin(registry, &mut staging.ch)?;
    staging.drain(registry, sink, &mut stats).await?;

    let mut tick = Instant::now();
    loop {
        if tick.elapsed() >= buffer_delay {
            staging.ch.reset_rate_limit();
            tick = Instant::now();
        }
        if staging.ch.rate_limit_exceeded() {
            staging.drain(registry, sink, &mut stats).await?;
            tokio::time::sleep_until(tick + buffer_delay).await;
            continue;
        }

        let pending = savevm_state_pending(registry, max_size);
        let capped = params
            .max_iterations
            .is_some_and(|max| stats.iterations >= max);
        if pending == 0 || pending < max_size || capped {
            tracing::debug!(pending, max_size, capped, "switching to completion");
            break;
        }

        let status = savevm_state_iterate(registry, &mut staging.ch)?;
        stats.iterations += 1;
        staging.drain(registry, sink, &mut stats).await?;
        if status == IterationStatus::Complete {
            tracing::debug!(iterations = stats.iterations, "live state fully sent");
            break;
        }
    }

    let stopped = Instant::now();
    stop_guest();
    savevm_state_complete(registry, &mut staging.ch)?;
    staging.drain(registry, sink, &mut stats).await?;
    if let Err(err) = sink.flush().await {
        savevm_state_cancel(registry);
        return Err(err.into());
    }

    stats.downtime = stopped.elapsed();
    stats.duration = start.elapsed();
    Ok(stats)
}

/// Receive a migration stream from `source` and load it.
pub async fn incoming<R>(registry: &mut Registry, source: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    source.read_to_end(&mut bytes).await?;
    tracing::debug!(len = bytes.len(), "incoming migration stream received");

    let mut ch = Channel::new_reader(MemTransport::from_bytes(bytes));
    loadvm_state(registry, &mut ch)
}
