use super::filter::{Filter, FilterConfig, FilterShared, FilterState};
use super::params::{PesOutput, TsInsertion};
use crate::engine::TsFeed;
use crate::error::{DmxError, Result};
use bytes::Bytes;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

/// A TS insertion buffer and its running task, if scheduled.
pub(crate) struct Insertion {
    pub params: TsInsertion,
    task: Option<AbortHandle>,
}

impl Insertion {
    pub fn new(params: TsInsertion) -> Self {
        Self { params, task: None }
    }

    /// Starts inserting now and then every repetition interval.
    ///
    /// Buffers that are not a whole number of `tsp_size` packets are skipped.
    pub fn schedule(
        &mut self,
        filter: &Arc<FilterShared>,
        feed: Arc<dyn TsFeed>,
        tsp_size: usize,
        to_dvr: bool,
    ) {
        if self.params.packets.len() % tsp_size != 0 {
            error!(
                "insertion {}: {} bytes is not a whole number of {}-byte packets",
                self.params.identifier,
                self.params.packets.len(),
                tsp_size
            );
            return;
        }
        self.cancel();
        let task = filter.ctx.runtime.spawn(run(
            filter.clone(),
            feed,
            self.params.packets.clone(),
            self.params.repetition,
            to_dvr,
        ));
        self.task = Some(task.abort_handle());
    }

    /// Stops the task; returns whether one was scheduled.
    pub fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Insertion {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run(
    filter: Arc<FilterShared>,
    feed: Arc<dyn TsFeed>,
    packets: Bytes,
    repetition: Duration,
    to_dvr: bool,
) {
    loop {
        let fits = {
            let data = filter.data.lock();
            if data.state != FilterState::Go {
                return;
            }
            if to_dvr {
                packets.len() < filter.ctx.dvr.output.lock().ring.free()
            } else {
                packets.len() < data.output.ring.free()
            }
        };
        if fits {
            if let Err(e) = feed.ts_insertion_insert(&packets) {
                warn!("filter {}: ts insertion failed: {}", filter.id, e);
            }
        } else {
            debug!("filter {}: no room for ts insertion", filter.id);
        }

        if repetition.is_zero() {
            return;
        }
        tokio::time::sleep(repetition).await;
    }
}

impl Filter {
    /// Queues TS packets the engine re-inserts every `repetition`; a zero
    /// repetition inserts once. Intervals below the configured minimum are
    /// raised to it.
    pub fn set_ts_insertion(&self, mut insertion: TsInsertion) -> Result<()> {
        let mut config = self.shared.config.lock();
        self.check_insertion_target(&config)?;
        if insertion.packets.is_empty() {
            return Err(DmxError::invalid("empty insertion buffer"));
        }
        if config
            .insertions
            .iter()
            .any(|i| i.params.identifier == insertion.identifier)
        {
            return Err(DmxError::invalid(format!(
                "insertion {} already queued",
                insertion.identifier
            )));
        }
        let min = self.shared.ctx.config.min_insertion_interval;
        if !insertion.repetition.is_zero() && insertion.repetition < min {
            insertion.repetition = min;
        }

        config.insertions.push(Insertion::new(insertion));
        if self.state() != FilterState::Go {
            return Ok(());
        }

        let Some(first) = config.first_ts() else {
            return Ok(());
        };
        if config.insertions.len() == 1 {
            if let Err(e) = first.ts_insertion_init() {
                config.insertions.pop();
                return Err(e);
            }
        }
        let tsp_size = config.tsp_format.packet_size();
        let to_dvr = config.kind.pes_output() == Some(PesOutput::TsTap);
        if let Some(last) = config.insertions.last_mut() {
            last.schedule(&self.shared, first, tsp_size, to_dvr);
        }
        Ok(())
    }

    /// Stops and removes the insertion with `identifier`.
    pub fn abort_ts_insertion(&self, identifier: u32) -> Result<()> {
        let mut config = self.shared.config.lock();
        self.check_insertion_target(&config)?;
        let index = config
            .insertions
            .iter()
            .position(|i| i.params.identifier == identifier)
            .ok_or_else(|| DmxError::invalid(format!("no insertion {identifier}")))?;

        let mut removed = config.insertions.remove(index);
        if self.state() == FilterState::Go {
            removed.cancel();
            if config.insertions.is_empty() {
                if let Some(first) = config.first_ts() {
                    first.ts_insertion_terminate()?;
                }
            }
        }
        Ok(())
    }

    fn check_insertion_target(&self, config: &FilterConfig) -> Result<()> {
        let supported = self.dev.caps().map_or(false, |c| c.flags.ts_insertion);
        let ts_output = config.kind.pes_output().map_or(false, PesOutput::is_ts);
        if !supported || self.state() < FilterState::Set || !ts_output {
            return Err(DmxError::invalid("insertion needs a configured TS output"));
        }
        Ok(())
    }

    /// Schedules every queued insertion on a freshly started filter.
    pub(crate) fn start_insertions(&self, config: &mut FilterConfig) {
        if config.insertions.is_empty() {
            return;
        }
        let Some(first) = config.first_ts() else {
            return;
        };
        if let Err(e) = first.ts_insertion_init() {
            error!("filter {}: ts insertion init failed: {}", self.id(), e);
            return;
        }
        let tsp_size = config.tsp_format.packet_size();
        let to_dvr = config.kind.pes_output() == Some(PesOutput::TsTap);
        for insertion in config.insertions.iter_mut() {
            insertion.schedule(&self.shared, first.clone(), tsp_size, to_dvr);
        }
    }
}
