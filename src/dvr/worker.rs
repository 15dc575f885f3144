use super::command::DvrCommand;
use crate::device::params::OobCommand;
use crate::device::{DeviceShared, FilterState};
use crate::error::{DmxError, Result};
use crate::utils::{align_down, wait_until};
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn stopping(dev: &DeviceShared) -> bool {
    dev.ctx.exiting() || dev.ctx.input_exit.load(Ordering::Acquire)
}

/// Drains the command ring until the writer closes or the device exits.
///
/// Bytes a feed could not hand over, such as a trailing partial packet,
/// are carried into the next feed command.
pub(crate) async fn run(dev: Arc<DeviceShared>) {
    info!("dvr input worker started");
    let input = &dev.dvr_in;
    let mut leftover = 0usize;

    loop {
        let next = wait_until(&input.notify, || {
            if stopping(&dev) {
                return Some(None);
            }
            input.state.lock().commands.pop().map(Some)
        })
        .await;
        let Some(command) = next else {
            break;
        };

        match command {
            DvrCommand::Feed(count) => {
                let total = count + leftover;
                match feed(&dev, total).await {
                    Ok(written) => leftover = total - written,
                    Err(e) => debug!("dvr input feed stopped: {}", e),
                }
            }
            DvrCommand::Oob(oob) => {
                if oob == OobCommand::Eos {
                    let pending = input.state.lock().ring.available();
                    if let Err(e) = feed(&dev, pending).await {
                        debug!("dvr input drain stopped: {}", e);
                    }
                    leftover = input.state.lock().ring.available();
                }
                broadcast_oob(&dev, oob);
            }
        }
        input.notify.notify_waiters();
    }
    info!("dvr input worker stopped");
}

/// Hands up to `todo` buffered bytes to the engine in whole packets.
///
/// Returns the bytes the engine took. A failing or stalled engine write
/// abandons the rest of this feed.
async fn feed(dev: &DeviceShared, mut todo: usize) -> Result<usize> {
    let input = &dev.dvr_in;
    let tsp_size = dev.engine.tsp_size();
    let mut written = 0;

    while todo >= tsp_size {
        let chunk = wait_until(&input.notify, || {
            if stopping(dev) {
                return Some(Err(DmxError::Teardown));
            }
            let mut state = input.state.lock();
            let available = state.ring.available();
            if available < tsp_size {
                return None;
            }
            state.processing = true;
            let len = align_down(todo.min(available), tsp_size);
            Some(Ok(state.ring.peek(len)))
        })
        .await?;

        let result = dev.engine.write(&chunk).await;
        let mut state = input.state.lock();
        state.processing = false;
        if stopping(dev) {
            return Err(DmxError::Teardown);
        }
        match result {
            Ok(0) => {
                warn!("dvr input: engine took no data, dropping feed");
                break;
            }
            Ok(n) => {
                let n = n.min(chunk.len());
                state.ring.skip(n);
                drop(state);
                input.notify.notify_waiters();
                written += n;
                todo -= n;
            }
            Err(e) => {
                error!("dvr input: engine write failed: {}", e);
                break;
            }
        }
    }
    Ok(written)
}

/// Passes an out-of-band command to every running filter's feed.
fn broadcast_oob(dev: &DeviceShared, command: OobCommand) {
    for filter in &dev.filters {
        let config = filter.config.lock();
        if filter.state() != FilterState::Go {
            continue;
        }
        let result = if let Some(binding) = &config.section {
            binding.feed.oob_command(command)
        } else if let Some(ts) = config.first_ts() {
            ts.oob_command(command)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!("filter {}: oob command failed: {}", filter.id, e);
        }
    }
}
