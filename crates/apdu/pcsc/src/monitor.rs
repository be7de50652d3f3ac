//! Tag presence monitor
//!
//! Watches every reader on a dedicated thread and reports tags entering and
//! leaving the field as [`TagEvent`]s.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use pcsc::{Context, ReaderState, State};
use tracing::{debug, trace, warn};

use crate::error::PcscError;
use crate::event::{TagEvent, TagEventSender};
use crate::reader::{card_present, is_iso_dep_atr};

/// Monitor for tag presence on all readers
pub struct PcscMonitor {
    context: Context,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl fmt::Debug for PcscMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscMonitor")
            .field("running", &self.is_running())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl PcscMonitor {
    pub(crate) fn new(context: Context, poll_interval: Duration) -> Self {
        Self {
            context,
            running: Arc::new(AtomicBool::new(false)),
            poll_interval,
        }
    }

    /// Start reporting presence changes to `sender`
    ///
    /// Tags already present are reported right away.
    pub fn start(&self, sender: TagEventSender) -> Result<(), PcscError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(PcscError::Other("Monitor already running".into()));
        }
        let context = self.context.clone();
        let running = Arc::clone(&self.running);
        let poll_interval = self.poll_interval;

        thread::Builder::new()
            .name("pcsc-monitor".into())
            .spawn(move || watch(&context, &running, poll_interval, &sender))
            .map_err(|e| PcscError::Other(e.to_string()))?;
        Ok(())
    }

    /// Stop the monitor thread
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            // Wake a pending status change wait
            let _ = self.context.cancel();
        }
    }

    /// Whether the monitor thread is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for PcscMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_pnp(state: &ReaderState) -> bool {
    state.name() == pcsc::PNP_NOTIFICATION()
}

fn contains_reader(readers: &[std::ffi::CString], name: &CStr) -> bool {
    readers.iter().any(|r| r.as_c_str() == name)
}

fn watch(context: &Context, running: &AtomicBool, poll_interval: Duration, sender: &TagEventSender) {
    // ATR of the tag currently present on each reader
    let mut present: HashMap<String, Vec<u8>> = HashMap::new();
    let mut states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];

    let emit = |event: TagEvent| {
        debug!(?event, "Tag event");
        sender.send(event).is_ok()
    };

    while running.load(Ordering::Acquire) {
        let readers = match context.list_readers_owned() {
            Ok(readers) => readers,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to list readers");
                thread::sleep(poll_interval);
                continue;
            }
        };

        states.retain(|rs| is_pnp(rs) || contains_reader(&readers, rs.name()));
        for reader in readers {
            if !states.iter().any(|rs| rs.name() == reader.as_c_str()) {
                trace!(reader = %reader.to_string_lossy(), "Watching reader");
                states.push(ReaderState::new(reader, State::UNAWARE));
            }
        }

        // Readers that disappeared take their tag with them
        let vanished: Vec<String> = present
            .keys()
            .filter(|name| !states.iter().any(|rs| rs.name().to_string_lossy() == name.as_str()))
            .cloned()
            .collect();
        for reader in vanished {
            present.remove(&reader);
            if !emit(TagEvent::Gone { reader }) {
                return;
            }
        }

        for rs in &mut states {
            rs.sync_current_state();
        }
        match context.get_status_change(Some(poll_interval), &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => continue,
            Err(pcsc::Error::Cancelled) => break,
            Err(e) => {
                warn!(error = %e, "Failed to wait for reader changes");
                thread::sleep(poll_interval);
                continue;
            }
        }

        for rs in states.iter().filter(|rs| !is_pnp(rs)) {
            let reader = rs.name().to_string_lossy().into_owned();
            let event = if card_present(rs.event_state()) {
                let atr = rs.atr().to_vec();
                if present.get(&reader) == Some(&atr) {
                    continue;
                }
                present.insert(reader.clone(), atr.clone());
                TagEvent::Present {
                    reader,
                    iso_dep: is_iso_dep_atr(&atr),
                    atr,
                }
            } else if present.remove(&reader).is_some() {
                TagEvent::Gone { reader }
            } else {
                continue;
            };
            if !emit(event) {
                return;
            }
        }
    }
    debug!("Monitor stopped");
}
