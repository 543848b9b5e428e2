use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// A non-fatal problem that was absorbed where it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Note {
    pub operation: &'static str,
    pub message: String,
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

/// Passive channel for notes. Clones share the same queue, so a tool can
/// record while a UI drains. Once `capacity` notes are waiting, new ones are
/// only logged and counted as dropped.
#[derive(Clone)]
pub struct Diagnostics {
    tx: Sender<Note>,
    rx: Receiver<Note>,
    dropped: Arc<AtomicU64>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record(&self, operation: &'static str, message: impl fmt::Display) {
        let note = Note {
            operation,
            message: message.to_string(),
        };
        log::warn!("{}", note);
        if let Err(TrySendError::Full(note)) = self.tx.try_send(note) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("diagnostics queue full, dropped `{}`", note.operation);
        }
    }

    pub fn drain(&self) -> Vec<Note> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Notes lost to a full queue since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_notes() {
        let diagnostics = Diagnostics::new();
        let recorder = diagnostics.clone();
        recorder.record("smooth", "kernel missing");
        recorder.record("write_cell", format_args!("{} failed", "cell_3_4"));
        assert_eq!(diagnostics.pending(), 2);

        let notes = diagnostics.drain();
        assert_eq!(notes[0].to_string(), "smooth: kernel missing");
        assert_eq!(notes[1].message, "cell_3_4 failed");
        assert!(diagnostics.drain().is_empty());
    }

    #[test]
    fn a_full_queue_drops_new_notes() {
        let diagnostics = Diagnostics::with_capacity(2);
        for i in 0..5 {
            diagnostics.record("erosion_tick", i);
        }
        assert_eq!(diagnostics.pending(), 2);
        assert_eq!(diagnostics.dropped(), 3);

        let notes = diagnostics.drain();
        assert_eq!(notes[0].message, "0");
        assert_eq!(notes[1].message, "1");
        diagnostics.record("erosion_tick", "again");
        assert_eq!(diagnostics.pending(), 1);
    }
}
