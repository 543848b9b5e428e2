use std::sync::atomic::{AtomicU8, Ordering};

use gpu_uploads::upload::TransactionId;

/// A transaction the producer opened; the frame thread owns ending it.
#[derive(Debug)]
pub struct Begun {
    pub id: TransactionId,
    pub label: &'static str,
    pub bytes: usize,
}

#[derive(Debug)]
pub struct Retired {
    pub id: TransactionId,
    pub label: &'static str,
    pub frames_waited: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    StopProducer,
    StopFrames,
}

pub struct EngineControl {
    phase: AtomicU8,
}

impl EngineControl {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(ShutdownPhase::Running as u8),
        }
    }

    pub fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn phase(&self) -> ShutdownPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::StopProducer,
            _ => ShutdownPhase::StopFrames,
        }
    }
}
