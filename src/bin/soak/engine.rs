use std::sync::{Arc, mpsc};
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use gpu_uploads::device::{Device, HostDevice};
use gpu_uploads::upload::ManagerConfig;

use crate::frame::frame_thread;
use crate::messages::{EngineControl, ShutdownPhase};
use crate::producer::producer_thread;

pub struct Engine {
    control: Arc<EngineControl>,
    producer: Option<thread::JoinHandle<()>>,
    frames: Option<thread::JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: ManagerConfig) -> anyhow::Result<Self> {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());

        let (manager_tx, manager_rx) = bounded(1);
        let (begun_tx, begun_rx) = unbounded();
        let (retired_tx, retired_rx) = unbounded();

        let control = Arc::new(EngineControl::new());

        let (error_tx, error_rx) = mpsc::channel::<(String, anyhow::Error)>();

        let frame_handle = {
            let control = control.clone();
            let error_tx = error_tx.clone();
            thread::Builder::new()
                .name("frames".to_string())
                .spawn(move || {
                    if let Err(e) =
                        frame_thread(device, config, manager_tx, begun_rx, retired_tx, control)
                    {
                        let _ = error_tx.send(("frames".to_string(), e));
                    }
                })?
        };

        let producer_handle = {
            let control = control.clone();
            let error_tx = error_tx.clone();
            thread::Builder::new()
                .name("producer".to_string())
                .spawn(move || {
                    if let Err(e) = producer_thread(manager_rx, begun_tx, retired_rx, control) {
                        let _ = error_tx.send(("producer".to_string(), e));
                    }
                })?
        };

        let _watchdog = {
            thread::Builder::new()
                .name("thread_watchdog".to_string())
                .spawn(move || {
                    for (name, e) in error_rx {
                        log::error!("Thread {} failed: {:?}", name, e);
                    }
                })?
        };

        Ok(Self {
            control,
            producer: Some(producer_handle),
            frames: Some(frame_handle),
        })
    }

    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        self.control.set_phase(ShutdownPhase::StopProducer);
        if let Some(handle) = self.producer.take() {
            handle.join().ok();
        }

        self.control.set_phase(ShutdownPhase::StopFrames);
        if let Some(handle) = self.frames.take() {
            handle.join().ok();
        }

        Ok(())
    }
}
