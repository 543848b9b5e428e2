use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use gpu_uploads::buffer::{
    AllocationRules, BasicPacket, BindFlags, BufferDesc, CpuAccess, DataPacket, PartialResource,
    PixelFormat, TextureDesc,
};
use gpu_uploads::upload::{Manager, TransactionOptions, UploadManager};

use crate::messages::{Begun, EngineControl, Retired, ShutdownPhase};

const MAX_IN_FLIGHT: usize = 512;

struct Workload {
    label: &'static str,
    desc: BufferDesc,
    options: TransactionOptions,
}

fn workload(sequence: u64) -> Workload {
    // cycle through sizes so pooled buckets and batched heaps both churn
    let size = 256 << (sequence % 6);
    match sequence % 5 {
        0 | 1 => Workload {
            label: "vertices",
            desc: BufferDesc::linear(size, 32)
                .bind_flags(BindFlags::VERTEX_BUFFER)
                .cpu_access(CpuAccess::WRITE)
                .allocation_rules(AllocationRules::BATCHED)
                .name("SoakVertices"),
            options: TransactionOptions::empty(),
        },
        2 => Workload {
            label: "indices",
            desc: BufferDesc::linear(size, 4)
                .bind_flags(BindFlags::INDEX_BUFFER)
                .cpu_access(CpuAccess::WRITE)
                .allocation_rules(AllocationRules::POOLED)
                .name("SoakIndices"),
            options: TransactionOptions::empty(),
        },
        3 => Workload {
            label: "texture",
            desc: BufferDesc::texture(TextureDesc::plain_2d(64, 64, PixelFormat::R8G8B8A8Unorm).mips(4))
                .bind_flags(BindFlags::SHADER_RESOURCE)
                .allocation_rules(AllocationRules::POOLED)
                .name("SoakTexture"),
            options: TransactionOptions::LONG_TERM,
        },
        _ => Workload {
            label: "constants",
            desc: BufferDesc::linear(256, 0)
                .bind_flags(BindFlags::CONSTANT_BUFFER)
                .cpu_access(CpuAccess::WRITE_DYNAMIC)
                .name("SoakConstants"),
            options: TransactionOptions::FRAME_PRIORITY,
        },
    }
}

fn payload(desc: &BufferDesc, seed: u64) -> anyhow::Result<Arc<dyn DataPacket>> {
    let bytes: Vec<u8> = (0..desc.byte_count())
        .map(|i| (i as u64).wrapping_add(seed) as u8)
        .collect();
    let packet = match desc.as_texture() {
        Some(texture) => BasicPacket::texture(texture, bytes).context("texture payload")?,
        None => BasicPacket::linear(bytes),
    };
    Ok(Arc::new(packet))
}

pub fn producer_thread(
    manager_rx: Receiver<Arc<Manager>>,
    begun_tx: Sender<Begun>,
    retired_rx: Receiver<Retired>,
    control: Arc<EngineControl>,
) -> anyhow::Result<()> {
    let manager = manager_rx
        .recv()
        .context("frame thread exited before publishing the upload manager")?;

    let mut sequence = 0u64;
    let mut in_flight = 0usize;
    while control.phase() == ShutdownPhase::Running {
        for retired in retired_rx.try_iter() {
            in_flight = in_flight.saturating_sub(1);
            log::trace!(
                "Producer: {} {:#x} retired after {} frames",
                retired.label,
                retired.id.raw(),
                retired.frames_waited
            );
        }
        if in_flight >= MAX_IN_FLIGHT {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let work = workload(sequence);
        let data = payload(&work.desc, sequence)?;
        let id = manager.transaction_begin(&work.desc, Some(data), work.options);

        // stream a second payload into some buffers before they land
        if sequence % 7 == 0 && work.desc.as_linear().is_some() {
            let update = payload(&work.desc, sequence + 1)?;
            manager.update_data(id, update, &PartialResource::whole());
        }

        if begun_tx
            .send(Begun {
                id,
                label: work.label,
                bytes: work.desc.byte_count(),
            })
            .is_err()
        {
            manager.transaction_end(id);
            break;
        }
        in_flight += 1;
        sequence += 1;

        if sequence % 16 == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    log::debug!("Producer Thread shutting down after {} transactions", sequence);
    Ok(())
}
