use std::sync::Arc;

use gpu_uploads::buffer::{
    AllocationRules, BasicPacket, BindFlags, Box2D, BufferDesc, BufferKind, CpuAccess, DataPacket,
    PartialResource, PixelFormat, ResourceLocator, TextureDesc, TextureSamples,
};
use gpu_uploads::device::{Device, HostDevice};
use gpu_uploads::error::{DeviceError, UploadError};
use gpu_uploads::upload::{Manager, ManagerConfig, TransactionOptions, UploadManager};

fn manager(config: ManagerConfig) -> (Arc<HostDevice>, Manager) {
    let device = Arc::new(HostDevice::new());
    let manager = Manager::new(device.clone(), config);
    (device, manager)
}

fn vertices(size: u32) -> BufferDesc {
    BufferDesc::linear(size, 0)
        .bind_flags(BindFlags::VERTEX_BUFFER)
        .cpu_access(CpuAccess::WRITE)
}

fn packet(bytes: Vec<u8>) -> Option<Arc<dyn DataPacket>> {
    Some(Arc::new(BasicPacket::linear(bytes)))
}

fn update_until_completed(manager: &Manager, id: gpu_uploads::upload::TransactionId) {
    for _ in 0..8 {
        if manager.is_completed(id) {
            return;
        }
        manager.update();
    }
}

#[test]
fn vertex_buffer_lands_with_its_contents() {
    let (_device, manager) = manager(ManagerConfig::default());
    let payload: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();

    let id = manager.transaction_begin(
        &vertices(1024),
        packet(payload.clone()),
        TransactionOptions::empty(),
    );
    update_until_completed(&manager, id);
    assert!(manager.is_completed(id));
    manager.transaction_validate(id).unwrap();

    let locator = manager.get_resource(id);
    assert!(!locator.is_empty());
    assert_eq!(locator.size(), 1024);
    let contents = manager.resource_read_back(&locator).unwrap();
    assert_eq!(contents.as_bytes(), &payload[..]);

    manager.transaction_end(id);
    drop(locator);
    assert_eq!(manager.outstanding_transactions(), 0);
}

#[test]
fn begin_and_end_calls_balance_out() {
    let (_device, manager) = manager(ManagerConfig::default());
    let mut ids = Vec::new();
    for i in 0..40u32 {
        let desc = match i % 3 {
            0 => vertices(256).allocation_rules(AllocationRules::BATCHED),
            1 => vertices(512).allocation_rules(AllocationRules::POOLED),
            _ => vertices(128),
        };
        let options = if i % 4 == 0 {
            TransactionOptions::LONG_TERM
        } else {
            TransactionOptions::empty()
        };
        let id = manager.transaction_begin(&desc, packet(vec![i as u8; 128]), options);
        if i % 5 == 0 {
            manager.add_ref(id);
        }
        ids.push(id);
    }

    // some end before they ever complete
    for id in ids.iter().step_by(2) {
        manager.transaction_end(*id);
    }
    manager.update();
    manager.update();
    for id in ids.iter().skip(1).step_by(2) {
        manager.transaction_end(*id);
    }
    for (i, id) in ids.iter().enumerate() {
        if i % 5 == 0 {
            manager.transaction_end(*id);
        }
    }
    assert_eq!(manager.outstanding_transactions(), 0);
    assert!(matches!(
        manager.transaction_validate(ids[0]),
        Err(UploadError::UnknownTransaction(_))
    ));
}

#[test]
fn empty_metrics_queue_pops_the_sentinel() {
    let (_device, manager) = manager(ManagerConfig::default());
    let metrics = manager.pop_metrics();
    assert_eq!(metrics.commit_time, 0);
    assert!(metrics.is_empty_sentinel());

    manager.update();
    let metrics = manager.pop_metrics();
    assert!(!metrics.is_empty_sentinel());
    assert!(manager.pop_metrics().is_empty_sentinel());
}

#[test]
fn failed_creation_never_completes() {
    let (device, manager) = manager(ManagerConfig::default());
    device.set_fail_creations(true);

    let id = manager.transaction_begin(
        &vertices(256),
        packet(vec![1; 256]),
        TransactionOptions::empty(),
    );
    for _ in 0..3 {
        manager.update();
    }
    assert!(!manager.is_completed(id));
    assert!(manager.get_resource(id).is_empty());
    manager.transaction_end(id);

    let immediate = manager.transaction_immediate(&vertices(256), None, &PartialResource::whole());
    assert!(matches!(
        immediate,
        Err(UploadError::Device(DeviceError::CreationFailed { .. }))
    ));
    assert_eq!(manager.outstanding_transactions(), 0);
}

#[test]
fn pooled_resources_come_back_after_retirement() {
    let (device, manager) = manager(ManagerConfig::default().retirement_latency_frames(2));
    let desc = BufferDesc::linear(4096, 4)
        .bind_flags(BindFlags::INDEX_BUFFER)
        .cpu_access(CpuAccess::WRITE)
        .allocation_rules(AllocationRules::POOLED);

    let round = |manager: &Manager| {
        let id = manager.transaction_begin(&desc, packet(vec![7; 4096]), TransactionOptions::empty());
        update_until_completed(manager, id);
        assert!(manager.is_completed(id));
        let locator = manager.get_resource(id);
        assert!(locator.is_pooled());
        manager.transaction_end(id);
    };

    round(&manager);
    assert_eq!(device.stats().creations, 1);

    // the first buffer is still retiring, so a second one is created
    round(&manager);
    assert_eq!(device.stats().creations, 2);

    manager.update();
    manager.update();
    manager.update();
    round(&manager);
    assert_eq!(device.stats().creations, 2);

    let pools = manager.calculate_pool_metrics();
    let bucket = pools
        .resource_pools
        .iter()
        .find(|pool| pool.desc.byte_count() == 4096)
        .unwrap();
    assert_eq!(bucket.total_create_count, 2);
}

#[test]
fn taken_and_adopted_locators_never_return() {
    let (device, manager) = manager(ManagerConfig::default().retirement_latency_frames(1));
    let desc = vertices(1024).allocation_rules(AllocationRules::POOLED);

    let id = manager.transaction_begin(&desc, None, TransactionOptions::empty());
    update_until_completed(&manager, id);
    let mut adopted = manager.get_resource(id);
    manager.transaction_end(id);
    adopted.adopt_underlying();
    assert!(!adopted.is_pooled());
    drop(adopted);

    for _ in 0..4 {
        manager.update();
    }
    let id = manager.transaction_begin(&desc, None, TransactionOptions::empty());
    update_until_completed(&manager, id);
    manager.transaction_end(id);
    assert_eq!(device.stats().creations, 2);
}

#[test]
fn compaction_repositions_live_blocks() {
    let config = ManagerConfig::default()
        .batching(1024, 256, 16)
        .retirement_latency_frames(1)
        .defrag_min_free_fraction(0.25);
    let (_device, manager) = manager(config);

    let ids: Vec<_> = (0..8u8)
        .map(|i| {
            let desc = vertices(128)
                .allocation_rules(AllocationRules::BATCHED)
                .name(&format!("Block{i}"));
            manager.transaction_begin(&desc, packet(vec![i; 128]), TransactionOptions::empty())
        })
        .collect();
    manager.update();

    let mut kept: Vec<(u8, ResourceLocator)> = [1u8, 3, 5]
        .into_iter()
        .map(|i| (i, manager.get_resource(ids[usize::from(i)])))
        .collect();
    for id in &ids {
        manager.transaction_end(*id);
    }
    for (i, locator) in &kept {
        assert_eq!(locator.offset(), usize::from(*i) * 128);
    }
    let original = kept[0].1.resource().unwrap().id();

    for _ in 0..4 {
        if manager.event_list_latest_id() != 0 {
            break;
        }
        manager.update();
    }
    let latest = manager.event_list_latest_id();
    assert_ne!(latest, 0);

    let events = manager.event_list_get(latest);
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.original.id(), original);
    assert_eq!(event.translate_offset(384), Some(128));
    assert_eq!(event.translate_offset(0), None);

    for (value, locator) in &mut kept {
        assert!(event.apply(locator));
        assert_eq!(locator.resource().unwrap().id(), event.new.id());
        let contents = manager.resource_read_back(locator).unwrap();
        assert_eq!(contents.as_bytes(), &[*value; 128][..]);
    }
    let offsets: Vec<_> = kept.iter().map(|(_, locator)| locator.offset()).collect();
    assert_eq!(offsets, [0, 128, 256]);
    manager.event_list_release(latest);

    let heaps = manager.calculate_pool_metrics().batching.heaps;
    assert_eq!(heaps[0].allocated_space, 384);
    assert_eq!(heaps[0].largest_free_block, 640);
}

#[test]
fn oversized_updates_stay_inside_their_block() {
    let (_device, manager) = manager(ManagerConfig::default());
    let desc = vertices(16).allocation_rules(AllocationRules::BATCHED);
    let a = manager.transaction_begin(&desc, packet(vec![0xAA; 16]), TransactionOptions::empty());
    let b = manager.transaction_begin(&desc, packet(vec![0xBB; 16]), TransactionOptions::empty());
    manager.update();

    manager.update_data(a, Arc::new(BasicPacket::linear(vec![0xCC; 64])), &PartialResource::whole());
    update_until_completed(&manager, a);
    assert!(manager.is_completed(a));

    let first = manager.get_resource(a);
    let second = manager.get_resource(b);
    assert_eq!(first.resource().unwrap().id(), second.resource().unwrap().id());
    assert_eq!(manager.resource_read_back(&first).unwrap().as_bytes(), &[0xCC; 16]);
    assert_eq!(manager.resource_read_back(&second).unwrap().as_bytes(), &[0xBB; 16]);

    drop((first, second));
    manager.transaction_end(a);
    manager.transaction_end(b);
}

#[test]
fn out_of_range_updates_fail_the_transaction() {
    let (_device, manager) = manager(ManagerConfig::default());
    let id = manager.transaction_begin(&vertices(16), None, TransactionOptions::empty());
    manager.update();
    assert!(manager.is_completed(id));

    manager.update_data(
        id,
        Arc::new(BasicPacket::linear(vec![1; 4])),
        &PartialResource::area(Box2D::new(100, 0, 104, 1)),
    );
    manager.update();
    manager.update();
    assert!(!manager.is_completed(id));
    assert!(manager.get_resource(id).is_empty());
    manager.transaction_end(id);
}

#[test]
fn open_transactions_follow_compacted_blocks() {
    let config = ManagerConfig::default()
        .batching(1024, 256, 16)
        .retirement_latency_frames(1)
        .defrag_min_free_fraction(0.25);
    let (_device, manager) = manager(config);

    let ids: Vec<_> = (0..8u8)
        .map(|i| {
            let desc = vertices(128).allocation_rules(AllocationRules::BATCHED);
            manager.transaction_begin(&desc, packet(vec![i; 128]), TransactionOptions::empty())
        })
        .collect();
    manager.update();
    for i in [0, 2, 4, 6, 7] {
        manager.transaction_end(ids[i]);
    }
    for _ in 0..4 {
        if manager.event_list_latest_id() != 0 {
            break;
        }
        manager.update();
    }
    let latest = manager.event_list_latest_id();
    let new_id = manager.event_list_get(latest)[0].new.id();
    manager.event_list_release(latest);

    for (slot, i) in [1usize, 3, 5].into_iter().enumerate() {
        let locator = manager.get_resource(ids[i]);
        assert_eq!(locator.resource().unwrap().id(), new_id);
        assert_eq!(locator.offset(), slot * 128);
        manager.transaction_validate(ids[i]).unwrap();
    }

    manager.update_data(ids[3], Arc::new(BasicPacket::linear(vec![0xEE; 128])), &PartialResource::whole());
    update_until_completed(&manager, ids[3]);
    let updated = manager.get_resource(ids[3]);
    assert_eq!(manager.resource_read_back(&updated).unwrap().as_bytes(), &[0xEE; 128]);
    let neighbour = manager.get_resource(ids[5]);
    assert_eq!(manager.resource_read_back(&neighbour).unwrap().as_bytes(), &[5; 128]);

    drop((updated, neighbour));
    for i in [1, 3, 5] {
        manager.transaction_end(ids[i]);
    }
}

#[test]
fn empty_batched_buffers_get_their_own_resource() {
    let (device, manager) = manager(ManagerConfig::default());
    let desc = vertices(0).allocation_rules(AllocationRules::BATCHED);
    let locator = manager
        .transaction_immediate(&desc, None, &PartialResource::whole())
        .unwrap();
    assert!(!locator.is_pooled());
    assert!(locator.is_whole_resource());
    assert_eq!(device.stats().creations, 1);
    assert!(manager.calculate_pool_metrics().batching.heaps.is_empty());
}

#[test]
fn immediate_textures_keep_their_description() {
    let (device, manager) = manager(ManagerConfig::default());
    let texture = TextureDesc::plain_2d(32, 16, PixelFormat::R8G8B8A8Unorm)
        .mips(3)
        .array(2)
        .samples(TextureSamples::new(1, 0));
    let desc = BufferDesc::texture(texture)
        .bind_flags(BindFlags::SHADER_RESOURCE)
        .name("Atlas");

    let locator = manager
        .transaction_immediate(&desc, None, &PartialResource::whole())
        .unwrap();
    let resource = locator.resource().unwrap();
    assert!(matches!(resource.desc().kind, BufferKind::Texture(_)));
    assert_eq!(resource.desc().as_texture(), Some(&texture));
    assert_eq!(resource.desc().name.as_str(), "Atlas");
    assert_eq!(device.stats().creations, 1);
    assert!(device.read_back(resource, None).is_ok());
}
