use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tempfile::TempDir;

use gpu_uploads::device::HostDevice;
use gpu_uploads::terrain::kernels::{self, RaiseLowerParameters, ToolParameters};
use gpu_uploads::terrain::{
    CacheStats, ErosionParameters, HeightsSurface, Rect, TerrainFormat, UberCacheConfig,
    UberSurfaceInterface,
};
use gpu_uploads::upload::{Manager, ManagerConfig};

// fields drop in order: the interface flushes before the directory goes away
struct Fixture {
    interface: UberSurfaceInterface,
    _manager: Arc<Manager>,
    device: Arc<HostDevice>,
    _dir: TempDir,
}

fn fixture(
    size: u32,
    config: UberCacheConfig,
    format: Option<Arc<dyn TerrainFormat>>,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let surface = HeightsSurface::create(dir.path().join("heights.uber"), size, size, 0.0).unwrap();
    let device = Arc::new(HostDevice::new());
    register_raise_lower(&device);
    let manager = Arc::new(Manager::new(device.clone(), ManagerConfig::default()));
    let interface =
        UberSurfaceInterface::with_config(surface, manager.clone(), device.clone(), format, config);
    Fixture {
        interface,
        _manager: manager,
        device,
        _dir: dir,
    }
}

/// Raises every texel inside the brush by `adjustment`, fading out linearly.
fn register_raise_lower(device: &HostDevice) {
    device.register_kernel(kernels::RAISE_LOWER, |args| {
        let tool: ToolParameters = args.constants(0)?;
        let raise: RaiseLowerParameters = args.constants(1)?;
        let (width, _) = args.uavs[0].extent();
        let source = args.srvs[0].as_f32();
        let target = args.uavs[0].as_f32_mut();
        for (i, value) in target.iter_mut().enumerate() {
            let x = (tool.cache_mins[0] + i as u32 % width) as f32 - tool.center[0];
            let y = (tool.cache_mins[1] + i as u32 / width) as f32 - tool.center[1];
            let falloff = (1.0 - (x * x + y * y).sqrt() / tool.radius).max(0.0);
            *value = source[i] + tool.adjustment * falloff.powf(raise.power);
        }
        Ok(())
    });
}

fn counter() -> (Arc<AtomicU32>, impl Fn() -> u32) {
    let count = Arc::new(AtomicU32::new(0));
    let reader = count.clone();
    (count, move || reader.load(Ordering::Relaxed))
}

#[test]
fn requests_inside_the_window_reuse_the_cache() {
    let mut f = fixture(512, UberCacheConfig::default().cache_extent(32), None);

    f.interface.prepare_cache([10, 10], [20, 20]).unwrap();
    let window = f.interface.gpu_cache_window().unwrap();
    assert_eq!(window, Rect::new([0, 0], [47, 47]));

    f.interface.prepare_cache([10, 10], [20, 20]).unwrap();
    f.interface.prepare_cache([15, 15], [18, 18]).unwrap();
    assert_eq!(f.interface.stats().builds, 1);
    assert_eq!(f.interface.stats().flushes, 0);
    assert_eq!(f.device.stats().read_backs, 0);

    f.interface.prepare_cache([300, 300], [310, 310]).unwrap();
    let stats = f.interface.stats();
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.builds, 2);
    assert_eq!(f.device.stats().read_backs, 1);
    let window = f.interface.gpu_cache_window().unwrap();
    assert!(window.contains(&Rect::new([300, 300], [310, 310])));
}

#[test]
fn edits_short_circuit_overlapping_cells_and_flush_to_the_surface() {
    let mut f = fixture(256, UberCacheConfig::default(), None);
    let (near, near_count) = counter();
    let (far, far_count) = counter();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let recorded = seen.clone();
    f.interface
        .register_cell("near.cell", [64, 64], [127, 127], 2, move |update| {
            near.fetch_add(1, Ordering::Relaxed);
            let contents = update
                .device
                .read_back(update.srv.resource(), None)
                .unwrap()
                .to_pod_vec::<f32>();
            let width = update.resource_area.dims()[0] as usize;
            let x = (100 - update.resource_area.mins[0]) as usize;
            let y = (100 - update.resource_area.mins[1]) as usize;
            recorded.lock().push((update.update_area, contents[y * width + x]));
        });
    f.interface
        .register_cell("far.cell", [200, 200], [255, 255], 2, move |_| {
            far.fetch_add(1, Ordering::Relaxed);
        });

    f.interface
        .adjust_heights([100.0, 100.0], 20.0, 5.0, 1.0)
        .unwrap();

    let stats = f.interface.stats();
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.dispatches, 1);
    assert!(
        f.interface
            .gpu_cache_window()
            .unwrap()
            .contains(&Rect::new([80, 80], [120, 120]))
    );
    assert_eq!(near_count(), 1);
    assert_eq!(far_count(), 0);
    assert_eq!(
        seen.lock().as_slice(),
        &[(Rect::new([80, 80], [120, 120]), 5.0)]
    );

    // nothing reaches the surface until the cache is flushed
    assert_eq!(f.interface.surface().value(100, 100), Some(0.0));
    f.interface.flush_gpu_cache().unwrap();
    assert_eq!(f.interface.gpu_cache_window(), None);
    assert_eq!(f.interface.surface().value(100, 100), Some(5.0));
    assert_eq!(f.interface.surface().value(10, 10), Some(0.0));
    assert_eq!(f.interface.stats().flushes, 1);
}

struct RecordingFormat {
    written: Mutex<Vec<(PathBuf, u32, u32)>>,
    broken: PathBuf,
}

impl TerrainFormat for RecordingFormat {
    fn write_cell(
        &self,
        destination: &Path,
        _surface: &HeightsSurface,
        _mins: [u32; 2],
        _maxs: [u32; 2],
        tree_depth: u32,
        overlap: u32,
    ) -> anyhow::Result<()> {
        if destination == self.broken {
            anyhow::bail!("disk full");
        }
        self.written
            .lock()
            .push((destination.to_path_buf(), tree_depth, overlap));
        Ok(())
    }
}

#[test]
fn a_failing_cell_does_not_stop_its_siblings() {
    let format = Arc::new(RecordingFormat {
        written: Mutex::new(Vec::new()),
        broken: PathBuf::from("b.cell"),
    });
    let mut f = fixture(
        128,
        UberCacheConfig::default().tree_depth(4),
        Some(format.clone()),
    );
    for name in ["a.cell", "b.cell", "c.cell"] {
        f.interface
            .register_cell(name, [0, 0], [63, 63], 1, |_| {});
    }

    f.interface.adjust_heights([32.0, 32.0], 8.0, 1.0, 1.0).unwrap();
    f.interface.flush_gpu_cache().unwrap();

    let written = format.written.lock().clone();
    assert_eq!(
        written,
        [
            (PathBuf::from("a.cell"), 4, 1),
            (PathBuf::from("c.cell"), 4, 1)
        ]
    );
    let stats = f.interface.stats();
    assert_eq!(stats.cell_writes, 2);
    assert_eq!(stats.cell_write_failures, 1);
    let notes = f.interface.diagnostics().drain();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].operation, "write_cell");
    assert!(notes[0].message.contains("disk full"));
}

#[test]
fn missing_kernels_are_reported_not_returned() {
    let mut f = fixture(64, UberCacheConfig::default(), None);
    let (calls, call_count) = counter();
    f.interface.register_cell("cell", [0, 0], [63, 63], 0, move |_| {
        calls.fetch_add(1, Ordering::Relaxed);
    });

    f.interface.add_noise([16.0, 16.0], 4.0, 1.0).unwrap();

    assert_eq!(call_count(), 0);
    assert_eq!(f.interface.stats().dispatches, 0);
    let notes = f.interface.diagnostics().drain();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].operation, kernels::ADD_NOISE);
}

#[test]
fn smoothing_makes_the_filter_footprint_resident() {
    let mut f = fixture(128, UberCacheConfig::default().cache_extent(0), None);
    f.device.register_kernel(kernels::SMOOTH, |args| {
        let source = args.srvs[0].as_f32();
        args.uavs[0].as_f32_mut().copy_from_slice(source);
        Ok(())
    });

    f.interface
        .smooth([50.0, 50.0], 5.0, 4, 1.5, 1.0, 0)
        .unwrap();
    assert_eq!(
        f.interface.gpu_cache_window(),
        Some(Rect::new([41, 41], [59, 59]))
    );
    assert_eq!(f.interface.stats().dispatches, 1);
    assert_eq!(f.interface.diagnostics().pending(), 0);
}

#[test]
fn erosion_simulates_whole_tiles_inside_the_window() {
    let mut f = fixture(
        128,
        UberCacheConfig::default().cache_extent(64).erosion_tile(16),
        None,
    );
    let water_steps = Arc::new(AtomicU32::new(0));
    let steps = water_steps.clone();
    f.device.register_kernel(kernels::SHALLOW_WATER, move |_| {
        steps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });
    f.device.register_kernel(kernels::TICK_EROSION, |_| Ok(()));
    let areas = Arc::new(Mutex::new(Vec::new()));
    let recorded = areas.clone();
    f.interface
        .register_cell("cell", [32, 32], [63, 63], 0, move |update| {
            recorded.lock().push(update.update_area);
        });

    f.interface.erosion_begin([40.0, 40.0], [50.0, 50.0]).unwrap();
    assert!(f.interface.erosion_is_prepared());
    assert_eq!(
        f.interface.gpu_cache_window(),
        Some(Rect::new([0, 0], [109, 109]))
    );
    let simulation = f.interface.erosion().unwrap();
    assert_eq!(simulation.gpu_cache_offset(), [37, 37]);
    assert_eq!(simulation.sim_size(), [16, 16]);

    let params = ErosionParameters::default();
    f.interface.erosion_tick(&params);
    f.interface.erosion_tick(&params);
    assert_eq!(f.interface.erosion().unwrap().buffer_count(), 2);
    assert_eq!(water_steps.load(Ordering::Relaxed), 2);
    assert_eq!(
        areas.lock().as_slice(),
        &[Rect::new([37, 37], [52, 52]); 2]
    );

    // any brush edit ends the simulation
    f.interface.adjust_heights([40.0, 40.0], 2.0, 1.0, 1.0).unwrap();
    assert!(!f.interface.erosion_is_prepared());
    assert_eq!(f.interface.diagnostics().pending(), 0);
}

#[test]
fn tools_on_a_missing_surface_do_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let surface = HeightsSurface::open_or_empty(dir.path().join("missing.uber"));
    let device = Arc::new(HostDevice::new());
    let manager = Arc::new(Manager::new(device.clone(), ManagerConfig::default()));
    let mut interface = UberSurfaceInterface::new(surface, manager, device.clone(), None);

    interface.adjust_heights([10.0, 10.0], 4.0, 1.0, 1.0).unwrap();
    interface.erosion_begin([0.0, 0.0], [8.0, 8.0]).unwrap();
    interface.flush_gpu_cache().unwrap();

    assert_eq!(interface.stats(), CacheStats::default());
    assert!(!interface.erosion_is_prepared());
    assert_eq!(device.stats().creations, 0);
}
