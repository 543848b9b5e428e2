use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::buffer::{
    BindFlags, BufferDesc, DataPacket, GpuAccess, PartialResource, PixelFormat, ResourceLocator,
    ShaderResourceView, SubresourceId, TextureDesc, TexturePitches, UnderlyingResource,
};
use crate::device::{ComputeDispatch, Device};
use crate::diagnostics::Diagnostics;
use crate::error::{SurfaceError, UploadError};
use crate::terrain::config::UberCacheConfig;
use crate::terrain::erosion::{ErosionParameters, ErosionSimulation, tile_aligned_region};
use crate::terrain::kernels::{
    self, BlurParameters, CopyHeightParameters, FillWithNoiseParameters, RaiseLowerParameters,
    RotateParameters, ToolParameters,
};
use crate::terrain::rect::Rect;
use crate::terrain::shadowing;
use crate::terrain::surface::HeightsSurface;
use crate::upload::UploadManager;

/// Persists the cells derived from an uber-surface.
pub trait TerrainFormat: Send + Sync {
    fn write_cell(
        &self,
        destination: &Path,
        surface: &HeightsSurface,
        mins: [u32; 2],
        maxs: [u32; 2],
        tree_depth: u32,
        overlap: u32,
    ) -> anyhow::Result<()>;
}

/// Handed to registered cells right after an edit, so they can patch their
/// own GPU state from the working cache without waiting for a flush.
pub struct ShortCircuitUpdate<'a> {
    pub device: &'a dyn Device,
    pub update_area: Rect,
    /// Surface samples covered by `srv`; its texel (0, 0) is `resource_area.mins`.
    pub resource_area: Rect,
    pub srv: ShaderResourceView,
}

pub type ShortCircuitCallback = Box<dyn FnMut(&ShortCircuitUpdate<'_>) + Send>;

struct RegisteredCell {
    destination: PathBuf,
    bounds: Rect,
    overlap: u32,
    on_update: ShortCircuitCallback,
}

struct GpuCache {
    window: Rect,
    primary: Arc<UnderlyingResource>,
    secondary: Arc<UnderlyingResource>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub builds: u32,
    pub flushes: u32,
    pub dispatches: u32,
    pub short_circuits: u32,
    pub cell_writes: u32,
    pub cell_write_failures: u32,
}

pub(crate) fn working_desc(dims: [u32; 2], name: &str) -> BufferDesc {
    BufferDesc::texture(TextureDesc::plain_2d(dims[0], dims[1], PixelFormat::R32Float))
        .bind_flags(BindFlags::UNORDERED_ACCESS | BindFlags::SHADER_RESOURCE)
        .gpu_access(GpuAccess::READ | GpuAccess::WRITE)
        .name(name)
}

/// Creates a single-channel float texture owned outside any pool.
pub(crate) fn working_texture(
    uploads: &dyn UploadManager,
    dims: [u32; 2],
    name: &str,
    init: Option<&dyn DataPacket>,
) -> Result<Arc<UnderlyingResource>, UploadError> {
    let mut locator =
        uploads.transaction_immediate(&working_desc(dims, name), init, &PartialResource::whole())?;
    locator.adopt_underlying();
    locator.resource().cloned().ok_or(UploadError::EmptyLocator)
}

/// Rows of a window of the heights surface, read in place.
struct WindowPacket<'a> {
    bytes: &'a [u8],
    row_pitch: usize,
}

impl<'a> WindowPacket<'a> {
    fn new(surface: &'a HeightsSurface, window: Rect) -> Self {
        let width = surface.width() as usize;
        let first = window.mins[1] as usize * width + window.mins[0] as usize;
        let last = window.maxs[1] as usize * width + window.maxs[0] as usize;
        let samples = surface.samples();
        let bytes = samples
            .get(first..=last)
            .map_or(&[][..], |rows| bytemuck::cast_slice(rows));
        Self {
            bytes,
            row_pitch: width * size_of::<f32>(),
        }
    }
}

impl DataPacket for WindowPacket<'_> {
    fn data(&self, subresource: SubresourceId) -> Option<&[u8]> {
        (subresource == SubresourceId::FIRST).then_some(self.bytes)
    }

    fn pitches(&self, _subresource: SubresourceId) -> TexturePitches {
        TexturePitches {
            row_pitch: self.row_pitch,
            slice_pitch: 0,
        }
    }
}

/// Editing front end of a heights uber-surface.
///
/// Edits run on a GPU working cache covering a window of the surface. Tools
/// keep the window resident, dispatch a named kernel over the edited area and
/// notify every registered cell that overlaps it. The CPU surface and the
/// cells' persisted files only catch up on [`flush_gpu_cache`], which also
/// happens whenever an edit falls outside the current window.
///
/// [`flush_gpu_cache`]: UberSurfaceInterface::flush_gpu_cache
pub struct UberSurfaceInterface {
    surface: HeightsSurface,
    uploads: Arc<dyn UploadManager>,
    device: Arc<dyn Device>,
    format: Option<Arc<dyn TerrainFormat>>,
    config: UberCacheConfig,
    cache: Option<GpuCache>,
    cells: Vec<RegisteredCell>,
    erosion: Option<ErosionSimulation>,
    diagnostics: Diagnostics,
    stats: CacheStats,
}

impl UberSurfaceInterface {
    pub fn new(
        surface: HeightsSurface,
        uploads: Arc<dyn UploadManager>,
        device: Arc<dyn Device>,
        format: Option<Arc<dyn TerrainFormat>>,
    ) -> Self {
        Self::with_config(surface, uploads, device, format, UberCacheConfig::default())
    }

    pub fn with_config(
        surface: HeightsSurface,
        uploads: Arc<dyn UploadManager>,
        device: Arc<dyn Device>,
        format: Option<Arc<dyn TerrainFormat>>,
        config: UberCacheConfig,
    ) -> Self {
        Self {
            surface,
            uploads,
            device,
            format,
            config,
            cache: None,
            cells: Vec::new(),
            erosion: None,
            diagnostics: Diagnostics::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn surface(&self) -> &HeightsSurface {
        &self.surface
    }

    pub fn config(&self) -> &UberCacheConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn gpu_cache_window(&self) -> Option<Rect> {
        self.cache.as_ref().map(|cache| cache.window)
    }

    /// Registers a cell covering `[mins, maxs]`. Its file is rewritten on
    /// every flush touching it and `on_update` runs after every edit
    /// touching it.
    pub fn register_cell(
        &mut self,
        destination: impl Into<PathBuf>,
        mins: [u32; 2],
        maxs: [u32; 2],
        overlap: u32,
        on_update: impl FnMut(&ShortCircuitUpdate<'_>) + Send + 'static,
    ) {
        let destination = destination.into();
        log::trace!("registered cell {} {:?}-{:?}", destination.display(), mins, maxs);
        self.cells.push(RegisteredCell {
            destination,
            bounds: Rect::new(mins, maxs),
            overlap,
            on_update: Box::new(on_update),
        });
    }

    /// Writes the working cache back into the surface, drops it and rebuilds
    /// every registered cell that intersects the flushed window. A cell that
    /// fails to write is reported and skipped.
    pub fn flush_gpu_cache(&mut self) -> Result<(), SurfaceError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let _span = tracing::trace_span!("flush_gpu_cache").entered();
        let window = cache.window;
        let readback = self
            .uploads
            .resource_read_back(&ResourceLocator::whole(cache.primary.clone()))?;
        self.write_back(window, &readback)?;

        self.erosion_end();
        self.cache = None;
        self.stats.flushes += 1;
        log::debug!("flushed terrain cache {:?}-{:?}", window.mins, window.maxs);

        let Some(format) = &self.format else {
            return Ok(());
        };
        for cell in self.cells.iter().filter(|cell| cell.bounds.intersects(&window)) {
            let result = format.write_cell(
                &cell.destination,
                &self.surface,
                cell.bounds.mins,
                cell.bounds.maxs,
                self.config.tree_depth,
                cell.overlap,
            );
            match result {
                Ok(()) => self.stats.cell_writes += 1,
                Err(e) => {
                    self.stats.cell_write_failures += 1;
                    self.diagnostics.record(
                        "write_cell",
                        format_args!("{}: {:#}", cell.destination.display(), e),
                    );
                }
            }
        }
        Ok(())
    }

    fn write_back(&mut self, window: Rect, readback: &dyn DataPacket) -> Result<(), SurfaceError> {
        let [width, height] = window.dims();
        let (width, height) = (width as usize, height as usize);
        let bytes = readback.data(SubresourceId::FIRST).unwrap_or_default();
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[..bytes.len() / 4 * 4]);
        let stride = match readback.pitches(SubresourceId::FIRST).row_pitch {
            0 => width,
            pitch => pitch / size_of::<f32>(),
        };
        let required = (height - 1) * stride + width;
        if values.len() < required {
            return Err(UploadError::PacketTooSmall {
                provided: bytes.len(),
                required: required * size_of::<f32>(),
            }
            .into());
        }

        let columns = window.mins[0] as usize..=window.maxs[0] as usize;
        for y in 0..height {
            let Some(row) = self.surface.row_mut(window.mins[1] + y as u32) else {
                continue;
            };
            row[columns.clone()].copy_from_slice(&values[y * stride..y * stride + width]);
        }
        Ok(())
    }

    /// Uploads `window` of the surface into a fresh working cache, flushing
    /// any existing one first.
    pub fn build_gpu_cache(&mut self, window: Rect) -> Result<(), SurfaceError> {
        self.flush_gpu_cache()?;
        let _span = tracing::trace_span!("build_gpu_cache").entered();
        let dims = window.dims();
        let packet = WindowPacket::new(&self.surface, window);
        let primary = working_texture(&*self.uploads, dims, "TerrainWorkingCache", Some(&packet))?;
        let secondary =
            working_texture(&*self.uploads, dims, "TerrainWorkingCache", Some(&packet))?;

        log::debug!("built terrain cache {:?}-{:?}", window.mins, window.maxs);
        self.cache = Some(GpuCache {
            window,
            primary,
            secondary,
        });
        self.stats.builds += 1;
        Ok(())
    }

    /// Makes sure `[mins, maxs]` is resident. A request outside the current
    /// window flushes it; a new window reaches `cache_extent` samples past
    /// the request's center on every side.
    pub fn prepare_cache(&mut self, mins: [u32; 2], maxs: [u32; 2]) -> Result<(), SurfaceError> {
        let Some(request) = Rect::checked(mins, maxs)
            .and_then(|rect| rect.clamp_to(self.surface.width(), self.surface.height()))
        else {
            return Ok(());
        };

        if let Some(cache) = &self.cache
            && !cache.window.contains(&request)
        {
            self.flush_gpu_cache()?;
        }

        if self.cache.is_none() {
            let extent = self.config.cache_extent;
            let limit = [self.surface.width() - 1, self.surface.height() - 1];
            let mut window = request;
            for axis in 0..2 {
                let center = (request.mins[axis] + request.maxs[axis]) / 2;
                window.mins[axis] = request.mins[axis].min(center.saturating_sub(extent));
                window.maxs[axis] = request.maxs[axis]
                    .max(center.saturating_add(extent))
                    .min(limit[axis]);
            }
            self.build_gpu_cache(window)?;
        }
        Ok(())
    }

    fn brush(&self, center: [f32; 2], extent: f32) -> Option<Rect> {
        if !self.surface.is_valid() {
            return None;
        }
        let mins = [
            (center[0] - extent).floor().max(0.0) as u32,
            (center[1] - extent).floor().max(0.0) as u32,
        ];
        let maxs = [
            ((center[0] + extent).ceil().max(0.0) as u32).min(self.surface.width() - 1),
            ((center[1] + extent).ceil().max(0.0) as u32).min(self.surface.height() - 1),
        ];
        Rect::checked(mins, maxs)
    }

    /// Refreshes the secondary cache copy, runs `kernel` over `area` and
    /// short-circuits the result. Kernel problems are reported, not returned.
    fn apply_tool(
        &mut self,
        area: Rect,
        kernel: &'static str,
        center: [f32; 2],
        radius: f32,
        adjustment: f32,
        extra: &[&[u8]],
    ) {
        self.erosion_end();
        let Some(cache) = &self.cache else {
            return;
        };
        let _span = tracing::trace_span!("apply_tool", kernel).entered();

        let parameters = ToolParameters {
            center,
            radius,
            adjustment,
            cache_mins: cache.window.mins,
            cache_maxs: cache.window.maxs,
            adj_mins: area.mins,
            _pad: [0; 2],
        };
        let mut constants: SmallVec<[&[u8]; 4]> = SmallVec::new();
        constants.push(bytemuck::bytes_of(&parameters));
        constants.extend_from_slice(extra);

        let result = self
            .device
            .copy_resource(&cache.secondary, &cache.primary)
            .and_then(|()| {
                self.device.dispatch(&ComputeDispatch {
                    kernel,
                    group_count: self.config.group_count(area.dims()),
                    constants: &constants,
                    uavs: &[&cache.primary],
                    srvs: &[&cache.secondary],
                })
            });
        match result {
            Ok(()) => {
                self.stats.dispatches += 1;
                self.short_circuit(area);
            }
            Err(e) => self.diagnostics.record(kernel, e),
        }
    }

    /// Tells every registered cell overlapping `area` that the working cache
    /// changed there.
    fn short_circuit(&mut self, area: Rect) {
        let Some(cache) = &self.cache else {
            return;
        };
        let update = ShortCircuitUpdate {
            device: &*self.device,
            update_area: area,
            resource_area: cache.window,
            srv: ShaderResourceView::new(cache.primary.clone()),
        };
        for cell in self
            .cells
            .iter_mut()
            .filter(|cell| cell.bounds.intersects(&area))
        {
            (cell.on_update)(&update);
            self.stats.short_circuits += 1;
        }
    }

    pub fn adjust_heights(
        &mut self,
        center: [f32; 2],
        radius: f32,
        adjustment: f32,
        power: f32,
    ) -> Result<(), SurfaceError> {
        let Some(area) = self.brush(center, radius) else {
            return Ok(());
        };
        self.prepare_cache(area.mins, area.maxs)?;
        let extra = RaiseLowerParameters {
            power,
            _pad: [0.0; 3],
        };
        self.apply_tool(
            area,
            kernels::RAISE_LOWER,
            center,
            radius,
            adjustment,
            &[bytemuck::bytes_of(&extra)],
        );
        Ok(())
    }

    pub fn add_noise(
        &mut self,
        center: [f32; 2],
        radius: f32,
        adjustment: f32,
    ) -> Result<(), SurfaceError> {
        let Some(area) = self.brush(center, radius) else {
            return Ok(());
        };
        self.prepare_cache(area.mins, area.maxs)?;
        self.apply_tool(area, kernels::ADD_NOISE, center, radius, adjustment, &[]);
        Ok(())
    }

    pub fn copy_height(
        &mut self,
        center: [f32; 2],
        source: [f32; 2],
        radius: f32,
        adjustment: f32,
        power: f32,
        flags: u32,
    ) -> Result<(), SurfaceError> {
        let Some(area) = self.brush(center, radius) else {
            return Ok(());
        };
        self.prepare_cache(area.mins, area.maxs)?;
        let extra = CopyHeightParameters {
            source,
            power,
            flags,
        };
        self.apply_tool(
            area,
            kernels::COPY_HEIGHT,
            center,
            radius,
            adjustment,
            &[bytemuck::bytes_of(&extra)],
        );
        Ok(())
    }

    /// Rotates the terrain around a horizontal `axis` through `center`. The
    /// edited area reaches a little past `radius` to catch moved samples.
    pub fn rotate(
        &mut self,
        center: [f32; 2],
        radius: f32,
        axis: [f32; 2],
        angle: f32,
    ) -> Result<(), SurfaceError> {
        let Some(area) = self.brush(center, 1.2 * radius) else {
            return Ok(());
        };
        self.prepare_cache(area.mins, area.maxs)?;
        let extra = RotateParameters {
            axis,
            angle,
            _pad: 0.0,
        };
        self.apply_tool(
            area,
            kernels::ROTATE,
            center,
            radius,
            1.0,
            &[bytemuck::bytes_of(&extra)],
        );
        Ok(())
    }

    /// Gaussian blur. The filter reads `filter_radius` samples past the
    /// edited area, so that much more is made resident.
    pub fn smooth(
        &mut self,
        center: [f32; 2],
        radius: f32,
        filter_radius: u32,
        standard_deviation: f32,
        strength: f32,
        flags: u32,
    ) -> Result<(), SurfaceError> {
        let Some(area) = self.brush(center, radius) else {
            return Ok(());
        };
        let limit = [self.surface.width() - 1, self.surface.height() - 1];
        let footprint = area.expand(filter_radius, limit);
        self.prepare_cache(footprint.mins, footprint.maxs)?;
        let extra = BlurParameters::new(filter_radius, standard_deviation, flags);
        self.apply_tool(
            area,
            kernels::SMOOTH,
            center,
            radius,
            strength,
            &[bytemuck::bytes_of(&extra)],
        );
        Ok(())
    }

    pub fn fill_with_noise(
        &mut self,
        mins: [f32; 2],
        maxs: [f32; 2],
        base_height: f32,
        noise_height: f32,
        roughness: f32,
        fractal_detail: f32,
    ) -> Result<(), SurfaceError> {
        if !self.surface.is_valid() {
            return Ok(());
        }
        let area_mins = [mins[0].max(0.0) as u32, mins[1].max(0.0) as u32];
        let area_maxs = [
            (maxs[0].max(0.0) as u32).min(self.surface.width() - 1),
            (maxs[1].max(0.0) as u32).min(self.surface.height() - 1),
        ];
        let Some(area) = Rect::checked(area_mins, area_maxs) else {
            return Ok(());
        };
        self.prepare_cache(area.mins, area.maxs)?;
        let extra = FillWithNoiseParameters {
            mins,
            maxs,
            base_height,
            noise_height,
            roughness,
            fractal_detail,
        };
        let center = [(mins[0] + maxs[0]) * 0.5, (mins[1] + maxs[1]) * 0.5];
        self.apply_tool(
            area,
            kernels::FILL_WITH_NOISE,
            center,
            1.0,
            1.0,
            &[bytemuck::bytes_of(&extra)],
        );
        Ok(())
    }

    /// Starts an erosion simulation over `[mins, maxs]`, rounded out to whole
    /// water tiles. Any running simulation is dropped first.
    pub fn erosion_begin(&mut self, mins: [f32; 2], maxs: [f32; 2]) -> Result<(), SurfaceError> {
        self.erosion_end();
        if !self.surface.is_valid() {
            return Ok(());
        }
        let (lo, hi) = tile_aligned_region(mins, maxs, self.config.erosion_tile);
        let region_mins = lo.map(|v| v.clamp(0, i64::from(u32::MAX)) as u32);
        let region_maxs = hi.map(|v| v.clamp(0, i64::from(u32::MAX)) as u32);
        self.prepare_cache(region_mins, region_maxs)?;
        let Some(cache) = &self.cache else {
            return Ok(());
        };

        let window = cache.window;
        let [cache_width, cache_height] = window.dims();
        let offset = [
            region_mins[0].saturating_sub(window.mins[0]),
            region_mins[1].saturating_sub(window.mins[1]),
        ];
        let sim_size = [
            ((hi[0] - lo[0]) as u32).min(cache_width.saturating_sub(offset[0])),
            ((hi[1] - lo[1]) as u32).min(cache_height.saturating_sub(offset[1])),
        ];
        if sim_size[0] == 0 || sim_size[1] == 0 {
            return Ok(());
        }

        let simulation = ErosionSimulation::begin(
            &*self.uploads,
            &*self.device,
            &cache.primary,
            offset,
            sim_size,
        )?;
        self.erosion = Some(simulation);
        Ok(())
    }

    /// Advances the simulation by one step and short-circuits the simulated
    /// area. Does nothing without a running simulation.
    pub fn erosion_tick(&mut self, params: &ErosionParameters) {
        let (Some(simulation), Some(cache)) = (&mut self.erosion, &self.cache) else {
            return;
        };
        if let Err(e) = simulation.tick(&*self.device, &cache.primary, &self.config, params) {
            self.diagnostics.record("erosion_tick", e);
            return;
        }

        let offset = simulation.gpu_cache_offset();
        let size = simulation.sim_size();
        let mins = [
            cache.window.mins[0] + offset[0],
            cache.window.mins[1] + offset[1],
        ];
        let area = Rect::new(mins, [mins[0] + size[0] - 1, mins[1] + size[1] - 1]);
        self.short_circuit(area);
    }

    pub fn erosion_end(&mut self) {
        if let Some(simulation) = self.erosion.take() {
            log::debug!("erosion: ended after {} ticks", simulation.buffer_count());
        }
    }

    pub fn erosion_is_prepared(&self) -> bool {
        self.erosion.is_some()
    }

    pub fn erosion(&self) -> Option<&ErosionSimulation> {
        self.erosion.as_ref()
    }

    /// See [`shadowing::calculate_shadowing_angle`].
    pub fn calculate_shadowing_angle(
        &self,
        sample: [f32; 2],
        sample_height: f32,
        sun_direction_of_movement: [f32; 2],
        xy_scale: f32,
    ) -> f32 {
        shadowing::calculate_shadowing_angle(
            &self.surface,
            sample,
            sample_height,
            sun_direction_of_movement,
            xy_scale,
        )
    }

    /// Writes a shadowing surface aligned with the heights. Samples outside
    /// `[interesting_mins, interesting_maxs)` are never shadowed.
    pub fn build_shadowing_surface(
        &self,
        destination: impl AsRef<Path>,
        interesting_mins: [u32; 2],
        interesting_maxs: [u32; 2],
        sun_direction_of_movement: [f32; 2],
        xy_scale: f32,
    ) -> Result<(), SurfaceError> {
        shadowing::build_shadowing_surface(
            &self.surface,
            destination.as_ref(),
            interesting_mins,
            interesting_maxs,
            sun_direction_of_movement,
            xy_scale,
        )
    }
}

impl Drop for UberSurfaceInterface {
    fn drop(&mut self) {
        if self.cache.is_some()
            && let Err(e) = self.flush_gpu_cache()
        {
            log::error!("terrain cache lost on drop: {}", e);
        }
    }
}

impl fmt::Debug for UberSurfaceInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UberSurfaceInterface")
            .field("surface", &self.surface)
            .field("window", &self.gpu_cache_window())
            .field("cells", &self.cells.len())
            .field("erosion", &self.erosion.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}
