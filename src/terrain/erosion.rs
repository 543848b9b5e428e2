use std::sync::Arc;

use crate::buffer::{Box2D, UnderlyingResource};
use crate::device::{ComputeDispatch, Device};
use crate::error::{DeviceError, SurfaceError};
use crate::terrain::config::UberCacheConfig;
use crate::terrain::interface::working_texture;
use crate::terrain::kernels::{self, ShallowWaterConstants, TickErosionConstants};
use crate::upload::UploadManager;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ErosionParameters {
    pub rain_quantity_per_frame: f32,
    pub change_to_soft_constant: f32,
    pub soft_flow_constant: f32,
    pub soft_change_back_constant: f32,
}

impl Default for ErosionParameters {
    fn default() -> Self {
        Self {
            rain_quantity_per_frame: 0.05,
            change_to_soft_constant: 0.1,
            soft_flow_constant: 0.25,
            soft_change_back_constant: 0.01,
        }
    }
}

/// Paired material layers and ping-pong water buffers for one simulated
/// region of the working cache.
pub struct ErosionSimulation {
    hard_materials: Arc<UnderlyingResource>,
    soft_materials: Arc<UnderlyingResource>,
    soft_materials_copy: Arc<UnderlyingResource>,
    water: [Arc<UnderlyingResource>; 2],
    buffer_count: u32,
    gpu_cache_offset: [u32; 2],
    sim_size: [u32; 2],
}

impl ErosionSimulation {
    /// Allocates the simulation textures. The hard layer starts as a copy of
    /// the simulated part of `heights`; soft material and water start empty.
    pub(crate) fn begin(
        uploads: &dyn UploadManager,
        device: &dyn Device,
        heights: &UnderlyingResource,
        gpu_cache_offset: [u32; 2],
        sim_size: [u32; 2],
    ) -> Result<Self, SurfaceError> {
        let _span = tracing::trace_span!("erosion_begin").entered();
        let hard_materials = working_texture(uploads, sim_size, "ErosionHardMaterials", None)?;
        let soft_materials = working_texture(uploads, sim_size, "ErosionSoftMaterials", None)?;
        let soft_materials_copy =
            working_texture(uploads, sim_size, "ErosionSoftMaterialsCopy", None)?;
        let water = [
            working_texture(uploads, sim_size, "ErosionWater", None)?,
            working_texture(uploads, sim_size, "ErosionWater", None)?,
        ];

        device.clear(&soft_materials, 0)?;
        for buffer in &water {
            device.clear(buffer, 0)?;
        }
        device.copy_texture_region(
            &hard_materials,
            (0, 0),
            heights,
            Box2D::from_origin(gpu_cache_offset, sim_size),
        )?;

        log::debug!(
            "erosion: simulating {}x{} at cache offset {:?}",
            sim_size[0],
            sim_size[1],
            gpu_cache_offset
        );
        Ok(Self {
            hard_materials,
            soft_materials,
            soft_materials_copy,
            water,
            buffer_count: 0,
            gpu_cache_offset,
            sim_size,
        })
    }

    /// Runs one water step then moves material with the water, writing the
    /// result into `heights`.
    pub(crate) fn tick(
        &mut self,
        device: &dyn Device,
        heights: &UnderlyingResource,
        config: &UberCacheConfig,
        params: &ErosionParameters,
    ) -> Result<(), DeviceError> {
        let _span = tracing::trace_span!("erosion_tick").entered();
        let previous = &self.water[(self.buffer_count % 2) as usize];
        let next = &self.water[((self.buffer_count + 1) % 2) as usize];
        let group_count = config.group_count(self.sim_size);

        let water_constants = ShallowWaterConstants {
            gpu_cache_offset: self.gpu_cache_offset,
            simulation_size: self.sim_size,
            rain_quantity: params.rain_quantity_per_frame,
            physical_tile_dimension: config.terrain_scale * config.erosion_tile as f32,
            buffer_index: self.buffer_count,
            _pad: 0,
        };
        device.dispatch(&ComputeDispatch {
            kernel: kernels::SHALLOW_WATER,
            group_count,
            constants: &[bytemuck::bytes_of(&water_constants)],
            uavs: &[next],
            srvs: &[previous, heights],
        })?;

        device.copy_resource(&self.soft_materials_copy, &self.soft_materials)?;
        let erosion_constants = TickErosionConstants {
            gpu_cache_offset: self.gpu_cache_offset,
            simulation_size: self.sim_size,
            change_to_soft: params.change_to_soft_constant,
            soft_flow: params.soft_flow_constant,
            soft_change_back: params.soft_change_back_constant,
            _pad: 0,
        };
        device.dispatch(&ComputeDispatch {
            kernel: kernels::TICK_EROSION,
            group_count,
            constants: &[bytemuck::bytes_of(&erosion_constants)],
            uavs: &[heights, &self.hard_materials, &self.soft_materials],
            srvs: &[&self.soft_materials_copy, next],
        })?;

        self.buffer_count += 1;
        Ok(())
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn gpu_cache_offset(&self) -> [u32; 2] {
        self.gpu_cache_offset
    }

    pub fn sim_size(&self) -> [u32; 2] {
        self.sim_size
    }
}

/// Rounds `[mins, maxs]` out to whole tiles around its (floored) center.
/// Returns the simulated corner pair, which may reach past either edge of
/// the surface before clamping.
pub(crate) fn tile_aligned_region(mins: [f32; 2], maxs: [f32; 2], tile: u32) -> ([i64; 2], [i64; 2]) {
    let tile = i64::from(tile.max(1));
    let mut lo = [0; 2];
    let mut hi = [0; 2];
    for axis in 0..2 {
        let center = ((mins[axis] + maxs[axis]) / 2.0).floor() as i64;
        let extent = (maxs[axis] - mins[axis]).max(0.0);
        let tiles = ((extent / tile as f32).ceil() as i64).max(1);
        let size = tiles * tile;
        lo[axis] = center - size / 2;
        hi[axis] = center + size / 2;
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_round_out_to_whole_tiles() {
        let (lo, hi) = tile_aligned_region([100.0, 100.0], [300.0, 180.0], 256);
        assert_eq!(lo, [72, 12]);
        assert_eq!(hi, [328, 268]);

        let (lo, hi) = tile_aligned_region([0.0, 0.0], [300.0, 10.0], 256);
        assert_eq!(hi[0] - lo[0], 512);
        assert_eq!(lo[1], -123);
    }
}
