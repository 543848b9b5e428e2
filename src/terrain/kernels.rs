//! Names and parameter blocks of the compute kernels the terrain tools
//! dispatch. Every tool binds [`ToolParameters`] in slot 0 followed by its
//! own block; erosion kernels bind only their own block.

use bytemuck::{Pod, Zeroable};

pub const RAISE_LOWER: &str = "RaiseLower";
pub const ADD_NOISE: &str = "AddNoise";
pub const COPY_HEIGHT: &str = "CopyHeight";
pub const ROTATE: &str = "Rotate";
pub const SMOOTH: &str = "Smooth";
pub const FILL_WITH_NOISE: &str = "FillWithNoise";
pub const SHALLOW_WATER: &str = "ShallowWater";
pub const TICK_EROSION: &str = "TickErosion";

pub const MAX_FILTER_TAPS: usize = 33;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ToolParameters {
    pub center: [f32; 2],
    pub radius: f32,
    pub adjustment: f32,
    pub cache_mins: [u32; 2],
    pub cache_maxs: [u32; 2],
    pub adj_mins: [u32; 2],
    pub _pad: [i32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RaiseLowerParameters {
    pub power: f32,
    pub _pad: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CopyHeightParameters {
    pub source: [f32; 2],
    pub power: f32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RotateParameters {
    pub axis: [f32; 2],
    pub angle: f32,
    pub _pad: f32,
}

/// Gaussian taps, each splatted across four lanes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BlurParameters {
    pub weights: [[f32; 4]; MAX_FILTER_TAPS],
    pub filter_size: u32,
    pub flags: u32,
    pub _pad: [u32; 2],
}

impl BlurParameters {
    pub fn new(filter_radius: u32, standard_deviation: f32, flags: u32) -> Self {
        let filter_size = (1 + filter_radius.saturating_mul(2)).min(MAX_FILTER_TAPS as u32);
        let mut parameters = Self::zeroed();
        parameters.filter_size = filter_size;
        parameters.flags = flags;
        for (lane, weight) in parameters
            .weights
            .iter_mut()
            .zip(gaussian_weights(standard_deviation, filter_size as usize))
        {
            *lane = [weight; 4];
        }
        parameters
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FillWithNoiseParameters {
    pub mins: [f32; 2],
    pub maxs: [f32; 2],
    pub base_height: f32,
    pub noise_height: f32,
    pub roughness: f32,
    pub fractal_detail: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ShallowWaterConstants {
    pub gpu_cache_offset: [u32; 2],
    pub simulation_size: [u32; 2],
    pub rain_quantity: f32,
    pub physical_tile_dimension: f32,
    pub buffer_index: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TickErosionConstants {
    pub gpu_cache_offset: [u32; 2],
    pub simulation_size: [u32; 2],
    pub change_to_soft: f32,
    pub soft_flow: f32,
    pub soft_change_back: f32,
    pub _pad: u32,
}

/// Normalised 1D gaussian of `count` taps centred on the middle tap.
pub fn gaussian_weights(standard_deviation: f32, count: usize) -> Vec<f32> {
    if count == 0 {
        return Vec::new();
    }
    let sigma = standard_deviation.max(f32::EPSILON);
    let middle = (count as f32 - 1.0) / 2.0;
    let mut weights: Vec<f32> = (0..count)
        .map(|i| {
            let x = i as f32 - middle;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    if total > 0.0 {
        weights.iter_mut().for_each(|w| *w /= total);
    }
    weights
}
