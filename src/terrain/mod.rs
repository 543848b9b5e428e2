mod config;
mod erosion;
mod interface;
pub mod kernels;
mod rect;
mod shadowing;
mod surface;

pub use config::UberCacheConfig;
pub use erosion::{ErosionParameters, ErosionSimulation};
pub use interface::{
    CacheStats, ShortCircuitCallback, ShortCircuitUpdate, TerrainFormat, UberSurfaceInterface,
};
pub use rect::Rect;
pub use shadowing::{MAX_SHADOW_DISTANCE, build_shadowing_surface, calculate_shadowing_angle};
pub use surface::{HeightsSurface, ShadowSample, ShadowingSurface, UberHeader, UberSurface};
