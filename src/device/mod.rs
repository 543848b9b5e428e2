use std::ops::Range;
use std::sync::Arc;

use crate::buffer::{BasicPacket, Box2D, BufferDesc, DataPacket, PartialResource, UnderlyingResource};
use crate::error::DeviceError;

mod host;

pub use host::{HostBinding, HostDevice, HostDeviceStats, HostKernel, HostKernelArgs, HostView};

/// Named compute dispatch. `constants` are raw parameter blocks in binding
/// order; a resource may appear at most once across `uavs` and `srvs`.
pub struct ComputeDispatch<'a> {
    pub kernel: &'a str,
    pub group_count: [u32; 3],
    pub constants: &'a [&'a [u8]],
    pub uavs: &'a [&'a UnderlyingResource],
    pub srvs: &'a [&'a UnderlyingResource],
}

/// Backend capabilities consumed by the upload manager and the terrain cache.
///
/// Operations are ordered as issued. `read_back` is the only one that waits
/// for previously issued work.
pub trait Device: Send + Sync {
    fn create_resource(
        &self,
        desc: &BufferDesc,
        init: Option<&dyn DataPacket>,
    ) -> Result<Arc<UnderlyingResource>, DeviceError>;

    /// Writes `packet` into `dst`, limited to `partial`. Linear writes start
    /// at `window.start` and never leave `window`; a partial box reaching past
    /// it is `OutOfRange`. Textures ignore `window`. Returns the bytes written.
    fn update_resource(
        &self,
        dst: &UnderlyingResource,
        window: Range<usize>,
        packet: &dyn DataPacket,
        partial: &PartialResource,
    ) -> Result<usize, DeviceError>;

    fn copy_resource(
        &self,
        dst: &UnderlyingResource,
        src: &UnderlyingResource,
    ) -> Result<(), DeviceError>;

    fn copy_region(
        &self,
        dst: &UnderlyingResource,
        dst_offset: usize,
        src: &UnderlyingResource,
        src_offset: usize,
        size: usize,
    ) -> Result<(), DeviceError>;

    /// Copies `src_area` of the top mip of `src` to `dst_origin` in `dst`.
    fn copy_texture_region(
        &self,
        dst: &UnderlyingResource,
        dst_origin: (u32, u32),
        src: &UnderlyingResource,
        src_area: Box2D,
    ) -> Result<(), DeviceError>;

    /// Blocking read of `range` (bytes), or of the whole resource.
    fn read_back(
        &self,
        src: &UnderlyingResource,
        range: Option<Range<usize>>,
    ) -> Result<BasicPacket, DeviceError>;

    /// Fills every 32-bit word of `dst` with `value`.
    fn clear(&self, dst: &UnderlyingResource, value: u32) -> Result<(), DeviceError>;

    fn dispatch(&self, dispatch: &ComputeDispatch<'_>) -> Result<(), DeviceError>;
}
