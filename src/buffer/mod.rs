mod locator;
mod packet;
mod partial;
mod resource;
mod spec;

pub use locator::{ResourceLocator, ResourcePool};
pub use packet::{BasicPacket, DataPacket, SubresourceId, TexturePitches};
pub use partial::{Box2D, PartialResource};
pub use resource::{BackendResource, ResourceId, ShaderResourceView, UnderlyingResource};
pub use spec::{
    AllocationRules, BindFlags, BufferDesc, BufferKind, CpuAccess, DESC_NAME_CAPACITY, DescName,
    Dimensionality, GpuAccess, LinearBufferDesc, PixelFormat, SubresourceLayout, TextureDesc,
    TextureSamples, UploadDataType,
};
