use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// How a resource can be bound to the pipeline. Most resources carry a
    /// single flag; input/output pairs such as `RENDER_TARGET | SHADER_RESOURCE`
    /// are the common exception.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const SHADER_RESOURCE = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const DEPTH_STENCIL = 1 << 4;
        const UNORDERED_ACCESS = 1 << 5;
        const STRUCTURED_BUFFER = 1 << 6;
        const CONSTANT_BUFFER = 1 << 7;
        const STREAM_OUTPUT = 1 << 8;
        const DRAW_INDIRECT_ARGS = 1 << 9;
        const RAW_VIEWS = 1 << 10;
    }
}

bitflags! {
    /// CPU access privileges. Prefer `WRITE` over `WRITE_DYNAMIC` unless the
    /// resource is rewritten several times per frame.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CpuAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const WRITE_DYNAMIC = (1 << 2) | Self::WRITE.bits();
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GpuAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// How the manager is allowed to allocate the resource.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocationRules: u32 {
        /// Reuse a compatible resource that was recently released.
        const POOLED = 1 << 0;
        /// Sub-allocate from a shared heap together with similar uploads.
        const BATCHED = 1 << 1;
        /// CPU-side staging memory only.
        const STAGING = 1 << 2;
        /// Memory must survive a device reset.
        const NON_VOLATILE = 1 << 3;
    }
}

/// Metric bucket for uploads and creations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UploadDataType {
    Texture,
    Vertex,
    Index,
}

impl UploadDataType {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            UploadDataType::Texture => 0,
            UploadDataType::Vertex => 1,
            UploadDataType::Index => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Unknown,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm,
    R16Uint,
    R16Float,
    R16G16Uint,
    R16G16B16A16Float,
    R32Float,
    R32Uint,
    R32G32Float,
    R32G32B32A32Float,
    D32Float,
    D24UnormS8Uint,
    Bc1Unorm,
    Bc3Unorm,
}

impl PixelFormat {
    /// `(block width, block height, bytes per block)`. Uncompressed formats use
    /// 1x1 blocks.
    pub fn block(self) -> (u32, u32, u32) {
        match self {
            PixelFormat::Unknown => (1, 1, 0),
            PixelFormat::R8Unorm => (1, 1, 1),
            PixelFormat::R8G8Unorm | PixelFormat::R16Uint | PixelFormat::R16Float => (1, 1, 2),
            PixelFormat::R8G8B8A8Unorm
            | PixelFormat::R8G8B8A8UnormSrgb
            | PixelFormat::B8G8R8A8Unorm
            | PixelFormat::R16G16Uint
            | PixelFormat::R32Float
            | PixelFormat::R32Uint
            | PixelFormat::D32Float
            | PixelFormat::D24UnormS8Uint => (1, 1, 4),
            PixelFormat::R16G16B16A16Float | PixelFormat::R32G32Float => (1, 1, 8),
            PixelFormat::R32G32B32A32Float => (1, 1, 16),
            PixelFormat::Bc1Unorm => (4, 4, 8),
            PixelFormat::Bc3Unorm => (4, 4, 16),
        }
    }

    pub fn is_compressed(self) -> bool {
        let (w, h, _) = self.block();
        w > 1 || h > 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LinearBufferDesc {
    pub size_in_bytes: u32,
    pub structure_byte_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureSamples {
    pub sample_count: u8,
    pub sampling_quality: u8,
}

impl TextureSamples {
    pub fn new(sample_count: u8, sampling_quality: u8) -> Self {
        Self {
            sample_count,
            sampling_quality,
        }
    }
}

impl Default for TextureSamples {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dimensionality {
    T1D,
    T2D,
    T3D,
    CubeMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: PixelFormat,
    pub dimensionality: Dimensionality,
    pub mip_count: u8,
    pub array_count: u8,
    pub samples: TextureSamples,
}

/// Placement of one (mip, array layer) inside a tightly packed texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceLayout {
    pub offset: usize,
    pub row_pitch: usize,
    pub slice_pitch: usize,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Rows of blocks per slice.
    pub block_rows: u32,
}

impl TextureDesc {
    pub fn plain_1d(width: u32, format: PixelFormat, mip_count: u8, array_count: u8) -> Self {
        Self {
            width,
            height: 1,
            depth: 1,
            format,
            dimensionality: Dimensionality::T1D,
            mip_count,
            array_count,
            samples: TextureSamples::default(),
        }
    }

    pub fn plain_2d(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            format,
            dimensionality: Dimensionality::T2D,
            mip_count: 1,
            array_count: 0,
            samples: TextureSamples::default(),
        }
    }

    pub fn plain_3d(width: u32, height: u32, depth: u32, format: PixelFormat, mip_count: u8) -> Self {
        Self {
            width,
            height,
            depth,
            format,
            dimensionality: Dimensionality::T3D,
            mip_count,
            array_count: 0,
            samples: TextureSamples::default(),
        }
    }

    pub fn mips(mut self, mip_count: u8) -> Self {
        self.mip_count = mip_count;
        self
    }

    pub fn array(mut self, array_count: u8) -> Self {
        self.array_count = array_count;
        self
    }

    pub fn samples(mut self, samples: TextureSamples) -> Self {
        self.samples = samples;
        self
    }

    pub fn cube_map(mut self) -> Self {
        self.dimensionality = Dimensionality::CubeMap;
        self
    }

    pub fn mip_levels(&self) -> u32 {
        u32::from(self.mip_count.max(1))
    }

    /// Array layers including the six faces of cube maps.
    pub fn layers(&self) -> u32 {
        let arrays = u32::from(self.array_count.max(1));
        match self.dimensionality {
            Dimensionality::CubeMap => arrays * 6,
            _ => arrays,
        }
    }

    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        let depth = match self.dimensionality {
            Dimensionality::T3D => (self.depth >> mip).max(1),
            _ => 1,
        };
        ((self.width >> mip).max(1), (self.height >> mip).max(1), depth)
    }

    fn mip_bytes(&self, mip: u32) -> (usize, usize, u32) {
        let (w, h, d) = self.mip_extent(mip);
        let (bw, bh, bytes) = self.format.block();
        let row_pitch = w.div_ceil(bw) as usize * bytes as usize;
        let block_rows = h.div_ceil(bh);
        let slice_pitch = row_pitch * block_rows as usize;
        (row_pitch, slice_pitch * d as usize, block_rows)
    }

    /// Bytes of a single sample of every mip of every layer.
    fn single_sample_bytes(&self) -> usize {
        let per_layer: usize = (0..self.mip_levels()).map(|m| self.mip_bytes(m).1).sum();
        per_layer * self.layers() as usize
    }

    /// Layout of `(mip, layer)`; layers are stored one after another, each
    /// holding its full mip chain.
    pub fn subresource_layout(&self, mip: u32, layer: u32) -> Option<SubresourceLayout> {
        if mip >= self.mip_levels() || layer >= self.layers() {
            return None;
        }
        let per_layer: usize = (0..self.mip_levels()).map(|m| self.mip_bytes(m).1).sum();
        let before_mip: usize = (0..mip).map(|m| self.mip_bytes(m).1).sum();
        let (row_pitch, total, block_rows) = self.mip_bytes(mip);
        let (width, height, depth) = self.mip_extent(mip);
        Some(SubresourceLayout {
            offset: per_layer * layer as usize + before_mip,
            row_pitch,
            slice_pitch: total / depth as usize,
            width,
            height,
            depth,
            block_rows,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Linear(LinearBufferDesc),
    Texture(TextureDesc),
}

pub const DESC_NAME_CAPACITY: usize = 48;

/// Fixed-capacity diagnostic name. Longer names are truncated on a char
/// boundary so the description stays `Copy`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescName {
    bytes: [u8; DESC_NAME_CAPACITY],
    len: u8,
}

impl DescName {
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(DESC_NAME_CAPACITY - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; DESC_NAME_CAPACITY];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self {
            bytes,
            len: end as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl Default for DescName {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Debug for DescName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Description of a resource to create. The payload variant is the
/// discriminant, so a texture description can never be read as a linear one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub kind: BufferKind,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccess,
    pub gpu_access: GpuAccess,
    pub allocation_rules: AllocationRules,
    pub name: DescName,
}

impl BufferDesc {
    pub fn linear(size_in_bytes: u32, structure_byte_size: u32) -> Self {
        Self::new(BufferKind::Linear(LinearBufferDesc {
            size_in_bytes,
            structure_byte_size,
        }))
    }

    pub fn texture(texture: TextureDesc) -> Self {
        Self::new(BufferKind::Texture(texture))
    }

    fn new(kind: BufferKind) -> Self {
        Self {
            kind,
            bind_flags: BindFlags::empty(),
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ,
            allocation_rules: AllocationRules::empty(),
            name: DescName::default(),
        }
    }

    pub fn bind_flags(mut self, bind_flags: BindFlags) -> Self {
        self.bind_flags = bind_flags;
        self
    }

    pub fn cpu_access(mut self, cpu_access: CpuAccess) -> Self {
        self.cpu_access = cpu_access;
        self
    }

    pub fn gpu_access(mut self, gpu_access: GpuAccess) -> Self {
        self.gpu_access = gpu_access;
        self
    }

    pub fn allocation_rules(mut self, allocation_rules: AllocationRules) -> Self {
        self.allocation_rules = allocation_rules;
        self
    }

    pub fn name(mut self, name: impl AsRef<str>) -> Self {
        self.name = DescName::new(name.as_ref());
        self
    }

    pub fn as_linear(&self) -> Option<&LinearBufferDesc> {
        match &self.kind {
            BufferKind::Linear(linear) => Some(linear),
            BufferKind::Texture(_) => None,
        }
    }

    pub fn as_texture(&self) -> Option<&TextureDesc> {
        match &self.kind {
            BufferKind::Texture(texture) => Some(texture),
            BufferKind::Linear(_) => None,
        }
    }

    /// Byte footprint implied by the description.
    pub fn byte_count(&self) -> usize {
        match &self.kind {
            BufferKind::Linear(linear) => linear.size_in_bytes as usize,
            BufferKind::Texture(texture) => {
                texture.single_sample_bytes() * usize::from(texture.samples.sample_count.max(1))
            }
        }
    }

    pub fn upload_data_type(&self) -> UploadDataType {
        match &self.kind {
            BufferKind::Texture(_) => UploadDataType::Texture,
            BufferKind::Linear(_) if self.bind_flags.contains(BindFlags::INDEX_BUFFER) => {
                UploadDataType::Index
            }
            BufferKind::Linear(_) => UploadDataType::Vertex,
        }
    }
}

impl fmt::Display for BufferDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            BufferKind::Linear(linear) => write!(
                f,
                "BufferDesc(linear, size={}, stride={}",
                linear.size_in_bytes, linear.structure_byte_size
            )?,
            BufferKind::Texture(texture) => write!(
                f,
                "BufferDesc(texture, extent={}x{}x{}, format={:?}, dims={:?}, mips={}, arrays={}, samples={}/{}",
                texture.width,
                texture.height,
                texture.depth,
                texture.format,
                texture.dimensionality,
                texture.mip_count,
                texture.array_count,
                texture.samples.sample_count,
                texture.samples.sampling_quality,
            )?,
        }
        write!(
            f,
            ", bind={:?}, cpu={:?}, gpu={:?}, rules={:?}, name={})",
            self.bind_flags,
            self.cpu_access,
            self.gpu_access,
            self.allocation_rules,
            match self.name.as_str() {
                "" => "<none>",
                name => name,
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_desc_reads_back_through_the_variant() {
        let texture = TextureDesc::plain_2d(256, 128, PixelFormat::R8G8B8A8Unorm)
            .mips(4)
            .array(2)
            .samples(TextureSamples::new(4, 1));
        let desc = BufferDesc::texture(texture)
            .bind_flags(BindFlags::SHADER_RESOURCE)
            .name("albedo");

        assert!(desc.as_linear().is_none());
        let read = desc.as_texture().expect("texture variant");
        assert_eq!(read.width, 256);
        assert_eq!(read.height, 128);
        assert_eq!(read.depth, 1);
        assert_eq!(read.format, PixelFormat::R8G8B8A8Unorm);
        assert_eq!(read.mip_count, 4);
        assert_eq!(read.array_count, 2);
        assert_eq!(read.samples, TextureSamples::new(4, 1));
        assert_eq!(read.dimensionality, Dimensionality::T2D);
    }

    #[test]
    fn byte_count_of_linear_buffer_is_its_size() {
        assert_eq!(BufferDesc::linear(1024, 16).byte_count(), 1024);
    }

    #[test]
    fn byte_count_sums_the_mip_chain() {
        let desc = BufferDesc::texture(TextureDesc::plain_2d(4, 4, PixelFormat::R32Float).mips(3));
        // 4x4 + 2x2 + 1x1 texels of 4 bytes
        assert_eq!(desc.byte_count(), (16 + 4 + 1) * 4);
    }

    #[test]
    fn byte_count_rounds_compressed_formats_to_blocks() {
        let desc = BufferDesc::texture(TextureDesc::plain_2d(6, 6, PixelFormat::Bc1Unorm).mips(2));
        // mip0: 2x2 blocks, mip1: 3x3 texels -> 1 block
        assert_eq!(desc.byte_count(), (4 + 1) * 8);
    }

    #[test]
    fn cube_maps_count_six_faces() {
        let desc = BufferDesc::texture(TextureDesc::plain_2d(2, 2, PixelFormat::R8Unorm).cube_map());
        assert_eq!(desc.byte_count(), 4 * 6);
    }

    #[test]
    fn subresource_layout_follows_layer_then_mip_order() {
        let texture = TextureDesc::plain_2d(4, 4, PixelFormat::R8Unorm).mips(2).array(2);
        let layer1_mip1 = texture.subresource_layout(1, 1).unwrap();
        assert_eq!(layer1_mip1.offset, (16 + 4) + 16);
        assert_eq!(layer1_mip1.row_pitch, 2);
        assert!(texture.subresource_layout(2, 0).is_none());
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "x".repeat(100);
        let desc = BufferDesc::linear(4, 0).name(&long);
        assert_eq!(desc.name.as_str().len(), DESC_NAME_CAPACITY - 1);
    }

    #[test]
    fn index_buffers_are_classified_separately() {
        let desc = BufferDesc::linear(64, 2).bind_flags(BindFlags::INDEX_BUFFER);
        assert_eq!(desc.upload_data_type(), UploadDataType::Index);
        let desc = BufferDesc::linear(64, 2).bind_flags(BindFlags::VERTEX_BUFFER);
        assert_eq!(desc.upload_data_type(), UploadDataType::Vertex);
    }
}
