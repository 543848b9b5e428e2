use std::any::Any;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytemuck::Pod;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::{
    BackendResource, BasicPacket, Box2D, BufferDesc, BufferKind, DataPacket, PartialResource,
    SubresourceId, TextureDesc, UnderlyingResource,
};
use crate::device::{ComputeDispatch, Device};
use crate::error::DeviceError;

/// Word-aligned CPU memory standing in for device memory.
struct HostStorage {
    device: u64,
    byte_len: usize,
    words: RwLock<Vec<u32>>,
}

impl BackendResource for HostStorage {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type HostKernel = Arc<dyn Fn(&mut HostKernelArgs<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Writable binding handed to a host kernel.
pub struct HostBinding<'a> {
    pub desc: &'a BufferDesc,
    pub words: &'a mut [u32],
}

impl HostBinding<'_> {
    pub fn extent(&self) -> (u32, u32) {
        texture_extent(self.desc)
    }

    pub fn as_f32(&self) -> &[f32] {
        bytemuck::cast_slice(self.words)
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(self.words)
    }
}

/// Read-only binding handed to a host kernel.
pub struct HostView<'a> {
    pub desc: &'a BufferDesc,
    pub words: &'a [u32],
}

impl HostView<'_> {
    pub fn extent(&self) -> (u32, u32) {
        texture_extent(self.desc)
    }

    pub fn as_f32(&self) -> &[f32] {
        bytemuck::cast_slice(self.words)
    }
}

fn texture_extent(desc: &BufferDesc) -> (u32, u32) {
    match &desc.kind {
        BufferKind::Texture(texture) => (texture.width, texture.height),
        BufferKind::Linear(linear) => (linear.size_in_bytes / 4, 1),
    }
}

pub struct HostKernelArgs<'a> {
    pub group_count: [u32; 3],
    pub constants: &'a [&'a [u8]],
    pub uavs: Vec<HostBinding<'a>>,
    pub srvs: Vec<HostView<'a>>,
}

impl HostKernelArgs<'_> {
    /// Reads the parameter block in `slot` as `T`.
    pub fn constants<T: Pod>(&self, slot: usize) -> anyhow::Result<T> {
        let bytes = self
            .constants
            .get(slot)
            .ok_or_else(|| anyhow::anyhow!("no constant buffer bound at slot {slot}"))?;
        anyhow::ensure!(
            bytes.len() >= size_of::<T>(),
            "constant buffer {slot} holds {} bytes, expected {}",
            bytes.len(),
            size_of::<T>()
        );
        Ok(bytemuck::pod_read_unaligned(&bytes[..size_of::<T>()]))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostDeviceStats {
    pub creations: u64,
    pub updates: u64,
    pub bytes_uploaded: u64,
    pub copies: u64,
    pub read_backs: u64,
    pub clears: u64,
    pub dispatches: u64,
}

#[derive(Default)]
struct Counters {
    creations: AtomicU64,
    updates: AtomicU64,
    bytes_uploaded: AtomicU64,
    copies: AtomicU64,
    read_backs: AtomicU64,
    clears: AtomicU64,
    dispatches: AtomicU64,
}

/// Reference backend keeping every resource in host memory. Compute kernels
/// are registered by name as closures.
pub struct HostDevice {
    id: u64,
    kernels: RwLock<HashMap<String, HostKernel>>,
    fail_creations: AtomicBool,
    counters: Counters,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            kernels: RwLock::new(HashMap::new()),
            fail_creations: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn register_kernel(
        &self,
        name: impl Into<String>,
        kernel: impl Fn(&mut HostKernelArgs<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let name = name.into();
        log::debug!("host device {}: registered kernel `{}`", self.id, name);
        self.kernels.write().insert(name, Arc::new(kernel));
    }

    /// While set, every `create_resource` fails.
    pub fn set_fail_creations(&self, fail: bool) {
        self.fail_creations.store(fail, Ordering::Relaxed);
    }

    pub fn stats(&self) -> HostDeviceStats {
        let c = &self.counters;
        HostDeviceStats {
            creations: c.creations.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            bytes_uploaded: c.bytes_uploaded.load(Ordering::Relaxed),
            copies: c.copies.load(Ordering::Relaxed),
            read_backs: c.read_backs.load(Ordering::Relaxed),
            clears: c.clears.load(Ordering::Relaxed),
            dispatches: c.dispatches.load(Ordering::Relaxed),
        }
    }

    fn storage<'r>(&self, resource: &'r UnderlyingResource) -> Result<&'r HostStorage, DeviceError> {
        resource
            .backend::<HostStorage>()
            .filter(|storage| storage.device == self.id)
            .ok_or(DeviceError::UnknownResource(resource.id()))
    }

    fn check_range(
        resource: &UnderlyingResource,
        storage: &HostStorage,
        range: &Range<usize>,
    ) -> Result<(), DeviceError> {
        if range.start > range.end || range.end > storage.byte_len {
            return Err(DeviceError::OutOfRange {
                resource: resource.id(),
                offset: range.start,
                size: range.end.saturating_sub(range.start),
                capacity: storage.byte_len,
            });
        }
        Ok(())
    }
}

fn bytes_of(words: &[u32], len: usize) -> &[u8] {
    &bytemuck::cast_slice::<u32, u8>(words)[..len]
}

fn bytes_of_mut(words: &mut [u32], len: usize) -> &mut [u8] {
    &mut bytemuck::cast_slice_mut::<u32, u8>(words)[..len]
}

/// Writes the selected subresources of `packet` into a packed texture.
/// Zero pitches in the packet mean tightly packed rows.
fn write_texture(
    bytes: &mut [u8],
    texture: &TextureDesc,
    packet: &dyn DataPacket,
    partial: &PartialResource,
) -> usize {
    let (block_w, block_h, block_bytes) = texture.format.block();
    let mut written = 0;
    for layer in (0..texture.layers()).filter(|l| partial.includes_layer(*l)) {
        for mip in (0..texture.mip_levels()).filter(|m| partial.includes_lod(*m)) {
            let (Some(layout), Some(src)) = (
                texture.subresource_layout(mip, layer),
                packet.data(SubresourceId::new(mip, layer)),
            ) else {
                continue;
            };
            let area = partial.area.resolve(layout.width, layout.height);
            let first_col = area.left as usize / block_w as usize;
            let first_row = area.top as usize / block_h as usize;
            let row_bytes = area.width().div_ceil(block_w) as usize * block_bytes as usize;
            let rows = area.height().div_ceil(block_h) as usize;

            let pitches = packet.pitches(SubresourceId::new(mip, layer));
            let src_row_pitch = if pitches.row_pitch == 0 {
                row_bytes
            } else {
                pitches.row_pitch
            };
            let src_slice_pitch = if pitches.slice_pitch == 0 {
                src_row_pitch * rows
            } else {
                pitches.slice_pitch
            };

            for z in 0..layout.depth as usize {
                for row in 0..rows {
                    let src_start = z * src_slice_pitch + row * src_row_pitch;
                    let Some(src_row) = src.get(src_start..src_start + row_bytes) else {
                        break;
                    };
                    let dst_start = layout.offset
                        + z * layout.slice_pitch
                        + (first_row + row) * layout.row_pitch
                        + first_col * block_bytes as usize;
                    bytes[dst_start..dst_start + row_bytes].copy_from_slice(src_row);
                    written += row_bytes;
                }
            }
        }
    }
    written
}

impl Device for HostDevice {
    fn create_resource(
        &self,
        desc: &BufferDesc,
        init: Option<&dyn DataPacket>,
    ) -> Result<Arc<UnderlyingResource>, DeviceError> {
        let byte_len = desc.byte_count();
        if self.fail_creations.load(Ordering::Relaxed) {
            return Err(DeviceError::CreationFailed {
                name: desc.name.as_str().to_owned(),
                bytes: byte_len,
            });
        }

        let storage = HostStorage {
            device: self.id,
            byte_len,
            words: RwLock::new(vec![0; byte_len.div_ceil(4)]),
        };
        let resource = Arc::new(UnderlyingResource::new(*desc, Box::new(storage)));
        self.counters.creations.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "host device {}: created {:?} `{}` ({} bytes)",
            self.id,
            resource.id(),
            desc.name.as_str(),
            byte_len
        );

        if let Some(init) = init {
            self.update_resource(&resource, 0..byte_len, init, &PartialResource::whole())?;
        }
        Ok(resource)
    }

    fn update_resource(
        &self,
        dst: &UnderlyingResource,
        window: Range<usize>,
        packet: &dyn DataPacket,
        partial: &PartialResource,
    ) -> Result<usize, DeviceError> {
        let storage = self.storage(dst)?;
        let mut words = storage.words.write();
        let bytes = bytes_of_mut(&mut words, storage.byte_len);

        let written = match &dst.desc().kind {
            BufferKind::Linear(_) => {
                let Some(data) = packet.data(SubresourceId::FIRST) else {
                    return Ok(0);
                };
                Self::check_range(dst, storage, &window)?;
                let range = if partial.area.is_whole() {
                    window.clone()
                } else {
                    window.start + partial.area.left.max(0) as usize
                        ..window.start + partial.area.right.max(0) as usize
                };
                if range.start > range.end || range.end > window.end {
                    return Err(DeviceError::OutOfRange {
                        resource: dst.id(),
                        offset: range.start,
                        size: range.end.saturating_sub(range.start),
                        capacity: window.end,
                    });
                }
                let end = range.start + data.len().min(range.len());
                bytes[range.start..end].copy_from_slice(&data[..end - range.start]);
                end - range.start
            }
            BufferKind::Texture(texture) => write_texture(bytes, texture, packet, partial),
        };

        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_uploaded
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    fn copy_resource(
        &self,
        dst: &UnderlyingResource,
        src: &UnderlyingResource,
    ) -> Result<(), DeviceError> {
        let src_storage = self.storage(src)?;
        let dst_storage = self.storage(dst)?;
        if src.id() == dst.id() {
            return Ok(());
        }
        if src_storage.byte_len != dst_storage.byte_len {
            return Err(DeviceError::Incompatible(format!(
                "{} byte source into {} byte destination",
                src_storage.byte_len, dst_storage.byte_len
            )));
        }
        let staged = src_storage.words.read().clone();
        dst_storage.words.write().copy_from_slice(&staged);
        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn copy_region(
        &self,
        dst: &UnderlyingResource,
        dst_offset: usize,
        src: &UnderlyingResource,
        src_offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let src_storage = self.storage(src)?;
        let dst_storage = self.storage(dst)?;
        let src_range = src_offset..src_offset + size;
        let dst_range = dst_offset..dst_offset + size;
        Self::check_range(src, src_storage, &src_range)?;
        Self::check_range(dst, dst_storage, &dst_range)?;

        let staged = bytes_of(&src_storage.words.read(), src_storage.byte_len)[src_range].to_vec();
        let mut words = dst_storage.words.write();
        bytes_of_mut(&mut words, dst_storage.byte_len)[dst_range].copy_from_slice(&staged);
        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn copy_texture_region(
        &self,
        dst: &UnderlyingResource,
        dst_origin: (u32, u32),
        src: &UnderlyingResource,
        src_area: Box2D,
    ) -> Result<(), DeviceError> {
        let src_storage = self.storage(src)?;
        let dst_storage = self.storage(dst)?;
        let (Some(src_tex), Some(dst_tex)) = (src.desc().as_texture(), dst.desc().as_texture())
        else {
            return Err(DeviceError::Incompatible(
                "texture region copy between non-textures".to_owned(),
            ));
        };
        if src_tex.format != dst_tex.format {
            return Err(DeviceError::Incompatible(format!(
                "{:?} into {:?}",
                src_tex.format, dst_tex.format
            )));
        }
        let (Some(src_layout), Some(dst_layout)) = (
            src_tex.subresource_layout(0, 0),
            dst_tex.subresource_layout(0, 0),
        ) else {
            return Ok(());
        };

        let (block_w, block_h, block_bytes) = src_tex.format.block();
        let area = src_area.resolve(src_layout.width, src_layout.height);
        let width = area.width().min(dst_layout.width.saturating_sub(dst_origin.0));
        let height = area.height().min(dst_layout.height.saturating_sub(dst_origin.1));
        let row_bytes = width.div_ceil(block_w) as usize * block_bytes as usize;
        let rows = height.div_ceil(block_h) as usize;
        let block_bytes = block_bytes as usize;

        let mut staged = Vec::with_capacity(row_bytes * rows);
        {
            let words = src_storage.words.read();
            let bytes = bytes_of(&words, src_storage.byte_len);
            for row in 0..rows {
                let start = (area.top as usize / block_h as usize + row) * src_layout.row_pitch
                    + area.left as usize / block_w as usize * block_bytes;
                staged.extend_from_slice(&bytes[start..start + row_bytes]);
            }
        }

        let mut words = dst_storage.words.write();
        let bytes = bytes_of_mut(&mut words, dst_storage.byte_len);
        for (row, chunk) in staged.chunks_exact(row_bytes.max(1)).enumerate().take(rows) {
            let start = (dst_origin.1 as usize / block_h as usize + row) * dst_layout.row_pitch
                + dst_origin.0 as usize / block_w as usize * block_bytes;
            bytes[start..start + row_bytes].copy_from_slice(chunk);
        }
        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_back(
        &self,
        src: &UnderlyingResource,
        range: Option<Range<usize>>,
    ) -> Result<BasicPacket, DeviceError> {
        let storage = self.storage(src)?;
        let range = range.unwrap_or(0..storage.byte_len);
        Self::check_range(src, storage, &range)?;
        let bytes = bytes_of(&storage.words.read(), storage.byte_len)[range].to_vec();
        self.counters.read_backs.fetch_add(1, Ordering::Relaxed);

        let row_pitch = src
            .desc()
            .as_texture()
            .and_then(|texture| texture.subresource_layout(0, 0))
            .map(|layout| layout.row_pitch);
        Ok(match row_pitch {
            Some(row_pitch) => BasicPacket::image(bytes, row_pitch),
            None => BasicPacket::linear(bytes),
        })
    }

    fn clear(&self, dst: &UnderlyingResource, value: u32) -> Result<(), DeviceError> {
        let storage = self.storage(dst)?;
        storage.words.write().fill(value);
        self.counters.clears.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dispatch(&self, dispatch: &ComputeDispatch<'_>) -> Result<(), DeviceError> {
        let kernel = self
            .kernels
            .read()
            .get(dispatch.kernel)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownKernel(dispatch.kernel.to_owned()))?;

        let mut bound: Vec<_> = dispatch
            .uavs
            .iter()
            .chain(dispatch.srvs)
            .map(|resource| resource.id())
            .collect();
        bound.sort();
        if let Some(pair) = bound.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(DeviceError::AliasedBinding(pair[0]));
        }

        let uav_storage = dispatch
            .uavs
            .iter()
            .map(|resource| self.storage(resource))
            .collect::<Result<Vec<_>, _>>()?;
        let srv_storage = dispatch
            .srvs
            .iter()
            .map(|resource| self.storage(resource))
            .collect::<Result<Vec<_>, _>>()?;

        let mut uav_guards: Vec<RwLockWriteGuard<'_, Vec<u32>>> =
            uav_storage.iter().map(|s| s.words.write()).collect();
        let srv_guards: Vec<RwLockReadGuard<'_, Vec<u32>>> =
            srv_storage.iter().map(|s| s.words.read()).collect();

        let mut args = HostKernelArgs {
            group_count: dispatch.group_count,
            constants: dispatch.constants,
            uavs: uav_guards
                .iter_mut()
                .zip(dispatch.uavs)
                .map(|(words, resource)| HostBinding {
                    desc: resource.desc(),
                    words: &mut words[..],
                })
                .collect(),
            srvs: srv_guards
                .iter()
                .zip(dispatch.srvs)
                .map(|(words, resource)| HostView {
                    desc: resource.desc(),
                    words: &words[..],
                })
                .collect(),
        };

        log::trace!(
            "host device {}: dispatch `{}` {:?}",
            self.id,
            dispatch.kernel,
            dispatch.group_count
        );
        kernel(&mut args).map_err(|e| DeviceError::KernelFailed {
            kernel: dispatch.kernel.to_owned(),
            message: format!("{e:#}"),
        })?;
        self.counters.dispatches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BindFlags, PixelFormat};

    fn r32_texture(device: &HostDevice, width: u32, height: u32) -> Arc<UnderlyingResource> {
        let desc = BufferDesc::texture(TextureDesc::plain_2d(width, height, PixelFormat::R32Float))
            .bind_flags(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS);
        device.create_resource(&desc, None).unwrap()
    }

    #[test]
    fn linear_init_data_reads_back() {
        let device = HostDevice::new();
        let packet = BasicPacket::linear((0u8..32).collect());
        let buffer = device
            .create_resource(&BufferDesc::linear(32, 0), Some(&packet))
            .unwrap();
        let back = device.read_back(&buffer, Some(4..8)).unwrap();
        assert_eq!(back.as_bytes(), &[4, 5, 6, 7]);
        assert_eq!(device.stats().bytes_uploaded, 32);
    }

    #[test]
    fn linear_writes_stay_inside_their_window() {
        let device = HostDevice::new();
        let buffer = device.create_resource(&BufferDesc::linear(64, 0), None).unwrap();
        let written = device
            .update_resource(
                &buffer,
                16..32,
                &BasicPacket::linear(vec![9; 64]),
                &PartialResource::whole(),
            )
            .unwrap();
        assert_eq!(written, 16);
        let bytes = device.read_back(&buffer, None).unwrap();
        assert_eq!(&bytes.as_bytes()[..16], &[0; 16]);
        assert_eq!(&bytes.as_bytes()[16..32], &[9; 16]);
        assert_eq!(&bytes.as_bytes()[32..], &[0; 32]);

        let outside = device.update_resource(
            &buffer,
            16..32,
            &BasicPacket::linear(vec![1; 8]),
            &PartialResource::area(Box2D::new(12, 0, 20, 1)),
        );
        assert!(matches!(outside, Err(DeviceError::OutOfRange { .. })));
    }

    #[test]
    fn partial_texture_update_writes_only_the_box() {
        let device = HostDevice::new();
        let texture = r32_texture(&device, 4, 4);
        let packet = BasicPacket::from_pod(&[1.0f32, 2.0, 3.0, 4.0]);
        let partial = PartialResource::area(Box2D::new(1, 1, 3, 3));
        let written = device
            .update_resource(&texture, 0..texture.byte_count(), &packet, &partial)
            .unwrap();
        assert_eq!(written, 16);

        let values = device.read_back(&texture, None).unwrap().to_pod_vec::<f32>();
        assert_eq!(values[5], 1.0);
        assert_eq!(values[6], 2.0);
        assert_eq!(values[9], 3.0);
        assert_eq!(values[10], 4.0);
        assert_eq!(values.iter().filter(|v| **v != 0.0).count(), 4);
    }

    #[test]
    fn texture_region_copy_moves_rows() {
        let device = HostDevice::new();
        let src = r32_texture(&device, 4, 4);
        let dst = r32_texture(&device, 2, 2);
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        device
            .update_resource(
                &src,
                0..src.byte_count(),
                &BasicPacket::from_pod(&values),
                &PartialResource::whole(),
            )
            .unwrap();
        device
            .copy_texture_region(&dst, (0, 0), &src, Box2D::new(2, 1, 4, 3))
            .unwrap();
        let copied = device.read_back(&dst, None).unwrap().to_pod_vec::<f32>();
        assert_eq!(copied, vec![6.0, 7.0, 10.0, 11.0]);
    }

    #[test]
    fn failed_creation_is_reported() {
        let device = HostDevice::new();
        device.set_fail_creations(true);
        let result = device.create_resource(&BufferDesc::linear(16, 0).name("doomed"), None);
        assert!(matches!(result, Err(DeviceError::CreationFailed { bytes: 16, .. })));
    }

    #[test]
    fn dispatch_rejects_aliased_bindings_and_unknown_kernels() {
        let device = HostDevice::new();
        device.register_kernel("Noop", |_| Ok(()));
        let texture = r32_texture(&device, 2, 2);

        let aliased = ComputeDispatch {
            kernel: "Noop",
            group_count: [1, 1, 1],
            constants: &[],
            uavs: &[&texture],
            srvs: &[&texture],
        };
        assert!(matches!(
            device.dispatch(&aliased),
            Err(DeviceError::AliasedBinding(_))
        ));

        let unknown = ComputeDispatch {
            kernel: "Missing",
            group_count: [1, 1, 1],
            constants: &[],
            uavs: &[],
            srvs: &[],
        };
        assert!(matches!(
            device.dispatch(&unknown),
            Err(DeviceError::UnknownKernel(_))
        ));
    }

    #[test]
    fn kernels_see_constants_and_bindings() {
        let device = HostDevice::new();
        device.register_kernel("Fill", |args| {
            let value: f32 = args.constants(0)?;
            args.uavs[0].as_f32_mut().fill(value);
            Ok(())
        });
        let texture = r32_texture(&device, 2, 2);
        let value = 3.5f32;
        device
            .dispatch(&ComputeDispatch {
                kernel: "Fill",
                group_count: [1, 1, 1],
                constants: &[bytemuck::bytes_of(&value)],
                uavs: &[&texture],
                srvs: &[],
            })
            .unwrap();
        let values = device.read_back(&texture, None).unwrap().to_pod_vec::<f32>();
        assert_eq!(values, vec![3.5; 4]);
    }

    #[test]
    fn resources_from_another_device_are_rejected() {
        let a = HostDevice::new();
        let b = HostDevice::new();
        let buffer = a.create_resource(&BufferDesc::linear(8, 0), None).unwrap();
        assert!(matches!(
            b.clear(&buffer, 0),
            Err(DeviceError::UnknownResource(_))
        ));
    }
}
