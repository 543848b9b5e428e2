use std::ops::Range;

use bytemuck::Pod;
use smallvec::SmallVec;

use crate::buffer::spec::TextureDesc;
use crate::error::UploadError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceId {
    pub mip: u32,
    pub layer: u32,
}

impl SubresourceId {
    pub const FIRST: SubresourceId = SubresourceId { mip: 0, layer: 0 };

    pub fn new(mip: u32, layer: u32) -> Self {
        Self { mip, layer }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TexturePitches {
    pub row_pitch: usize,
    pub slice_pitch: usize,
}

/// Caller-provided upload payload. Shared as `Arc<dyn DataPacket>` and kept
/// alive by the manager until the transaction consuming it has completed.
/// Zero pitches mean tightly packed rows and slices.
pub trait DataPacket: Send + Sync {
    fn data(&self, subresource: SubresourceId) -> Option<&[u8]>;

    fn pitches(&self, subresource: SubresourceId) -> TexturePitches;

    fn data_size(&self, subresource: SubresourceId) -> usize {
        self.data(subresource).map_or(0, <[u8]>::len)
    }
}

struct Subresource {
    id: SubresourceId,
    range: Range<usize>,
    pitches: TexturePitches,
}

/// Owned packet: one contiguous allocation split into subresources.
pub struct BasicPacket {
    bytes: Vec<u8>,
    subresources: SmallVec<[Subresource; 1]>,
}

impl BasicPacket {
    /// Single tightly packed subresource.
    pub fn linear(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        let mut subresources = SmallVec::new();
        subresources.push(Subresource {
            id: SubresourceId::FIRST,
            range: 0..len,
            pitches: TexturePitches::default(),
        });
        Self {
            bytes,
            subresources,
        }
    }

    pub fn from_pod<T: Pod>(values: &[T]) -> Self {
        Self::linear(bytemuck::cast_slice(values).to_vec())
    }

    /// A single 2D subresource with explicit pitches.
    pub fn image(bytes: Vec<u8>, row_pitch: usize) -> Self {
        let mut packet = Self::linear(bytes);
        if let Some(first) = packet.subresources.first_mut() {
            first.pitches.row_pitch = row_pitch;
        }
        packet
    }

    /// Splits `bytes` into every (mip, layer) of `texture`, using the tightly
    /// packed layout of [`TextureDesc::subresource_layout`].
    pub fn texture(texture: &TextureDesc, bytes: Vec<u8>) -> Result<Self, UploadError> {
        let mut subresources = SmallVec::new();
        let mut required = 0;
        for layer in 0..texture.layers() {
            for mip in 0..texture.mip_levels() {
                let Some(layout) = texture.subresource_layout(mip, layer) else {
                    continue;
                };
                let end = layout.offset + layout.slice_pitch * layout.depth as usize;
                required = required.max(end);
                subresources.push(Subresource {
                    id: SubresourceId::new(mip, layer),
                    range: layout.offset..end,
                    pitches: TexturePitches {
                        row_pitch: layout.row_pitch,
                        slice_pitch: layout.slice_pitch,
                    },
                });
            }
        }
        if bytes.len() < required {
            return Err(UploadError::PacketTooSmall {
                provided: bytes.len(),
                required,
            });
        }
        Ok(Self {
            bytes,
            subresources,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Copies the payload into a vector of `T`, tolerating any alignment of
    /// the source bytes.
    pub fn to_pod_vec<T: Pod>(&self) -> Vec<T> {
        let whole = self.bytes.len() / size_of::<T>() * size_of::<T>();
        bytemuck::pod_collect_to_vec(&self.bytes[..whole])
    }

    fn find(&self, subresource: SubresourceId) -> Option<&Subresource> {
        self.subresources.iter().find(|s| s.id == subresource)
    }
}

impl DataPacket for BasicPacket {
    fn data(&self, subresource: SubresourceId) -> Option<&[u8]> {
        self.find(subresource)
            .map(|s| &self.bytes[s.range.clone()])
    }

    fn pitches(&self, subresource: SubresourceId) -> TexturePitches {
        self.find(subresource)
            .map(|s| s.pitches)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::spec::PixelFormat;

    #[test]
    fn texture_packet_splits_mips() {
        let texture = TextureDesc::plain_2d(4, 4, PixelFormat::R8Unorm).mips(2);
        let packet = BasicPacket::texture(&texture, (0u8..20).collect()).unwrap();
        assert_eq!(packet.data(SubresourceId::new(0, 0)).unwrap().len(), 16);
        assert_eq!(packet.data(SubresourceId::new(1, 0)).unwrap(), &[16, 17, 18, 19]);
        assert_eq!(packet.pitches(SubresourceId::new(1, 0)).row_pitch, 2);
        assert!(packet.data(SubresourceId::new(2, 0)).is_none());
    }

    #[test]
    fn short_texture_payload_is_rejected() {
        let texture = TextureDesc::plain_2d(4, 4, PixelFormat::R32Float);
        let result = BasicPacket::texture(&texture, vec![0; 10]);
        assert!(matches!(
            result,
            Err(UploadError::PacketTooSmall {
                provided: 10,
                required: 64
            })
        ));
    }

    #[test]
    fn pod_values_survive_the_byte_payload() {
        let packet = BasicPacket::from_pod(&[1.5f32, -2.0, 8.25]);
        assert_eq!(packet.data_size(SubresourceId::FIRST), 12);
        assert_eq!(packet.to_pod_vec::<f32>(), vec![1.5, -2.0, 8.25]);
    }
}
