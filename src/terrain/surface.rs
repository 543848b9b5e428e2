use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use memmap2::MmapMut;

use crate::error::SurfaceError;

/// File header shared by every uber-surface flavour.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct UberHeader {
    pub magic: u32,
    pub width: u32,
    pub height: u32,
    pub reserved: u32,
}

impl UberHeader {
    pub const MAGIC: u32 = 0xA3D3_E3C3;
    pub const BYTES: usize = size_of::<UberHeader>();

    pub fn new(width: u32, height: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            width,
            height,
            reserved: 0,
        }
    }
}

/// Pair of shadowing angles, scaled so `0xffff` is a quarter turn.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShadowSample {
    pub a0: u16,
    pub a1: u16,
}

impl ShadowSample {
    /// Never shadowed.
    pub const OPEN: ShadowSample = ShadowSample {
        a0: 0xffff,
        a1: 0xffff,
    };

    pub fn new(a0: u16, a1: u16) -> Self {
        Self { a0, a1 }
    }
}

/// Row-major grid of samples backed by a memory-mapped file. The bytes on
/// disk are the bytes in memory, so files only move between hosts of the
/// same endianness.
///
/// A surface that failed to open is empty (0x0) rather than an error for
/// callers using [`UberSurface::open_or_empty`]; check [`is_valid`] first.
///
/// [`is_valid`]: UberSurface::is_valid
pub struct UberSurface<T> {
    path: PathBuf,
    map: Option<MmapMut>,
    width: u32,
    height: u32,
    _samples: PhantomData<T>,
}

pub type HeightsSurface = UberSurface<f32>;
pub type ShadowingSurface = UberSurface<ShadowSample>;

impl<T: Pod> UberSurface<T> {
    /// Writes a new surface file filled with `fill` and maps it.
    pub fn create(
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        fill: T,
    ) -> Result<Self, SurfaceError> {
        let path = path.as_ref();
        {
            let mut writer = BufWriter::new(File::create(path)?);
            writer.write_all(bytemuck::bytes_of(&UberHeader::new(width, height)))?;
            let row = vec![fill; width as usize];
            for _ in 0..height {
                writer.write_all(bytemuck::cast_slice(&row))?;
            }
            writer.flush()?;
        }
        log::debug!("created uber-surface {} ({}x{})", path.display(), width, height);
        Self::open(path)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, SurfaceError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: file-backed maps are unsafe because another process may
        // change the file underneath us. Surfaces are owned by one editor.
        #[allow(unsafe_code)]
        let map = unsafe { MmapMut::map_mut(&file)? };

        let Some(header_bytes) = map.get(..UberHeader::BYTES) else {
            return Err(SurfaceError::Truncated {
                width: 0,
                height: 0,
                expected: UberHeader::BYTES,
                actual: map.len(),
            });
        };
        let header: UberHeader = bytemuck::pod_read_unaligned(header_bytes);
        if header.magic != UberHeader::MAGIC {
            return Err(SurfaceError::BadMagic(header.magic));
        }
        let expected = payload_bytes::<T>(header.width, header.height) + UberHeader::BYTES;
        if map.len() < expected {
            return Err(SurfaceError::Truncated {
                width: header.width,
                height: header.height,
                expected,
                actual: map.len(),
            });
        }

        log::debug!(
            "mapped uber-surface {} ({}x{})",
            path.display(),
            header.width,
            header.height
        );
        Ok(Self {
            path: path.to_owned(),
            map: Some(map),
            width: header.width,
            height: header.height,
            _samples: PhantomData,
        })
    }

    /// Opens `path`, falling back to an empty 0x0 surface.
    pub fn open_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self::open(path).unwrap_or_else(|e| {
            log::warn!("uber-surface {} is unusable: {}", path.display(), e);
            Self {
                path: path.to_owned(),
                map: None,
                width: 0,
                height: 0,
                _samples: PhantomData,
            }
        })
    }

    pub fn is_valid(&self) -> bool {
        self.map.is_some() && self.width > 0 && self.height > 0
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples(&self) -> &[T] {
        let len = payload_bytes::<T>(self.width, self.height);
        match &self.map {
            Some(map) => bytemuck::cast_slice(&map[UberHeader::BYTES..UberHeader::BYTES + len]),
            None => &[],
        }
    }

    pub fn samples_mut(&mut self) -> &mut [T] {
        let len = payload_bytes::<T>(self.width, self.height);
        match &mut self.map {
            Some(map) => {
                bytemuck::cast_slice_mut(&mut map[UberHeader::BYTES..UberHeader::BYTES + len])
            }
            None => &mut [],
        }
    }

    pub fn row(&self, y: u32) -> Option<&[T]> {
        let width = self.width as usize;
        let start = y as usize * width;
        self.samples().get(start..start + width)
    }

    pub fn row_mut(&mut self, y: u32) -> Option<&mut [T]> {
        let width = self.width as usize;
        let start = y as usize * width;
        self.samples_mut().get_mut(start..start + width)
    }

    pub fn value(&self, x: u32, y: u32) -> Option<T> {
        if x >= self.width {
            return None;
        }
        self.row(y).map(|row| row[x as usize])
    }

    pub fn set_value(&mut self, x: u32, y: u32, value: T) {
        if x < self.width
            && let Some(row) = self.row_mut(y)
        {
            row[x as usize] = value;
        }
    }

    /// Pushes dirty pages back to the file.
    pub fn flush(&self) -> Result<(), SurfaceError> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }
}

fn payload_bytes<T>(width: u32, height: u32) -> usize {
    width as usize * height as usize * size_of::<T>()
}

impl<T> fmt::Debug for UberSurface<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UberSurface")
            .field("path", &self.path)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}
