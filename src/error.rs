use std::io;

use thiserror::Error;

use crate::buffer::ResourceId;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device could not create resource `{name}` ({bytes} bytes)")]
    CreationFailed { name: String, bytes: usize },
    #[error("resource {0:?} is not owned by this device")]
    UnknownResource(ResourceId),
    #[error("range {offset}+{size} is outside resource {resource:?} ({capacity} bytes)")]
    OutOfRange {
        resource: ResourceId,
        offset: usize,
        size: usize,
        capacity: usize,
    },
    #[error("no compute kernel named `{0}`")]
    UnknownKernel(String),
    #[error("kernel `{kernel}` failed: {message}")]
    KernelFailed { kernel: String, message: String },
    #[error("resource {0:?} is bound more than once in a single dispatch")]
    AliasedBinding(ResourceId),
    #[error("copy between incompatible descriptions: {0}")]
    Incompatible(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("transaction {0:#x} is not live")]
    UnknownTransaction(u64),
    #[error("transaction {0:#x} holds no references")]
    Unreferenced(u64),
    #[error("transaction {0:#x} completed without a resource")]
    MissingResource(u64),
    #[error("locator is empty")]
    EmptyLocator,
    #[error("locator range {offset}+{size} exceeds the {capacity} byte resource")]
    LocatorOutOfRange {
        offset: usize,
        size: usize,
        capacity: usize,
    },
    #[error("data packet holds {provided} bytes but the destination needs {required}")]
    PacketTooSmall { provided: usize, required: usize },
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad uber-surface magic {0:#010x}")]
    BadMagic(u32),
    #[error("uber-surface of {width}x{height} needs {expected} bytes, file has {actual}")]
    Truncated {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}
