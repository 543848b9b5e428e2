//! Asynchronous GPU resource creation and upload, with pooled and batched
//! allocation, plus a GPU working cache for editing large memory-mapped
//! terrain heightfields.

pub mod buffer;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod pool;
pub mod terrain;
pub mod upload;
