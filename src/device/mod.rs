//! Device module
//!
//! Device descriptors and the catalog that enumerates them.

pub mod catalog;
pub mod descriptor;

pub use catalog::{DeviceCatalog, DeviceLists, SystemCatalog};
pub use descriptor::{
    with_sentinel, DeviceDescriptor, DeviceId, DeviceKind, Direction, NO_DEVICE_NAME,
    UNKNOWN_DEVICE_NAME,
};
