//! Per-frame metadata store shared between pipeline stages.
//!
//! Stages describe the kinds of data they exchange with [`Descriptor`]s,
//! registered once in a [`DescriptorRegistry`]. Each [`FrameObject`] carries
//! one value per kind, counts how often each value is retained, and records
//! which clients still hold the frame. Values are destroyed only once nobody
//! retains them, and a frame goes back to its [`FrameObjectPool`] only once no
//! client holds it.

pub mod config;
pub mod container;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod kinds;
pub mod pool;
pub mod registry;

pub use config::{PoolConfig, SimulationConfig, StoreConfig};
pub use container::{CloneMode, ItemContainer, Lifecycle};
pub use descriptor::{clone_fn_for, CloneFn, Descriptor, DescriptorId, DestroyFn, ItemValue};
pub use error::{ErrorKind, FrameStoreError, Result};
pub use frame::{ClientMask, ClientRole, FrameObject};
pub use kinds::{
    AlgorithmState, ExposureInfo, FaceRegion, FaceRegions, FocusPosition, Histogram, KindTable,
    Rect, ReprocessSettings, WellKnownKind, WhiteBalanceGains,
};
pub use pool::{FrameObjectPool, PoolStats};
pub use registry::DescriptorRegistry;
