//! hubmesh protocol layer.
//!
//! Implements node-graph routing, the merged device registry and
//! correlated device calls on top of `hubmesh-transport`.
//!
//! Wire format: MessagePack (named fields).
//! Values: `serde_json::Value` for arguments, results and event payloads.

pub mod catalog;
pub mod collection;
pub mod device;
pub mod envelope;
pub mod error;
pub mod extension;
pub mod facade;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod runtime;
pub mod store;
pub mod types;

pub use catalog::{CapabilityDef, Catalog, Conversion, DeviceDescription, DeviceTypeDef, ValueType};
pub use collection::{Collection, Filter, MultiResult};
pub use device::{
    ActionSpec, ArgumentSpec, Device, DeviceDefinition, DeviceDescriptor, Progress, TypeSpec,
};
pub use envelope::{Envelope, Frame, Message, RouteAdvert};
pub use error::{CallError, MeshError};
pub use extension::Extension;
pub use facade::{Action, CallOptions, DeviceHandle, DeviceProxy, PowerExt};
pub use registry::{DeviceInfo, MergedDevice, Registration, Registry, RegistryEvent};
pub use router::{NodeSnapshot, Router, RoutingAction};
pub use rpc::{CallCorrelator, CallHandle};
pub use runtime::{
    MeshEvent, MeshRuntime, RuntimeChannels, RuntimeConfig, RuntimeHandle, Transport,
};
pub use store::{MemoryStore, MetadataStore, SqliteStore};
pub use types::{NodeId, PeerId};
