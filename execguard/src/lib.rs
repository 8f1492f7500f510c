//! execguard - exec allowlisting for containers
//!
//! Intercepts every execution inside a container's root filesystem with
//! fanotify permission events and allows only executables whose content
//! matches the inventory captured on the first intercepted exec.
//!
//! The binary in main.rs wires this library to a container runtime.

pub mod config;
pub mod container;
pub mod daemon;
pub mod digest;
pub mod inventory;
pub mod metrics;
pub mod monitor;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod workload;

// Re-export commonly used types
pub use config::Config;
pub use container::{Container, ContainerEvent, MountEntry, MountKind};
pub use digest::Digest;
pub use inventory::Inventory;
pub use monitor::{Decision, PermissionMonitor, Reason, Verdict};
pub use policy::MountPolicy;
pub use registry::NotifierRegistry;
