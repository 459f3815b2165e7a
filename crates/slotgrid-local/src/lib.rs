//! slotgrid-local: an in-process cluster for running frameworks.
//!
//! Each [`LocalMaster`] owns a fixed pool of slaves and offers their free
//! resources to registered frameworks. A [`LocalCluster`] is the address
//! book that resolves master addresses, so a nested executor can register
//! with a second master inside the same process.
//!
//! # Architecture
//!
//! ```text
//! LocalCluster (MasterConnector)
//!   └── LocalMaster per address
//!         ├── slaves (free resources, offered flag)
//!         ├── frameworks (event channel, placed tasks, refusals)
//!         ├── Rotation (which framework gets the next offer)
//!         └── ExecutorRuntime per (framework, slave)
//! ```

pub mod cluster;
pub mod master;
pub mod rotation;

pub use cluster::LocalCluster;
pub use master::{LocalMaster, REGISTRATION_REFUSED};
pub use rotation::Rotation;
