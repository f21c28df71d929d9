//! # Netalloc - per-node resource allocation for edge network instances
//!
//! This library assigns small integer identifiers ("app numbers",
//! 0-255) to (network instance, workload) pairs and derives IPv4
//! addresses for workloads from those numbers inside a network
//! instance's DHCP range. Both allocations survive process restarts
//! and host reboots, never collide, and are eventually reclaimed when
//! the owning workload is removed.
//!
//! ## Overview
//!
//! An edge-virtualization host runs a network-instance manager that
//! creates isolated virtual networks for its workloads. That manager
//! embeds this crate for the allocation half of the job: which number
//! a workload gets, which address that number maps to, and how both
//! are kept stable across reboots.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - `bitmap`: fixed 256-slot presence set, one per network instance
//! - `registry`: persisted number records and the durable store contract
//! - `appnum`: number lifecycle - startup reconciliation, allocation
//!   with forced reuse, explicit free and periodic garbage collection
//! - `ipaddr`: number-to-address derivation and MAC/IP bookkeeping
//! - `dhcp`: effective DHCP range sizing with the 255-slot ceiling
//! - `status`: network-instance runtime status and the publish boundary
//! - `config`: YAML instance definitions and allocator settings
//! - `types`: identifier newtypes shared across modules
//! - `error`: recoverable vs. fatal allocation errors
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use netalloc::appnum::NumberAllocator;
//! use netalloc::registry::JsonNumberRegistry;
//! use netalloc::types::{NetworkInstanceId, WorkloadId};
//!
//! // Open the persisted registry and reconcile it against the live
//! // workload attachments (none here) before serving allocations.
//! let registry = JsonNumberRegistry::open("/persist/netalloc/appnums.json")?;
//! let mut allocator = NumberAllocator::new(registry, Utc::now());
//! allocator.init(&[])?;
//!
//! let network = NetworkInstanceId::new_v4();
//! let workload = WorkloadId::new_v4();
//! let number = allocator.allocate(network, workload, 253, false)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Concurrency
//!
//! All operations are synchronous and run to completion; the allocator
//! is owned by the daemon's event loop and passed `&mut`, so no
//! internal locking exists. Two workloads on different network
//! instances never contend.
//!
//! ## Error Handling
//!
//! Recoverable failures (capacity shrink, address outside subnet,
//! releasing an unassigned MAC) are ordinary `Err` values the caller
//! retries or surfaces. Bitmap/registry disagreement is reported as a
//! distinguished corruption error - see [`error::AllocError`] - and
//! must reach the supervisor instead of being retried.

pub mod appnum;
pub mod bitmap;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod ipaddr;
pub mod registry;
pub mod status;
pub mod types;

pub use appnum::NumberAllocator;
pub use bitmap::Bitmap;
pub use error::AllocError;
pub use ipaddr::{is_duplicate_ip, IpAddrManager};
pub use registry::{AddrMap, JsonNumberRegistry, NumberRecord, NumberRegistry, RegistryError};
pub use status::{
    LogPublisher, NetworkInstanceStatus, NetworkInstanceType, StatusPublisher,
    WorkloadNetworkStatus,
};
pub use types::{MacAddr, NetworkInstanceId, NumberType, WorkloadId, APP_NUM_MAX};
