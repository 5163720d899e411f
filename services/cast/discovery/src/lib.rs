//! Device discovery filtering for the cast protocol.
//!
//! Consumes already-parsed device records from a discovery source
//! (mDNS/SSDP resolution is out of scope) and decides, by probing each
//! candidate with a throwaway session, whether it satisfies the
//! caller's [`DiscoveryCriteria`]. Accepted devices are published as
//! [`FilterEvent`]s; the caller then opens a real
//! [`cast_session::DeviceSession`] against the device it picks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod criteria;
pub mod device;
pub mod filter;

// Re-export main types
pub use criteria::{CriteriaError, DiscoveryCriteria};
pub use device::{CastDevice, DiscoverySource};
pub use filter::{DeviceFilter, FilterConfig, FilterEvent};
