//! drivemesh router - tenant federation and write routing
//!
//! Two layers live here:
//!
//! - [`registry::TenantRegistry`] owns the tenant and group documents:
//!   CRUD, membership scrubbing on tenant deletion, API-key resolution.
//! - [`router::DriveRouter`] answers namespace questions across tenants:
//!   the federated root listing, capacity- and permission-aware write-target
//!   selection, and the client-side duplicate-name guard.

pub mod registry;
pub mod router;

pub use registry::TenantRegistry;
pub use router::{DriveRouter, FederatedRoot, CAPACITY_EPSILON};
