//! Cluster Agent CRD Definitions
//!
//! Custom resources describing desired access: workspaces group namespaces
//! and Helm releases, users carry RBAC subjects, grants tie a user and a role
//! to a workspace. All are cluster-scoped.

pub mod grant;
pub mod user;
pub mod workspace;

pub use grant::*;
pub use user::*;
pub use workspace::*;
