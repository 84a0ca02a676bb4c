// =============================================================================
// Admin HTTP surface
// =============================================================================

pub mod admin;

pub use admin::{router, AdminState, ReloadTarget};
