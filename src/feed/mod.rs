// =============================================================================
// Upstream tick feed — WebSocket ingress, login client
// =============================================================================
//
// The live path authenticates against the upstream broker (TOTP + signed
// login) and attaches the tick WebSocket; staging mode points the same
// ingress at a simulator URL with no session gating.

pub mod login;
pub mod ws;

pub use login::{LoginClient, SessionTokens};
pub use ws::{run_feed_connection, run_feed_loop, TickObserver};
