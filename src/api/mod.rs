// =============================================================================
// Control-plane HTTP/WebSocket surface (spec §6)
// =============================================================================
//
// Full request routing, validation and auth middleware internals live
// outside this crate; the three submodules here are the thin seam that
// translates §6's endpoints onto `EngineManager`/`OrderManager`/
// `ResearchEngine` calls so the crate is runnable end to end.
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;
