//! Per-call machinery: the session registry, the control loop that owns all
//! call state, and the media relay on the telephony websocket.

pub mod registry;
pub mod relay;
pub mod session;
