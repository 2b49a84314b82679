//! Test fixtures

mod stun_server;

pub use stun_server::{Mapping, ScriptedStunServer, ServerBehavior};
