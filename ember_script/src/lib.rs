//! Scripting runtime core for the Ember engine: hook dispatch and
//! deterministic state archival around an embedded Lua 5.1 runtime.
//!
//! The simulation talks to this crate through three surfaces: the
//! `fire_*` dispatch entry points, the `archive`/`unarchive` pair, and
//! the session lifecycle (`ScriptSession::new`, `clear_level`). Mods
//! talk to it through the installed globals (`addHook`, `hud.add`,
//! `registerMetatable`, the handle accessors, and the vector
//! constructors). Callback invocation order and archive emission order
//! are load-bearing: every client in a lockstep session must produce
//! byte-for-byte identical archives from identical inputs.

mod archive;
mod dispatch;
mod events;
mod handles;
mod hooks;
mod session;
mod vectors;
mod world;

pub use archive::ArchiveError;
pub use dispatch::{HookSample, MusicDirective, Verdict, MAX_DISPATCH_ARGS};
pub use events::{ActorEvent, GenericEvent, HudLayer, KeyCasing, StringEvent};
pub use hooks::{resolve_event_name, CallbackId, Discriminator, EventRef, HookError};
pub use session::{RegistrySummary, ScriptSession, SessionOptions};
pub use vectors::{Matrix, Quaternion, Vec2, Vec3};
pub use world::{Actor, ActorHandle, LineDef, Player, Sector, SideDef, Vertex, World};
