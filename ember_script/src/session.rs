//! Process-scoped scripting session.
//!
//! One `ScriptSession` owns the embedded Lua runtime, the hook
//! registry, the metatable-identity registry, and the world model the
//! simulation shares with it. Hooks live for the session lifetime and
//! are rebuilt from scratch by constructing a new session (runtime
//! restart); level-scoped state is dropped through `clear_level`.
//! Everything runs on the simulation-tick thread; nothing here is
//! `Send`, by design.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use anyhow::{Context, Result};
use mlua::{
    Error as LuaError, FromLuaMulti, Function, Lua, LuaOptions, RegistryKey, Result as LuaResult,
    StdLib, Table, Value,
};
use serde::Serialize;

use crate::dispatch::HookSample;
use crate::events::{ActorEvent, GenericEvent, HudLayer, StringEvent};
use crate::handles::{
    self, push_line_value, push_player_value, push_sector_value, push_side_value,
    push_vertex_value, ACTOR_VARS_REGISTRY, HANDLE_CACHE_REGISTRY, PLAYER_VARS_REGISTRY,
};
use crate::hooks::{resolve_event_name, CallbackId, Discriminator, EventRef, HookError,
    HookRegistry};
use crate::vectors;
use crate::world::{ActorHandle, World};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub verbose: bool,
    /// Fixed player slot count; slot 0 is the always-present first
    /// participant in the archive stream.
    pub player_slots: usize,
    /// Exclusive upper bound for actor kinds accepted as hook
    /// discriminators.
    pub actor_kinds: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            verbose: false,
            player_slots: 16,
            actor_kinds: 256,
        }
    }
}

/// Callback counts per event, for diagnostics dumps.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub callbacks: usize,
    pub generic: std::collections::BTreeMap<String, usize>,
    pub actor: std::collections::BTreeMap<String, usize>,
    pub string: std::collections::BTreeMap<String, usize>,
    pub hud: std::collections::BTreeMap<String, usize>,
}

pub struct ScriptSession {
    lua: Lua,
    pub(crate) hooks: Rc<RefCell<HookRegistry>>,
    pub(crate) world: Rc<RefCell<World>>,
    pub(crate) metatables: Rc<RefCell<Vec<RegistryKey>>>,
    pub(crate) hud_running: Rc<Cell<bool>>,
    pub(crate) warned: RefCell<BTreeSet<CallbackId>>,
    pub(crate) verbose: bool,
    pub(crate) profiling: Cell<bool>,
    pub(crate) samples: RefCell<Vec<HookSample>>,
}

impl ScriptSession {
    pub fn new(options: SessionOptions) -> Result<Self> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())
            .context("initialising Lua runtime with standard libraries")?;
        lua.set_named_registry_value(HANDLE_CACHE_REGISTRY, lua.create_table()?)?;
        lua.set_named_registry_value(ACTOR_VARS_REGISTRY, lua.create_table()?)?;
        lua.set_named_registry_value(PLAYER_VARS_REGISTRY, lua.create_table()?)?;

        let hooks = Rc::new(RefCell::new(HookRegistry::new(options.actor_kinds)));
        let world = Rc::new(RefCell::new(World::new(options.player_slots)));
        let metatables = Rc::new(RefCell::new(Vec::new()));
        let hud_running = Rc::new(Cell::new(false));

        install_script_api(&lua, &hooks, &world, &metatables, &hud_running)
            .context("installing the script-facing API")?;
        vectors::install_constructors(&lua).context("installing vector constructors")?;

        Ok(ScriptSession {
            lua,
            hooks,
            world,
            metatables,
            hud_running,
            warned: RefCell::new(BTreeSet::new()),
            verbose: options.verbose,
            profiling: Cell::new(false),
            samples: RefCell::new(Vec::new()),
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn world(&self) -> Rc<RefCell<World>> {
        Rc::clone(&self.world)
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Runs a script chunk. Load-time and run-time errors are hard
    /// errors here; containment only applies to hook callbacks.
    pub fn load(&self, source: &str, name: &str) -> Result<()> {
        self.lua
            .load(source)
            .set_name(name)
            .exec()
            .with_context(|| format!("running script chunk {name}"))
    }

    /// Evaluates an expression and converts the result.
    pub fn eval<T>(&self, code: &str) -> Result<T>
    where
        T: for<'l> FromLuaMulti<'l>,
    {
        self.lua
            .load(code)
            .eval()
            .with_context(|| format!("evaluating {code:?}"))
    }

    /// Spawns an actor and fires the ActorSpawn hook for it.
    pub fn spawn_actor(&self, kind: u16) -> ActorHandle {
        let handle = self.world.borrow_mut().spawn(kind);
        self.fire_actor_hook(ActorEvent::Spawn, handle);
        handle
    }

    /// Despawns an actor: fires ActorRemoved while the actor is still
    /// reachable, then bumps the arena generation and drops the cached
    /// userdata and field table. Must be called exactly once per
    /// spawned actor.
    pub fn despawn_actor(&self, handle: ActorHandle) -> bool {
        let Some((index, stable_id)) = ({
            let world = self.world.borrow();
            world
                .actor(handle)
                .map(|actor| (handle.index, actor.stable_id))
        }) else {
            return false;
        };
        self.fire_actor_hook(ActorEvent::Removed, handle);
        self.world.borrow_mut().despawn(handle);
        if let Err(err) = handles::invalidate_actor(&self.lua, index, stable_id) {
            eprintln!("[ember_script] warning: failed to invalidate actor #{stable_id}: {err}");
        }
        true
    }

    pub fn join_player(&self, slot: usize, skin: &str) -> bool {
        if !self.world.borrow_mut().join_player(slot, skin) {
            return false;
        }
        self.fire_player_join(slot as u8);
        true
    }

    pub fn leave_player(&self, slot: usize) -> bool {
        if !self.world.borrow_mut().leave_player(slot) {
            return false;
        }
        if let Err(err) = handles::invalidate_player(&self.lua, slot as u8) {
            eprintln!("[ember_script] warning: failed to invalidate player {slot}: {err}");
        }
        true
    }

    /// Tears down level-scoped state: actors, geometry, their cached
    /// handles and field tables. Hooks and player state survive.
    pub fn clear_level(&self) -> Result<()> {
        self.world.borrow_mut().clear_level();
        self.lua
            .set_named_registry_value(ACTOR_VARS_REGISTRY, self.lua.create_table()?)?;
        let cache: Table = self.lua.named_registry_value(HANDLE_CACHE_REGISTRY)?;
        let mut dropped = Vec::new();
        for entry in cache.clone().pairs::<String, Value>() {
            let (key, _) = entry?;
            if !key.starts_with('p') {
                dropped.push(key);
            }
        }
        for key in dropped {
            cache.raw_set(key, Value::Nil)?;
        }
        Ok(())
    }

    /// Replaces both ad-hoc field tables with fresh ones; the archive
    /// reader calls this so restored state never mixes with stale
    /// fields.
    pub(crate) fn reset_script_tables(&self) -> LuaResult<()> {
        self.lua
            .set_named_registry_value(ACTOR_VARS_REGISTRY, self.lua.create_table()?)?;
        self.lua
            .set_named_registry_value(PLAYER_VARS_REGISTRY, self.lua.create_table()?)?;
        Ok(())
    }

    pub fn registry_summary(&self) -> RegistrySummary {
        let hooks = self.hooks.borrow();
        let mut generic = std::collections::BTreeMap::new();
        for event in GenericEvent::ALL {
            let count = hooks.generic_count(*event);
            if count > 0 {
                generic.insert(event.name().to_string(), count);
            }
        }
        let mut actor = std::collections::BTreeMap::new();
        for event in ActorEvent::ALL {
            let count = hooks.actor_count(*event);
            if count > 0 {
                actor.insert(event.name().to_string(), count);
            }
        }
        let mut string = std::collections::BTreeMap::new();
        for event in StringEvent::ALL {
            let count = hooks.string_count(*event);
            if count > 0 {
                string.insert(event.name().to_string(), count);
            }
        }
        let mut hud = std::collections::BTreeMap::new();
        for layer in HudLayer::ALL {
            let count = hooks.hud_count(*layer);
            if count > 0 {
                hud.insert(layer.name().to_string(), count);
            }
        }
        RegistrySummary {
            callbacks: hooks.callback_count(),
            generic,
            actor,
            string,
            hud,
        }
    }

    /// Prints the registry summary to stdout, one line per event.
    pub fn dump_summary(&self) {
        let summary = self.registry_summary();
        println!("hooks registered: {}", summary.callbacks);
        for (name, count) in &summary.generic {
            println!("  {name}: {count}");
        }
        for (name, count) in &summary.actor {
            println!("  {name}: {count}");
        }
        for (name, count) in &summary.string {
            println!("  {name}: {count}");
        }
        for (name, count) in &summary.hud {
            println!("  hud.{name}: {count}");
        }
    }
}

fn parse_discriminator(
    event: EventRef,
    value: Option<Value>,
    kind_limit: u16,
) -> LuaResult<Discriminator> {
    let value = match value {
        None | Some(Value::Nil) => return Ok(Discriminator::None),
        Some(value) => value,
    };
    match event {
        // Extra registration arguments on generic hooks are discarded.
        EventRef::Generic(_) => Ok(Discriminator::None),
        EventRef::Actor(event) => {
            let kind = match &value {
                Value::Integer(kind) => Some(*kind),
                Value::Number(kind) if kind.fract() == 0.0 => Some(*kind as i64),
                _ => None,
            };
            let Some(kind) = kind else {
                return Err(LuaError::external(HookError::KindExpected {
                    event: event.name(),
                }));
            };
            u16::try_from(kind)
                .ok()
                .filter(|kind| *kind < kind_limit)
                .map(Discriminator::ActorKind)
                .ok_or_else(|| {
                    LuaError::external(HookError::KindOutOfRange {
                        event: event.name(),
                        kind,
                        limit: kind_limit,
                    })
                })
        }
        EventRef::String(event) => match &value {
            Value::String(key) => Ok(Discriminator::Key(event.canonical_key(key.to_str()?))),
            _ => Err(LuaError::external(HookError::KeyExpected {
                event: event.name(),
            })),
        },
    }
}

fn install_script_api(
    lua: &Lua,
    hooks: &Rc<RefCell<HookRegistry>>,
    world: &Rc<RefCell<World>>,
    metatables: &Rc<RefCell<Vec<RegistryKey>>>,
    hud_running: &Rc<Cell<bool>>,
) -> LuaResult<()> {
    let globals = lua.globals();

    let add_hooks = Rc::clone(hooks);
    let add_guard = Rc::clone(hud_running);
    let add_hook = lua.create_function(
        move |lua, (name, callback, discriminator): (String, Function, Option<Value>)| {
            if add_guard.get() {
                return Err(LuaError::external(HookError::HudRunning));
            }
            let event = resolve_event_name(&name)
                .ok_or_else(|| LuaError::external(HookError::UnknownHook(name.clone())))?;
            let kind_limit = add_hooks.borrow().actor_kind_limit();
            let discriminator = parse_discriminator(event, discriminator, kind_limit)?;
            let pinned = lua.create_registry_value(callback)?;
            add_hooks
                .borrow_mut()
                .add(event, discriminator, pinned)
                .map_err(LuaError::external)?;
            Ok(())
        },
    )?;
    globals.set("addHook", add_hook)?;

    let hud_table = lua.create_table()?;
    let hud_hooks = Rc::clone(hooks);
    let hud_guard = Rc::clone(hud_running);
    hud_table.set(
        "add",
        lua.create_function(move |lua, (callback, layer): (Function, Option<String>)| {
            if hud_guard.get() {
                return Err(LuaError::external(HookError::HudRunning));
            }
            let layer = match layer {
                None => HudLayer::Game,
                Some(name) => HudLayer::from_name(&name)
                    .ok_or_else(|| LuaError::external(HookError::UnknownHook(name)))?,
            };
            let pinned = lua.create_registry_value(callback)?;
            hud_hooks.borrow_mut().add_hud(layer, pinned);
            Ok(())
        })?,
    )?;
    globals.set("hud", hud_table)?;

    let register_metatables = Rc::clone(metatables);
    globals.set(
        "registerMetatable",
        lua.create_function(move |lua, table: Table| {
            let mut registered = register_metatables.borrow_mut();
            if registered.len() >= usize::from(u16::MAX) {
                return Err(LuaError::RuntimeError(
                    "too many metatables registered".to_string(),
                ));
            }
            registered.push(lua.create_registry_value(table)?);
            Ok(())
        })?,
    )?;

    let player_world = Rc::clone(world);
    globals.set(
        "player",
        lua.create_function(move |lua, slot: u8| push_player_value(lua, &player_world, slot))?,
    )?;

    let line_world = Rc::clone(world);
    globals.set(
        "line",
        lua.create_function(move |lua, index: u16| push_line_value(lua, &line_world, index))?,
    )?;

    let sector_world = Rc::clone(world);
    globals.set(
        "sector",
        lua.create_function(move |lua, index: u16| push_sector_value(lua, &sector_world, index))?,
    )?;

    let side_world = Rc::clone(world);
    globals.set(
        "side",
        lua.create_function(move |lua, index: u16| push_side_value(lua, &side_world, index))?,
    )?;

    let vertex_world = Rc::clone(world);
    globals.set(
        "vertex",
        lua.create_function(move |lua, index: u16| push_vertex_value(lua, &vertex_world, index))?,
    )?;

    Ok(())
}
