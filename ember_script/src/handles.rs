//! Typed handle bridge between native world objects and Lua userdata.
//!
//! Pushing the same native object twice yields the identical userdata
//! (scripts may key tables by handle), and a despawned actor's refs
//! report `valid == false` through the arena generation check instead
//! of dangling. Ad-hoc script fields on actors and players live in
//! per-object tables inside the Lua registry; the archival engine walks
//! those tables.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{
    AnyUserData, Error as LuaError, Lua, MetaMethod, Result as LuaResult, Table, UserData,
    UserDataFields, UserDataMethods, Value,
};

use crate::world::{ActorHandle, World};

pub(crate) const HANDLE_CACHE_REGISTRY: &str = "ember.handles";
pub(crate) const ACTOR_VARS_REGISTRY: &str = "ember.actor_vars";
pub(crate) const PLAYER_VARS_REGISTRY: &str = "ember.player_vars";

fn int_arg(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(number) => Some(*number),
        Value::Number(number) if number.fract() == 0.0 => Some(*number as i64),
        _ => None,
    }
}

fn vars_lookup<'lua>(
    lua: &'lua Lua,
    registry_name: &str,
    key: i64,
) -> LuaResult<Option<Table<'lua>>> {
    let vars: Table = lua.named_registry_value(registry_name)?;
    let entry: Value = vars.raw_get(key)?;
    match entry {
        Value::Table(table) => Ok(Some(table)),
        _ => Ok(None),
    }
}

fn vars_ensure<'lua>(lua: &'lua Lua, registry_name: &str, key: i64) -> LuaResult<Table<'lua>> {
    let vars: Table = lua.named_registry_value(registry_name)?;
    let entry: Value = vars.raw_get(key)?;
    match entry {
        Value::Table(table) => Ok(table),
        _ => {
            let table = lua.create_table()?;
            vars.raw_set(key, table.clone())?;
            Ok(table)
        }
    }
}

/// Script-visible reference to one arena actor.
#[derive(Debug, Clone)]
pub(crate) struct ActorRef {
    pub(crate) handle: ActorHandle,
    pub(crate) world: Rc<RefCell<World>>,
}

impl ActorRef {
    fn is_live(&self) -> bool {
        self.world.borrow().is_live(self.handle)
    }
}

impl UserData for ActorRef {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| -> LuaResult<Value> {
            let name = match &key {
                Value::String(text) => Some(text.to_str()?.to_owned()),
                _ => None,
            };
            // "valid" must stay readable after despawn.
            if name.as_deref() == Some("valid") {
                return Ok(Value::Boolean(this.is_live()));
            }
            let stable_id;
            {
                let world = this.world.borrow();
                let Some(actor) = world.actor(this.handle) else {
                    return Err(LuaError::RuntimeError(
                        "accessed actor that no longer exists".to_string(),
                    ));
                };
                match name.as_deref() {
                    Some("kind") => return Ok(Value::Integer(i64::from(actor.kind))),
                    Some("id") => return Ok(Value::Integer(i64::from(actor.stable_id))),
                    Some("health") => return Ok(Value::Integer(i64::from(actor.health))),
                    Some("fuse") => return Ok(Value::Integer(i64::from(actor.fuse))),
                    _ => stable_id = actor.stable_id,
                }
            }
            match vars_lookup(lua, ACTOR_VARS_REGISTRY, i64::from(stable_id))? {
                Some(vars) => {
                    let value: Value = vars.raw_get(key)?;
                    Ok(value)
                }
                None => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (Value, Value)| -> LuaResult<()> {
                let name = match &key {
                    Value::String(text) => text.to_str()?.to_owned(),
                    _ => {
                        return Err(LuaError::RuntimeError(
                            "actor fields take string keys".to_string(),
                        ))
                    }
                };
                match name.as_str() {
                    "valid" | "kind" | "id" => Err(LuaError::RuntimeError(format!(
                        "actor field '{name}' is read-only"
                    ))),
                    "health" | "fuse" => {
                        let number = int_arg(&value).ok_or_else(|| {
                            LuaError::RuntimeError(format!("actor field '{name}' takes an integer"))
                        })?;
                        let number = i32::try_from(number).map_err(|_| {
                            LuaError::RuntimeError(format!("actor field '{name}' is out of range"))
                        })?;
                        let mut world = this.world.borrow_mut();
                        let Some(actor) = world.actor_mut(this.handle) else {
                            return Err(LuaError::RuntimeError(
                                "accessed actor that no longer exists".to_string(),
                            ));
                        };
                        if name == "health" {
                            actor.health = number;
                        } else {
                            actor.fuse = number;
                        }
                        Ok(())
                    }
                    _ => {
                        let stable_id = {
                            let world = this.world.borrow();
                            let Some(actor) = world.actor(this.handle) else {
                                return Err(LuaError::RuntimeError(
                                    "accessed actor that no longer exists".to_string(),
                                ));
                            };
                            actor.stable_id
                        };
                        let vars = vars_ensure(lua, ACTOR_VARS_REGISTRY, i64::from(stable_id))?;
                        vars.raw_set(key, value)
                    }
                }
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.world.borrow().actor(this.handle) {
                Some(actor) => format!("actor #{}", actor.stable_id),
                None => "actor <removed>".to_string(),
            })
        });
    }
}

/// Script-visible reference to one player slot.
#[derive(Debug, Clone)]
pub(crate) struct PlayerRef {
    pub(crate) slot: u8,
    pub(crate) world: Rc<RefCell<World>>,
}

impl PlayerRef {
    fn is_live(&self) -> bool {
        self.world.borrow().player_occupied(usize::from(self.slot))
    }
}

impl UserData for PlayerRef {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| -> LuaResult<Value> {
            let name = match &key {
                Value::String(text) => Some(text.to_str()?.to_owned()),
                _ => None,
            };
            if name.as_deref() == Some("valid") {
                return Ok(Value::Boolean(this.is_live()));
            }
            if name.as_deref() == Some("slot") {
                return Ok(Value::Integer(i64::from(this.slot)));
            }
            if !this.is_live() {
                return Err(LuaError::RuntimeError(
                    "accessed player that is not in the game".to_string(),
                ));
            }
            if name.as_deref() == Some("skin") {
                let world = this.world.borrow();
                let skin = world
                    .player(usize::from(this.slot))
                    .map(|player| player.skin.clone())
                    .unwrap_or_default();
                return Ok(Value::String(lua.create_string(&skin)?));
            }
            match vars_lookup(lua, PLAYER_VARS_REGISTRY, i64::from(this.slot))? {
                Some(vars) => {
                    let value: Value = vars.raw_get(key)?;
                    Ok(value)
                }
                None => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (Value, Value)| -> LuaResult<()> {
                if !matches!(key, Value::String(_)) {
                    return Err(LuaError::RuntimeError(
                        "player fields take string keys".to_string(),
                    ));
                }
                if let Value::String(text) = &key {
                    let name = text.to_str()?;
                    if matches!(name, "valid" | "slot" | "skin") {
                        return Err(LuaError::RuntimeError(format!(
                            "player field '{name}' is read-only"
                        )));
                    }
                }
                if !this.is_live() {
                    return Err(LuaError::RuntimeError(
                        "accessed player that is not in the game".to_string(),
                    ));
                }
                let vars = vars_ensure(lua, PLAYER_VARS_REGISTRY, i64::from(this.slot))?;
                vars.raw_set(key, value)
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("player #{}", this.slot))
        });
    }
}

macro_rules! geometry_ref {
    ($name:ident, $count:ident) => {
        #[derive(Debug, Clone)]
        pub(crate) struct $name {
            pub(crate) index: u16,
            pub(crate) world: Rc<RefCell<World>>,
        }

        impl $name {
            fn is_live(&self) -> bool {
                usize::from(self.index) < self.world.borrow().$count()
            }
        }
    };
}

geometry_ref!(LineRef, line_count);
geometry_ref!(SectorRef, sector_count);
geometry_ref!(SideRef, side_count);
geometry_ref!(VertexRef, vertex_count);

impl UserData for LineRef {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("valid", |_, this| Ok(this.is_live()));
        fields.add_field_method_get("index", |_, this| Ok(this.index));
        fields.add_field_method_get("trigger", |lua, this| {
            let world = this.world.borrow();
            match world.line(this.index).and_then(|line| line.trigger.as_ref()) {
                Some(trigger) => Ok(Value::String(lua.create_string(trigger)?)),
                None => Ok(Value::Nil),
            }
        });
    }
}

impl UserData for SectorRef {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("valid", |_, this| Ok(this.is_live()));
        fields.add_field_method_get("index", |_, this| Ok(this.index));
        fields.add_field_method_get("tag", |_, this| {
            Ok(this
                .world
                .borrow()
                .sector(this.index)
                .map(|sector| sector.tag)
                .unwrap_or_default())
        });
    }
}

impl UserData for SideRef {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("valid", |_, this| Ok(this.is_live()));
        fields.add_field_method_get("index", |_, this| Ok(this.index));
        fields.add_field_method_get("texture", |lua, this| {
            let world = this.world.borrow();
            let texture = world
                .side(this.index)
                .map(|side| side.texture.clone())
                .unwrap_or_default();
            Ok(Value::String(lua.create_string(&texture)?))
        });
    }
}

impl UserData for VertexRef {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("valid", |_, this| Ok(this.is_live()));
        fields.add_field_method_get("index", |_, this| Ok(this.index));
        fields.add_field_method_get("x", |_, this| {
            Ok(this
                .world
                .borrow()
                .vertex(this.index)
                .map(|vertex| vertex.x)
                .unwrap_or_default())
        });
        fields.add_field_method_get("y", |_, this| {
            Ok(this
                .world
                .borrow()
                .vertex(this.index)
                .map(|vertex| vertex.y)
                .unwrap_or_default())
        });
    }
}

fn cached_or_create<'lua, T>(
    lua: &'lua Lua,
    key: String,
    matches: impl Fn(&T) -> bool,
    create: impl FnOnce() -> T,
) -> LuaResult<Value<'lua>>
where
    T: UserData + 'static,
{
    let cache: Table = lua.named_registry_value(HANDLE_CACHE_REGISTRY)?;
    let entry: Value = cache.raw_get(key.as_str())?;
    if let Value::UserData(existing) = entry {
        let is_match = if let Ok(found) = existing.borrow::<T>() {
            matches(&found)
        } else {
            false
        };
        if is_match {
            return Ok(Value::UserData(existing));
        }
    }
    let fresh: AnyUserData = lua.create_userdata(create())?;
    cache.raw_set(key.as_str(), fresh.clone())?;
    Ok(Value::UserData(fresh))
}

pub(crate) fn push_actor_value<'lua>(
    lua: &'lua Lua,
    world: &Rc<RefCell<World>>,
    handle: ActorHandle,
) -> LuaResult<Value<'lua>> {
    cached_or_create(
        lua,
        format!("a{}", handle.index),
        |existing: &ActorRef| existing.handle == handle,
        || ActorRef {
            handle,
            world: Rc::clone(world),
        },
    )
}

pub(crate) fn push_player_value<'lua>(
    lua: &'lua Lua,
    world: &Rc<RefCell<World>>,
    slot: u8,
) -> LuaResult<Value<'lua>> {
    cached_or_create(
        lua,
        format!("p{slot}"),
        |existing: &PlayerRef| existing.slot == slot,
        || PlayerRef {
            slot,
            world: Rc::clone(world),
        },
    )
}

pub(crate) fn push_line_value<'lua>(
    lua: &'lua Lua,
    world: &Rc<RefCell<World>>,
    index: u16,
) -> LuaResult<Value<'lua>> {
    cached_or_create(
        lua,
        format!("l{index}"),
        |existing: &LineRef| existing.index == index,
        || LineRef {
            index,
            world: Rc::clone(world),
        },
    )
}

pub(crate) fn push_sector_value<'lua>(
    lua: &'lua Lua,
    world: &Rc<RefCell<World>>,
    index: u16,
) -> LuaResult<Value<'lua>> {
    cached_or_create(
        lua,
        format!("s{index}"),
        |existing: &SectorRef| existing.index == index,
        || SectorRef {
            index,
            world: Rc::clone(world),
        },
    )
}

pub(crate) fn push_side_value<'lua>(
    lua: &'lua Lua,
    world: &Rc<RefCell<World>>,
    index: u16,
) -> LuaResult<Value<'lua>> {
    cached_or_create(
        lua,
        format!("sd{index}"),
        |existing: &SideRef| existing.index == index,
        || SideRef {
            index,
            world: Rc::clone(world),
        },
    )
}

pub(crate) fn push_vertex_value<'lua>(
    lua: &'lua Lua,
    world: &Rc<RefCell<World>>,
    index: u16,
) -> LuaResult<Value<'lua>> {
    cached_or_create(
        lua,
        format!("v{index}"),
        |existing: &VertexRef| existing.index == index,
        || VertexRef {
            index,
            world: Rc::clone(world),
        },
    )
}

/// Final step of despawning: drops the cached userdata and the actor's
/// ad-hoc field table. Callers bump the arena generation first, so any
/// surviving ref already reports itself invalid.
pub(crate) fn invalidate_actor(lua: &Lua, index: u32, stable_id: u32) -> LuaResult<()> {
    let cache: Table = lua.named_registry_value(HANDLE_CACHE_REGISTRY)?;
    cache.raw_set(format!("a{index}"), Value::Nil)?;
    let vars: Table = lua.named_registry_value(ACTOR_VARS_REGISTRY)?;
    vars.raw_set(stable_id, Value::Nil)?;
    Ok(())
}

pub(crate) fn invalidate_player(lua: &Lua, slot: u8) -> LuaResult<()> {
    let cache: Table = lua.named_registry_value(HANDLE_CACHE_REGISTRY)?;
    cache.raw_set(format!("p{slot}"), Value::Nil)?;
    let vars: Table = lua.named_registry_value(PLAYER_VARS_REGISTRY)?;
    vars.raw_set(i64::from(slot), Value::Nil)?;
    Ok(())
}
