//! State archival engine.
//!
//! Once per save or resync point, every piece of scripting-owned state
//! is serialized into (or restored from) one byte stream: per-player
//! ad-hoc fields, per-actor ad-hoc fields, whatever mod code persists
//! through the NetVars hook, and finally the closure over every table
//! those values reference. Both sides walk the stream in the same fixed
//! order; the dedup id tables give shared and cyclic structures exactly
//! one body each.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use ember_stream::{CodecError, StreamReader, StreamWriter, Tag};
use mlua::{
    AnyUserData, Error as LuaError, Lua, MultiValue, RegistryKey, Result as LuaResult, Table,
    Value,
};
use thiserror::Error;

use crate::handles::{
    push_actor_value, push_line_value, push_player_value, push_sector_value, push_side_value,
    push_vertex_value, ActorRef, LineRef, PlayerRef, SectorRef, SideRef, VertexRef,
    ACTOR_VARS_REGISTRY, PLAYER_VARS_REGISTRY,
};
use crate::session::ScriptSession;
use crate::vectors::{Matrix, Quaternion, Vec2, Vec3};

/// Header value closing the per-actor record sequence. Stable ids are
/// allocated from 1 upward and never reach it.
const ACTOR_STREAM_END: u32 = u32::MAX;

/// Fatal archival failures. Any of these aborts the whole save/load
/// operation; a half-restored object graph is worse than a hard error.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("scripting runtime error: {0}")]
    Runtime(#[from] LuaError),
    #[error("archived actor {0} is not present in the world")]
    UnknownActor(u32),
    #[error("archived player slot {0} is out of range")]
    PlayerOutOfRange(u8),
    #[error("archived {kind} index {index} is out of range")]
    NativeOutOfRange { kind: &'static str, index: u16 },
    #[error("table id {0} references a record that was never announced")]
    BadTableId(u16),
    #[error("inline value id {0} references a record that was never announced")]
    BadInlineId(u16),
    #[error("metatable id {0} was never registered")]
    UnknownMetatable(u16),
    #[error("end-of-table marker found in a value position")]
    UnexpectedEnd,
    #[error("{0} trailing bytes after the archive")]
    TrailingBytes(usize),
}

#[derive(Debug, PartialEq, Eq)]
enum WriteOutcome {
    Archived,
    /// The value kind cannot be archived; a null tag went out in its
    /// place and the caller should warn.
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
enum InlineKind {
    Vec2,
    Vec3,
    Matrix,
    Quaternion,
}

impl InlineKind {
    fn tag(self) -> Tag {
        match self {
            InlineKind::Vec2 => Tag::Vec2,
            InlineKind::Vec3 => Tag::Vec3,
            InlineKind::Matrix => Tag::Matrix,
            InlineKind::Quaternion => Tag::Quaternion,
        }
    }
}

fn identity(value: &Value) -> usize {
    value.to_pointer() as usize
}

/// Write-pass bookkeeping. Interned tables and inline values are pinned
/// in the registry for the duration so their identities cannot be
/// recycled mid-pass.
struct WriteState {
    out: StreamWriter,
    tables: Vec<RegistryKey>,
    table_ids: BTreeMap<usize, u16>,
    /// Table ids whose bodies are still owed to the stream. Emitting a
    /// body can discover new tables, which join the back of the queue;
    /// draining it to empty is what closes over cyclic graphs.
    pending: VecDeque<u16>,
    inline: Vec<RegistryKey>,
    inline_ids: BTreeMap<usize, u16>,
}

impl WriteState {
    fn new() -> Self {
        WriteState {
            out: StreamWriter::new(),
            tables: Vec::new(),
            table_ids: BTreeMap::new(),
            pending: VecDeque::new(),
            inline: Vec::new(),
            inline_ids: BTreeMap::new(),
        }
    }

    fn finish(self) -> (Vec<u8>, Vec<RegistryKey>) {
        let mut keys = self.tables;
        keys.extend(self.inline);
        (self.out.into_bytes(), keys)
    }
}

fn intern_table<'lua>(
    lua: &'lua Lua,
    st: &mut WriteState,
    table: &Table<'lua>,
) -> LuaResult<Option<u16>> {
    let key = identity(&Value::Table(table.clone()));
    if let Some(id) = st.table_ids.get(&key) {
        return Ok(Some(*id));
    }
    if st.tables.len() >= usize::from(u16::MAX) {
        return Ok(None);
    }
    let id = (st.tables.len() + 1) as u16;
    st.tables.push(lua.create_registry_value(table.clone())?);
    st.table_ids.insert(key, id);
    st.pending.push_back(id);
    Ok(Some(id))
}

fn write_inline<'lua>(
    lua: &'lua Lua,
    st: &mut WriteState,
    ud: &AnyUserData<'lua>,
    kind: InlineKind,
) -> LuaResult<WriteOutcome> {
    let key = identity(&Value::UserData(ud.clone()));
    if let Some(id) = st.inline_ids.get(&key) {
        st.out.put_tag(kind.tag());
        st.out.put_u16(*id);
        return Ok(WriteOutcome::Archived);
    }
    if st.inline.len() >= usize::from(u16::MAX) {
        st.out.put_tag(Tag::Null);
        return Ok(WriteOutcome::Unsupported);
    }
    let id = (st.inline.len() + 1) as u16;
    st.inline.push(lua.create_registry_value(ud.clone())?);
    st.inline_ids.insert(key, id);
    st.out.put_tag(kind.tag());
    st.out.put_u16(id);
    match kind {
        InlineKind::Vec2 => {
            let vector = ud.borrow::<Vec2>()?;
            st.out.put_f32(vector.x);
            st.out.put_f32(vector.y);
        }
        InlineKind::Vec3 => {
            let vector = ud.borrow::<Vec3>()?;
            st.out.put_f32(vector.x);
            st.out.put_f32(vector.y);
            st.out.put_f32(vector.z);
        }
        InlineKind::Matrix => {
            let matrix = ud.borrow::<Matrix>()?;
            for row in &matrix.cells {
                for cell in row {
                    st.out.put_f32(*cell);
                }
            }
        }
        InlineKind::Quaternion => {
            let quat = ud.borrow::<Quaternion>()?;
            st.out.put_f32(quat.x);
            st.out.put_f32(quat.y);
            st.out.put_f32(quat.z);
            st.out.put_f32(quat.w);
        }
    }
    Ok(WriteOutcome::Archived)
}

/// Encodes one value. Unarchivable kinds (functions, threads, light
/// userdata, non-integral or oversized numbers) become a null tag and
/// report `Unsupported` so the caller can warn without aborting.
fn write_value<'lua>(
    lua: &'lua Lua,
    st: &mut WriteState,
    value: &Value<'lua>,
) -> LuaResult<WriteOutcome> {
    match value {
        Value::Nil => {
            st.out.put_tag(Tag::Null);
            Ok(WriteOutcome::Archived)
        }
        Value::Boolean(flag) => {
            st.out.put_tag(if *flag { Tag::True } else { Tag::False });
            Ok(WriteOutcome::Archived)
        }
        Value::Integer(number) => match i32::try_from(*number) {
            Ok(narrow) => {
                st.out.put_int(narrow);
                Ok(WriteOutcome::Archived)
            }
            Err(_) => {
                st.out.put_tag(Tag::Null);
                Ok(WriteOutcome::Unsupported)
            }
        },
        Value::Number(number) => {
            let integral = *number;
            if integral.fract() == 0.0
                && integral >= f64::from(i32::MIN)
                && integral <= f64::from(i32::MAX)
            {
                st.out.put_int(integral as i32);
                Ok(WriteOutcome::Archived)
            } else {
                st.out.put_tag(Tag::Null);
                Ok(WriteOutcome::Unsupported)
            }
        }
        Value::String(text) => {
            st.out.put_str(text.as_bytes());
            Ok(WriteOutcome::Archived)
        }
        Value::Table(table) => match intern_table(lua, st, table)? {
            Some(id) => {
                st.out.put_tag(Tag::TableRef);
                st.out.put_u16(id);
                Ok(WriteOutcome::Archived)
            }
            None => {
                st.out.put_tag(Tag::Null);
                Ok(WriteOutcome::Unsupported)
            }
        },
        Value::UserData(ud) => {
            if let Ok(actor) = ud.borrow::<ActorRef>() {
                // A stale handle archives as null rather than failing
                // the save.
                match actor.world.borrow().actor(actor.handle) {
                    Some(state) => {
                        st.out.put_tag(Tag::Actor);
                        st.out.put_u32(state.stable_id);
                    }
                    None => st.out.put_tag(Tag::Null),
                }
                Ok(WriteOutcome::Archived)
            } else if let Ok(player) = ud.borrow::<PlayerRef>() {
                st.out.put_tag(Tag::Player);
                st.out.put_u8(player.slot);
                Ok(WriteOutcome::Archived)
            } else if let Ok(line) = ud.borrow::<LineRef>() {
                st.out.put_tag(Tag::Line);
                st.out.put_u16(line.index);
                Ok(WriteOutcome::Archived)
            } else if let Ok(sector) = ud.borrow::<SectorRef>() {
                st.out.put_tag(Tag::Sector);
                st.out.put_u16(sector.index);
                Ok(WriteOutcome::Archived)
            } else if let Ok(side) = ud.borrow::<SideRef>() {
                st.out.put_tag(Tag::Side);
                st.out.put_u16(side.index);
                Ok(WriteOutcome::Archived)
            } else if let Ok(vertex) = ud.borrow::<VertexRef>() {
                st.out.put_tag(Tag::Vertex);
                st.out.put_u16(vertex.index);
                Ok(WriteOutcome::Archived)
            } else if ud.is::<Vec2>() {
                write_inline(lua, st, ud, InlineKind::Vec2)
            } else if ud.is::<Vec3>() {
                write_inline(lua, st, ud, InlineKind::Vec3)
            } else if ud.is::<Matrix>() {
                write_inline(lua, st, ud, InlineKind::Matrix)
            } else if ud.is::<Quaternion>() {
                write_inline(lua, st, ud, InlineKind::Quaternion)
            } else {
                st.out.put_tag(Tag::Null);
                Ok(WriteOutcome::Unsupported)
            }
        }
        _ => {
            st.out.put_tag(Tag::Null);
            Ok(WriteOutcome::Unsupported)
        }
    }
}

/// Collects an ad-hoc field table as sorted (key, value) pairs. Field
/// keys are strings by construction; anything else is skipped with a
/// warning. Sorting keeps the emission order independent of the
/// runtime's hash iteration order.
fn collect_field_pairs<'lua>(
    vars: &Table<'lua>,
    owner: &str,
) -> LuaResult<Vec<(Vec<u8>, Value<'lua>)>> {
    let mut pairs = Vec::new();
    for entry in vars.clone().pairs::<Value, Value>() {
        let (key, value) = entry?;
        match key {
            Value::String(text) => pairs.push((text.as_bytes().to_vec(), value)),
            other => eprintln!(
                "[ember_script] warning: {owner} field key ({}) is not a string and was skipped",
                other.type_name()
            ),
        }
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(pairs)
}

fn write_field_record<'lua>(
    lua: &'lua Lua,
    st: &mut WriteState,
    pairs: Vec<(Vec<u8>, Value<'lua>)>,
    owner: &str,
) -> LuaResult<()> {
    st.out.put_u16(pairs.len() as u16);
    for (key, value) in pairs {
        st.out.put_str(&key);
        let value_type = value.type_name();
        if write_value(lua, st, &value)? == WriteOutcome::Unsupported {
            eprintln!(
                "[ember_script] warning: value of {owner} field '{}' ({value_type}) could not be archived",
                String::from_utf8_lossy(&key)
            );
        }
    }
    Ok(())
}

/// Keys with a total order; emitted before reference-typed keys.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum ScalarKey {
    Bool(bool),
    Int(i64),
    Str(Vec<u8>),
}

fn scalar_key(key: &Value) -> Option<ScalarKey> {
    match key {
        Value::Boolean(flag) => Some(ScalarKey::Bool(*flag)),
        Value::Integer(number) => Some(ScalarKey::Int(*number)),
        Value::Number(number) if number.fract() == 0.0 => Some(ScalarKey::Int(*number as i64)),
        Value::String(text) => Some(ScalarKey::Str(text.as_bytes().to_vec())),
        _ => None,
    }
}

fn write_pair<'lua>(
    lua: &'lua Lua,
    st: &mut WriteState,
    table_id: u16,
    key: Value<'lua>,
    value: Value<'lua>,
) -> LuaResult<()> {
    let key_type = key.type_name();
    if write_value(lua, st, &key)? == WriteOutcome::Unsupported {
        eprintln!(
            "[ember_script] warning: key ({key_type}) of archived table {table_id} could not be archived"
        );
    }
    let value_type = value.type_name();
    if write_value(lua, st, &value)? == WriteOutcome::Unsupported {
        eprintln!(
            "[ember_script] warning: value ({value_type}) in archived table {table_id} could not be archived"
        );
    }
    Ok(())
}

fn metatable_id<'lua>(
    lua: &'lua Lua,
    registered: &[RegistryKey],
    metatable: &Table<'lua>,
) -> LuaResult<u16> {
    let target = identity(&Value::Table(metatable.clone()));
    for (index, key) in registered.iter().enumerate() {
        let candidate: Table = lua.registry_value(key)?;
        if identity(&Value::Table(candidate)) == target {
            return Ok((index + 1) as u16);
        }
    }
    Ok(0)
}

/// Read-pass bookkeeping; mirrors `WriteState`.
struct ReadState<'a> {
    input: StreamReader<'a>,
    tables: Vec<RegistryKey>,
    inline: Vec<RegistryKey>,
    /// Stream fault raised inside the NetVars closure; surfaced as a
    /// fatal error once the dispatch returns.
    failed: Option<ArchiveError>,
}

impl<'a> ReadState<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ReadState {
            input: StreamReader::new(bytes),
            tables: Vec::new(),
            inline: Vec::new(),
            failed: None,
        }
    }

    fn take_keys(&mut self) -> Vec<RegistryKey> {
        let mut keys = std::mem::take(&mut self.tables);
        keys.extend(std::mem::take(&mut self.inline));
        keys
    }
}

fn release_keys(lua: &Lua, keys: Vec<RegistryKey>) {
    for key in keys {
        if let Err(err) = lua.remove_registry_value(key) {
            eprintln!("[ember_script] warning: failed to release archive bookkeeping: {err}");
        }
    }
}

impl ScriptSession {
    /// Serializes all scripting-owned state for a save game or a
    /// network resync. The emission order is fixed and byte-for-byte
    /// deterministic across processes holding the same state.
    pub fn archive(&self) -> Result<Vec<u8>> {
        let state = RefCell::new(WriteState::new());
        let result = self
            .archive_inner(&state)
            .context("archiving scripting state");
        let (bytes, keys) = state.into_inner().finish();
        release_keys(self.lua(), keys);
        result.map(|()| bytes)
    }

    fn archive_inner(&self, state: &RefCell<WriteState>) -> Result<(), ArchiveError> {
        let lua = self.lua();

        // Players, in slot order. Slot 0 always frames the stream even
        // when empty; other slots contribute only while occupied.
        let player_vars: Table = lua.named_registry_value(PLAYER_VARS_REGISTRY)?;
        let slot_count = self.world.borrow().player_slot_count();
        for slot in 0..slot_count {
            if slot > 0 && !self.world.borrow().player_occupied(slot) {
                continue;
            }
            let entry: Value = player_vars.raw_get(slot as i64)?;
            let owner = format!("player {slot}");
            let pairs = match &entry {
                Value::Table(vars) => collect_field_pairs(vars, &owner)?,
                _ => Vec::new(),
            };
            write_field_record(lua, &mut state.borrow_mut(), pairs, &owner)?;
        }

        // Actors, in spawn order; only actors carrying fields emit a
        // record, each headed by its stable id.
        let actor_vars: Table = lua.named_registry_value(ACTOR_VARS_REGISTRY)?;
        let stable_ids: Vec<u32> = self
            .world
            .borrow()
            .live_actors()
            .map(|(_, actor)| actor.stable_id)
            .collect();
        for stable_id in stable_ids {
            let entry: Value = actor_vars.raw_get(stable_id)?;
            let Value::Table(vars) = entry else { continue };
            let owner = format!("actor {stable_id}");
            let pairs = collect_field_pairs(&vars, &owner)?;
            if pairs.is_empty() {
                continue;
            }
            let mut st = state.borrow_mut();
            st.out.put_u32(stable_id);
            write_field_record(lua, &mut st, pairs, &owner)?;
        }
        state.borrow_mut().out.put_u32(ACTOR_STREAM_END);

        // The NetVars seam: mods push arbitrary values through the same
        // codec and dedup tables via the archiver argument.
        lua.scope(|scope| {
            let archiver = scope.create_function(|lua, values: MultiValue| {
                let mut st = state.borrow_mut();
                for value in values.iter() {
                    let value_type = value.type_name();
                    if write_value(lua, &mut st, value)? == WriteOutcome::Unsupported {
                        eprintln!(
                            "[ember_script] warning: net variable ({value_type}) could not be archived"
                        );
                    }
                }
                Ok(values)
            })?;
            self.dispatch_net_vars(archiver);
            Ok(())
        })?;

        // Table closure: drain the worklist, emitting each body once.
        let metatables = self.metatables.borrow();
        let mut st = state.borrow_mut();
        while let Some(id) = st.pending.pop_front() {
            let table: Table = lua.registry_value(&st.tables[usize::from(id) - 1])?;
            let mut scalars: Vec<(ScalarKey, Value, Value)> = Vec::new();
            let mut references: Vec<(Value, Value)> = Vec::new();
            for entry in table.clone().pairs::<Value, Value>() {
                let (key, value) = entry?;
                match scalar_key(&key) {
                    Some(rank) => scalars.push((rank, key, value)),
                    None => references.push((key, value)),
                }
            }
            scalars.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, key, value) in scalars {
                write_pair(lua, &mut st, id, key, value)?;
            }
            for (key, value) in references {
                write_pair(lua, &mut st, id, key, value)?;
            }
            st.out.put_tag(Tag::End);
            let meta_id = match table.get_metatable() {
                Some(metatable) => metatable_id(lua, &metatables, &metatable)?,
                None => 0,
            };
            st.out.put_u16(meta_id);
        }

        Ok(())
    }

    /// Restores scripting state from an archived stream. Any corruption
    /// or truncation is fatal to the whole operation.
    pub fn unarchive(&self, bytes: &[u8]) -> Result<()> {
        let state = RefCell::new(ReadState::new(bytes));
        let result = self
            .unarchive_inner(&state)
            .context("unarchiving scripting state");
        let keys = state.borrow_mut().take_keys();
        release_keys(self.lua(), keys);
        result
    }

    fn unarchive_inner(&self, state: &RefCell<ReadState>) -> Result<(), ArchiveError> {
        let lua = self.lua();

        // Restored state replaces the current script state wholesale.
        self.reset_script_tables()?;

        let player_vars: Table = lua.named_registry_value(PLAYER_VARS_REGISTRY)?;
        let slot_count = self.world.borrow().player_slot_count();
        for slot in 0..slot_count {
            if slot > 0 && !self.world.borrow().player_occupied(slot) {
                continue;
            }
            let count = state.borrow_mut().input.take_u16()?;
            if count == 0 {
                continue;
            }
            let vars = lua.create_table()?;
            self.read_fields(state, &vars, count)?;
            player_vars.raw_set(slot as i64, vars)?;
        }

        let actor_vars: Table = lua.named_registry_value(ACTOR_VARS_REGISTRY)?;
        loop {
            let stable_id = state.borrow_mut().input.take_u32()?;
            if stable_id == ACTOR_STREAM_END {
                break;
            }
            // Reconstruction may run in a different spawn order, so the
            // header is matched by identity, never by position.
            if self.world.borrow().find_by_stable_id(stable_id).is_none() {
                return Err(ArchiveError::UnknownActor(stable_id));
            }
            let count = state.borrow_mut().input.take_u16()?;
            let vars = lua.create_table()?;
            self.read_fields(state, &vars, count)?;
            actor_vars.raw_set(stable_id, vars)?;
        }

        lua.scope(|scope| {
            let unarchiver = scope.create_function(|lua, values: MultiValue| {
                let mut results = Vec::with_capacity(values.len());
                for _ in 0..values.len() {
                    match self.read_value(lua, state) {
                        Ok(value) => results.push(value),
                        Err(err) => {
                            let message = err.to_string();
                            state.borrow_mut().failed = Some(err);
                            return Err(LuaError::RuntimeError(message));
                        }
                    }
                }
                Ok(MultiValue::from_vec(results))
            })?;
            self.dispatch_net_vars(unarchiver);
            Ok(())
        })?;
        if let Some(err) = state.borrow_mut().failed.take() {
            return Err(err);
        }

        // Table bodies arrive in id order; reading one can announce new
        // ids, so the bound is re-read every iteration.
        let mut next = 0;
        loop {
            let announced = state.borrow().tables.len();
            if next >= announced {
                break;
            }
            let table: Table = lua.registry_value(&state.borrow().tables[next])?;
            next += 1;
            loop {
                let Some(key) = self.read_value_or_end(lua, state)? else {
                    break;
                };
                let value = self.read_value(lua, state)?;
                if matches!(key, Value::Nil) {
                    // An unarchivable key was stored as null; drop the
                    // pair instead of corrupting the table.
                    eprintln!(
                        "[ember_script] warning: nil key in archived table {next} was skipped"
                    );
                    continue;
                }
                table.raw_set(key, value)?;
            }
            let meta_id = state.borrow_mut().input.take_u16()?;
            if meta_id != 0 {
                let metatables = self.metatables.borrow();
                let key = metatables
                    .get(usize::from(meta_id) - 1)
                    .ok_or(ArchiveError::UnknownMetatable(meta_id))?;
                let metatable: Table = lua.registry_value(key)?;
                table.set_metatable(Some(metatable));
            }
        }

        let remaining = state.borrow().input.remaining();
        if remaining > 0 {
            return Err(ArchiveError::TrailingBytes(remaining));
        }
        Ok(())
    }

    fn read_fields(
        &self,
        state: &RefCell<ReadState>,
        vars: &Table,
        count: u16,
    ) -> Result<(), ArchiveError> {
        let lua = self.lua();
        for _ in 0..count {
            let key = {
                let mut st = state.borrow_mut();
                let tag = st.input.take_tag()?;
                st.input.take_str(tag)?.to_vec()
            };
            let value = self.read_value(lua, state)?;
            vars.raw_set(lua.create_string(&key)?, value)?;
        }
        Ok(())
    }

    fn read_value<'lua>(
        &self,
        lua: &'lua Lua,
        state: &RefCell<ReadState>,
    ) -> Result<Value<'lua>, ArchiveError> {
        match self.read_value_or_end(lua, state)? {
            Some(value) => Ok(value),
            None => Err(ArchiveError::UnexpectedEnd),
        }
    }

    fn read_value_or_end<'lua>(
        &self,
        lua: &'lua Lua,
        state: &RefCell<ReadState>,
    ) -> Result<Option<Value<'lua>>, ArchiveError> {
        let mut st = state.borrow_mut();
        let tag = st.input.take_tag()?;
        let value = match tag {
            Tag::Null => Value::Nil,
            Tag::True => Value::Boolean(true),
            Tag::False => Value::Boolean(false),
            Tag::Int8 | Tag::Int16 | Tag::Int32 => {
                Value::Integer(i64::from(st.input.take_int(tag)?))
            }
            Tag::SmallString | Tag::LargeString => {
                let bytes = st.input.take_str(tag)?;
                Value::String(lua.create_string(bytes)?)
            }
            Tag::TableRef => {
                let id = st.input.take_u16()?;
                if id == 0 {
                    return Err(ArchiveError::BadTableId(id));
                }
                let index = usize::from(id) - 1;
                if index < st.tables.len() {
                    Value::Table(lua.registry_value(&st.tables[index])?)
                } else if index == st.tables.len() {
                    // First reference: pre-allocate the table so
                    // forward and cyclic references resolve; its body
                    // arrives later in the stream.
                    let table = lua.create_table()?;
                    st.tables.push(lua.create_registry_value(table.clone())?);
                    Value::Table(table)
                } else {
                    return Err(ArchiveError::BadTableId(id));
                }
            }
            Tag::Actor => {
                let stable_id = st.input.take_u32()?;
                match self.world.borrow().find_by_stable_id(stable_id) {
                    Some(handle) => push_actor_value(lua, &self.world, handle)?,
                    // The referenced actor is gone; the field itself
                    // survives as nil, like a stale handle would.
                    None => Value::Nil,
                }
            }
            Tag::Player => {
                let slot = st.input.take_u8()?;
                if usize::from(slot) >= self.world.borrow().player_slot_count() {
                    return Err(ArchiveError::PlayerOutOfRange(slot));
                }
                push_player_value(lua, &self.world, slot)?
            }
            Tag::Line => {
                let index = st.input.take_u16()?;
                if usize::from(index) >= self.world.borrow().line_count() {
                    return Err(ArchiveError::NativeOutOfRange {
                        kind: "line",
                        index,
                    });
                }
                push_line_value(lua, &self.world, index)?
            }
            Tag::Sector => {
                let index = st.input.take_u16()?;
                if usize::from(index) >= self.world.borrow().sector_count() {
                    return Err(ArchiveError::NativeOutOfRange {
                        kind: "sector",
                        index,
                    });
                }
                push_sector_value(lua, &self.world, index)?
            }
            Tag::Side => {
                let index = st.input.take_u16()?;
                if usize::from(index) >= self.world.borrow().side_count() {
                    return Err(ArchiveError::NativeOutOfRange {
                        kind: "side",
                        index,
                    });
                }
                push_side_value(lua, &self.world, index)?
            }
            Tag::Vertex => {
                let index = st.input.take_u16()?;
                if usize::from(index) >= self.world.borrow().vertex_count() {
                    return Err(ArchiveError::NativeOutOfRange {
                        kind: "vertex",
                        index,
                    });
                }
                push_vertex_value(lua, &self.world, index)?
            }
            Tag::Vec2 | Tag::Vec3 | Tag::Matrix | Tag::Quaternion => {
                let id = st.input.take_u16()?;
                if id == 0 {
                    return Err(ArchiveError::BadInlineId(id));
                }
                let index = usize::from(id) - 1;
                if index < st.inline.len() {
                    Value::UserData(lua.registry_value(&st.inline[index])?)
                } else if index == st.inline.len() {
                    let ud = match tag {
                        Tag::Vec2 => {
                            let x = st.input.take_f32()?;
                            let y = st.input.take_f32()?;
                            lua.create_userdata(Vec2 { x, y })?
                        }
                        Tag::Vec3 => {
                            let x = st.input.take_f32()?;
                            let y = st.input.take_f32()?;
                            let z = st.input.take_f32()?;
                            lua.create_userdata(Vec3 { x, y, z })?
                        }
                        Tag::Quaternion => {
                            let x = st.input.take_f32()?;
                            let y = st.input.take_f32()?;
                            let z = st.input.take_f32()?;
                            let w = st.input.take_f32()?;
                            lua.create_userdata(Quaternion { x, y, z, w })?
                        }
                        _ => {
                            let mut cells = [[0.0f32; 4]; 4];
                            for row in &mut cells {
                                for cell in row.iter_mut() {
                                    *cell = st.input.take_f32()?;
                                }
                            }
                            lua.create_userdata(Matrix { cells })?
                        }
                    };
                    st.inline.push(lua.create_registry_value(ud.clone())?);
                    Value::UserData(ud)
                } else {
                    return Err(ArchiveError::BadInlineId(id));
                }
            }
            Tag::End => return Ok(None),
        };
        Ok(Some(value))
    }
}
