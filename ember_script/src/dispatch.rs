//! Hook dispatch engine.
//!
//! One firing: resolve the applicable callback-id lists (a snapshot, so
//! a callback that fires another event or registers new hooks cannot
//! disturb the outer iteration), marshal the argument set, invoke each
//! callback through the runtime's protected call, feed results to the
//! event's reducer, and hand one outcome back to the simulation.
//!
//! A failing callback never aborts a firing. Its error is logged once
//! per callback id (every time when the session is verbose) and counts
//! as "no opinion" for the reducer.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mlua::{Function, MultiValue, Result as LuaResult, Value};

use crate::events::{ActorEvent, GenericEvent, HudLayer, StringEvent};
use crate::handles::{push_actor_value, push_line_value};
use crate::hooks::{CallbackId, HookError};
use crate::session::ScriptSession;
use crate::world::ActorHandle;

/// Most values one dispatch may marshal. Firings past the limit are
/// rejected before any callback runs.
pub const MAX_DISPATCH_ARGS: usize = 48;

/// Tri-state outcome for force-policy events. Later explicit answers
/// override earlier ones; `None` never overrides anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    None,
    Allow,
    Deny,
}

/// Output slots of the music-change overlay. Each callback may
/// overwrite individual slots; a later explicit value wins, absence
/// leaves the prior one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MusicDirective {
    pub name: Option<String>,
    pub looping: Option<bool>,
    pub position: Option<i32>,
    pub fade_in: Option<i32>,
    /// Set when a callback answered `true`: keep the current track.
    pub suppress: bool,
}

/// One timed callback invocation from a profiled frame dispatch.
#[derive(Debug, Clone)]
pub struct HookSample {
    pub event: &'static str,
    pub callback: CallbackId,
    pub duration: Duration,
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

fn int_result(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(number) => Some(*number),
        Value::Number(number) if number.fract() == 0.0 => Some(*number as i64),
        _ => None,
    }
}

/// The closed set of result policies.
enum Reducer {
    /// First truthy result wins; the rest still run for side effects.
    Or(bool),
    /// First explicit `false` vetoes; nil is no opinion, truthy cannot
    /// undo a veto.
    Veto(bool),
    Force(Verdict),
    Sum(i64),
    Music(MusicDirective),
    /// Void events: results are discarded.
    Ignore,
}

impl Reducer {
    fn absorb(&mut self, value: Value) {
        match self {
            Reducer::Or(flag) => {
                if truthy(&value) {
                    *flag = true;
                }
            }
            Reducer::Veto(allowed) => {
                if matches!(value, Value::Boolean(false)) {
                    *allowed = false;
                }
            }
            Reducer::Force(verdict) => {
                if !matches!(value, Value::Nil) {
                    *verdict = if truthy(&value) {
                        Verdict::Allow
                    } else {
                        Verdict::Deny
                    };
                }
            }
            Reducer::Sum(total) => {
                if let Some(number) = int_result(&value) {
                    *total = total.wrapping_add(number);
                }
            }
            Reducer::Music(directive) => match value {
                Value::Boolean(true) => directive.suppress = true,
                Value::String(name) => {
                    directive.name = Some(String::from_utf8_lossy(name.as_bytes()).into_owned());
                }
                Value::Table(slots) => {
                    if let Ok(name) = slots.raw_get::<_, Value>("name") {
                        if let Value::String(name) = name {
                            directive.name =
                                Some(String::from_utf8_lossy(name.as_bytes()).into_owned());
                        }
                    }
                    if let Ok(Value::Boolean(looping)) = slots.raw_get::<_, Value>("looping") {
                        directive.looping = Some(looping);
                    }
                    if let Ok(position) = slots.raw_get::<_, Value>("position") {
                        if let Some(position) = int_result(&position) {
                            directive.position = i32::try_from(position).ok();
                        }
                    }
                    if let Ok(fade_in) = slots.raw_get::<_, Value>("fadein") {
                        if let Some(fade_in) = int_result(&fade_in) {
                            directive.fade_in = i32::try_from(fade_in).ok();
                        }
                    }
                }
                _ => {}
            },
            Reducer::Ignore => {}
        }
    }
}

struct HudGuard(Rc<Cell<bool>>);

impl HudGuard {
    fn engage(flag: Rc<Cell<bool>>) -> Self {
        flag.set(true);
        HudGuard(flag)
    }
}

impl Drop for HudGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl ScriptSession {
    fn pinned_callback(&self, id: CallbackId) -> LuaResult<Function<'_>> {
        let hooks = self.hooks.borrow();
        self.lua().registry_value(hooks.pinned(id))
    }

    pub(crate) fn warn_callback(&self, event: &str, id: CallbackId, err: &dyn std::fmt::Display) {
        let first = self.warned.borrow_mut().insert(id);
        if first || self.verbose {
            eprintln!("[ember_script] warning: {event} hook #{id} failed: {err}");
        }
    }

    fn record_sample(&self, event: &'static str, id: CallbackId, duration: Duration) {
        self.samples.borrow_mut().push(HookSample {
            event,
            callback: id,
            duration,
        });
    }

    /// Shared invocation loop. Arguments are re-pushed per callback so
    /// one callback cannot see another's leftovers. Returns how many
    /// callbacks were invoked.
    fn invoke_list<'lua>(
        &'lua self,
        event: &'static str,
        ids: &[CallbackId],
        args: &[Value<'lua>],
        reducer: &mut Reducer,
        timed: bool,
    ) -> usize {
        let mut invoked = 0;
        for &id in ids {
            let callback = match self.pinned_callback(id) {
                Ok(callback) => callback,
                Err(err) => {
                    self.warn_callback(event, id, &err);
                    continue;
                }
            };
            invoked += 1;
            let started = timed.then(Instant::now);
            let result = callback.call::<_, Value>(MultiValue::from_vec(args.to_vec()));
            if let Some(started) = started {
                self.record_sample(event, id, started.elapsed());
            }
            match result {
                Ok(value) => reducer.absorb(value),
                Err(err) => self.warn_callback(event, id, &err),
            }
        }
        invoked
    }

    fn generic_snapshot(&self, event: GenericEvent) -> Vec<CallbackId> {
        self.hooks.borrow().generic_list(event)
    }

    fn fire_generic<'lua>(
        &'lua self,
        event: GenericEvent,
        args: &[Value<'lua>],
        reducer: &mut Reducer,
    ) -> usize {
        let ids = self.generic_snapshot(event);
        self.invoke_list(event.name(), &ids, args, reducer, false)
    }

    pub fn fire_map_change(&self, map: i32) {
        self.fire_generic(
            GenericEvent::MapChange,
            &[Value::Integer(i64::from(map))],
            &mut Reducer::Ignore,
        );
    }

    pub fn fire_map_load(&self, map: i32) {
        self.fire_generic(
            GenericEvent::MapLoad,
            &[Value::Integer(i64::from(map))],
            &mut Reducer::Ignore,
        );
    }

    pub fn fire_player_join(&self, slot: u8) {
        self.fire_generic(
            GenericEvent::PlayerJoin,
            &[Value::Integer(i64::from(slot))],
            &mut Reducer::Ignore,
        );
    }

    pub fn fire_game_quit(&self) {
        self.fire_generic(GenericEvent::GameQuit, &[], &mut Reducer::Ignore);
    }

    /// Frame dispatches optionally time each callback; the timing is a
    /// wrapper around the same invocation primitive and covers only the
    /// guest call itself.
    fn fire_frame(&self, event: GenericEvent) {
        let ids = self.generic_snapshot(event);
        let timed = self.profiling.get();
        self.invoke_list(event.name(), &ids, &[], &mut Reducer::Ignore, timed);
    }

    pub fn fire_pre_think_frame(&self) {
        self.fire_frame(GenericEvent::PreThinkFrame);
    }

    pub fn fire_think_frame(&self) {
        self.fire_frame(GenericEvent::ThinkFrame);
    }

    pub fn fire_post_think_frame(&self) {
        self.fire_frame(GenericEvent::PostThinkFrame);
    }

    /// Boolean-OR: did any listener handle (and thus suppress) this
    /// chat message?
    pub fn fire_player_msg(&self, source: u8, target: u8, message: &str) -> bool {
        let args = [
            Value::Integer(i64::from(source)),
            Value::Integer(i64::from(target)),
            self.lua_string(message),
        ];
        let mut reducer = Reducer::Or(false);
        self.fire_generic(GenericEvent::PlayerMsg, &args, &mut reducer);
        matches!(reducer, Reducer::Or(true))
    }

    /// Inverted-AND veto: `false` means some listener blocked the
    /// switch; nil answers leave it allowed.
    pub fn fire_team_switch(&self, slot: u8, new_team: i32) -> bool {
        let args = [
            Value::Integer(i64::from(slot)),
            Value::Integer(i64::from(new_team)),
        ];
        let mut reducer = Reducer::Veto(true);
        self.fire_generic(GenericEvent::TeamSwitch, &args, &mut reducer);
        matches!(reducer, Reducer::Veto(true))
    }

    /// Accumulating: base award plus the sum of every callback's bonus.
    pub fn fire_score_award(&self, slot: u8, base: i32) -> i64 {
        let args = [
            Value::Integer(i64::from(slot)),
            Value::Integer(i64::from(base)),
        ];
        let mut reducer = Reducer::Sum(0);
        self.fire_generic(GenericEvent::ScoreAward, &args, &mut reducer);
        match reducer {
            Reducer::Sum(total) => i64::from(base).wrapping_add(total),
            _ => i64::from(base),
        }
    }

    /// Pass-through overlay over the music-change output slots.
    pub fn fire_music_change(&self, current: &str, requested: &str) -> MusicDirective {
        let args = [self.lua_string(current), self.lua_string(requested)];
        let mut reducer = Reducer::Music(MusicDirective::default());
        self.fire_generic(GenericEvent::MusicChange, &args, &mut reducer);
        match reducer {
            Reducer::Music(directive) => directive,
            _ => MusicDirective::default(),
        }
    }

    fn actor_snapshot(
        &self,
        event: ActorEvent,
        kind: u16,
    ) -> (Vec<CallbackId>, Vec<CallbackId>) {
        self.hooks.borrow().actor_lists(event, kind)
    }

    fn push_actor_arg(&self, handle: Option<ActorHandle>) -> Value<'_> {
        match handle {
            Some(handle) => match push_actor_value(self.lua(), &self.world, handle) {
                Ok(value) => value,
                Err(err) => {
                    eprintln!("[ember_script] warning: failed to push actor handle: {err}");
                    Value::Nil
                }
            },
            None => Value::Nil,
        }
    }

    pub(crate) fn lua_string(&self, text: &str) -> Value<'_> {
        match self.lua().create_string(text) {
            Ok(interned) => Value::String(interned),
            Err(err) => {
                eprintln!("[ember_script] warning: failed to intern dispatch argument: {err}");
                Value::Nil
            }
        }
    }

    /// Walks the generic row, then the kind-specific row, feeding one
    /// reducer. The subject actor's kind picks the row.
    fn fire_actor_rows<'lua>(
        &'lua self,
        event: ActorEvent,
        subject: ActorHandle,
        args: &[Value<'lua>],
        reducer: &mut Reducer,
    ) {
        let Some(kind) = self.world.borrow().actor(subject).map(|actor| actor.kind) else {
            return;
        };
        let (any_row, kind_row) = self.actor_snapshot(event, kind);
        if any_row.is_empty() && kind_row.is_empty() {
            return;
        }
        self.invoke_list(event.name(), &any_row, args, reducer, false);
        self.invoke_list(event.name(), &kind_row, args, reducer, false);
    }

    /// Boolean-OR actor dispatch for the single-subject events
    /// (Spawn, Fuse, Think, BossThink, BossDeath, Removed).
    pub fn fire_actor_hook(&self, event: ActorEvent, subject: ActorHandle) -> bool {
        let args = [self.push_actor_arg(Some(subject))];
        let mut reducer = Reducer::Or(false);
        self.fire_actor_rows(event, subject, &args, &mut reducer);
        matches!(reducer, Reducer::Or(true))
    }

    /// Force tri-state over a collision pair; rows come from the first
    /// thing's kind.
    pub fn fire_actor_collide(
        &self,
        event: ActorEvent,
        thing: ActorHandle,
        other: ActorHandle,
    ) -> Verdict {
        let args = [
            self.push_actor_arg(Some(thing)),
            self.push_actor_arg(Some(other)),
        ];
        let mut reducer = Reducer::Force(Verdict::None);
        self.fire_actor_rows(event, thing, &args, &mut reducer);
        match reducer {
            Reducer::Force(verdict) => verdict,
            _ => Verdict::None,
        }
    }

    pub fn fire_actor_touch(&self, special: ActorHandle, toucher: ActorHandle) -> bool {
        let args = [
            self.push_actor_arg(Some(special)),
            self.push_actor_arg(Some(toucher)),
        ];
        let mut reducer = Reducer::Or(false);
        self.fire_actor_rows(ActorEvent::Touch, special, &args, &mut reducer);
        matches!(reducer, Reducer::Or(true))
    }

    pub fn fire_should_damage(
        &self,
        target: ActorHandle,
        inflictor: Option<ActorHandle>,
        source: Option<ActorHandle>,
        damage: i32,
    ) -> Verdict {
        let args = [
            self.push_actor_arg(Some(target)),
            self.push_actor_arg(inflictor),
            self.push_actor_arg(source),
            Value::Integer(i64::from(damage)),
        ];
        let mut reducer = Reducer::Force(Verdict::None);
        self.fire_actor_rows(ActorEvent::ShouldDamage, target, &args, &mut reducer);
        match reducer {
            Reducer::Force(verdict) => verdict,
            _ => Verdict::None,
        }
    }

    pub fn fire_actor_damage(
        &self,
        target: ActorHandle,
        inflictor: Option<ActorHandle>,
        source: Option<ActorHandle>,
        damage: i32,
    ) -> bool {
        let args = [
            self.push_actor_arg(Some(target)),
            self.push_actor_arg(inflictor),
            self.push_actor_arg(source),
            Value::Integer(i64::from(damage)),
        ];
        let mut reducer = Reducer::Or(false);
        self.fire_actor_rows(ActorEvent::Damage, target, &args, &mut reducer);
        matches!(reducer, Reducer::Or(true))
    }

    pub fn fire_actor_death(
        &self,
        target: ActorHandle,
        inflictor: Option<ActorHandle>,
        source: Option<ActorHandle>,
    ) -> bool {
        let args = [
            self.push_actor_arg(Some(target)),
            self.push_actor_arg(inflictor),
            self.push_actor_arg(source),
        ];
        let mut reducer = Reducer::Or(false);
        self.fire_actor_rows(ActorEvent::Death, target, &args, &mut reducer);
        matches!(reducer, Reducer::Or(true))
    }

    /// String-keyed dispatch: unqualified bucket first, then the exact
    /// key's bucket. The key is matched verbatim; whoever fires is
    /// responsible for having stored it canonically. Returns whether
    /// any callback ran.
    fn fire_string_buckets<'lua>(
        &'lua self,
        event: StringEvent,
        key: &str,
        args: &[Value<'lua>],
    ) -> Result<bool, HookError> {
        if args.len() > MAX_DISPATCH_ARGS {
            let err = HookError::TooManyArguments {
                event: event.name(),
                count: args.len(),
                limit: MAX_DISPATCH_ARGS,
            };
            eprintln!("[ember_script] warning: {err}");
            return Err(err);
        }
        let (unqualified, keyed) = self.hooks.borrow().string_lists(event, key);
        let mut invoked = 0;
        let mut reducer = Reducer::Ignore;
        invoked += self.invoke_list(event.name(), &unqualified, args, &mut reducer, false);
        invoked += self.invoke_list(event.name(), &keyed, args, &mut reducer, false);
        Ok(invoked > 0)
    }

    /// Bot AI dispatch keyed by skin name (lower-case convention).
    pub fn fire_bot_think(&self, skin: &str, slot: u8) -> Result<bool, HookError> {
        let args = [Value::Integer(i64::from(slot)), self.lua_string(skin)];
        self.fire_string_buckets(StringEvent::BotThink, skin, &args)
    }

    /// Trigger execution keyed by tag (upper-case convention). Extra
    /// values are passed through to the callbacks after the line and
    /// actor arguments.
    pub fn fire_trigger<'lua>(
        &'lua self,
        tag: &str,
        line: Option<u16>,
        actor: Option<ActorHandle>,
        extra: &[Value<'lua>],
    ) -> Result<bool, HookError> {
        let mut args = Vec::with_capacity(2 + extra.len());
        args.push(match line {
            Some(index) => match push_line_value(self.lua(), &self.world, index) {
                Ok(value) => value,
                Err(err) => {
                    eprintln!("[ember_script] warning: failed to push line handle: {err}");
                    Value::Nil
                }
            },
            None => Value::Nil,
        });
        args.push(self.push_actor_arg(actor));
        args.extend(extra.iter().cloned());
        self.fire_string_buckets(StringEvent::TriggerExecute, tag, &args)
    }

    /// HUD dispatch sits outside the protected/aggregated model: the
    /// drawer is pushed once per callback and the first error aborts
    /// the layer pass and propagates.
    pub fn fire_hud<'lua>(&'lua self, layer: HudLayer, drawer: Value<'lua>) -> LuaResult<()> {
        let ids = self.hooks.borrow().hud_list(layer);
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = HudGuard::engage(Rc::clone(&self.hud_running));
        for id in ids {
            let callback = self.pinned_callback(id)?;
            callback.call::<_, ()>(drawer.clone())?;
        }
        Ok(())
    }

    /// NetVars dispatch used by the archival engine; the archiver
    /// closure carries the in-progress dedup state.
    pub(crate) fn dispatch_net_vars<'lua>(&'lua self, archiver: Function<'lua>) {
        let ids = self.generic_snapshot(GenericEvent::NetVars);
        self.invoke_list(
            GenericEvent::NetVars.name(),
            &ids,
            &[Value::Function(archiver)],
            &mut Reducer::Ignore,
            false,
        );
    }

    pub fn set_profiling(&self, enabled: bool) {
        self.profiling.set(enabled);
        if !enabled {
            self.samples.borrow_mut().clear();
        }
    }

    /// Drains the samples recorded by profiled frame dispatches.
    pub fn take_profile(&self) -> Vec<HookSample> {
        std::mem::take(&mut self.samples.borrow_mut())
    }
}
