//! Hook registry: event identity to ordered callback lists.
//!
//! Callbacks stay pinned inside the Lua registry; this module only
//! stores their keys plus the per-event lists of callback ids.
//! Registration always appends. Two registrations of the same function
//! mean two calls at dispatch, in registration order.

use std::collections::BTreeMap;

use mlua::RegistryKey;
use thiserror::Error;

use crate::events::{ActorEvent, GenericEvent, HudLayer, StringEvent};

/// Index of one pinned callback. Allocated monotonically; never reused
/// or freed for the lifetime of the session.
pub type CallbackId = u32;

/// A registration name resolved to its enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRef {
    Generic(GenericEvent),
    Actor(ActorEvent),
    String(StringEvent),
}

/// Narrows which hooks a registration applies to beyond the event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discriminator {
    None,
    ActorKind(u16),
    /// Already canonicalized with the event's casing convention.
    Key(String),
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0:?} does not name a registrable hook")]
    UnknownHook(String),
    #[error("actor kind {kind} is out of range for {event} hooks (limit {limit})")]
    KindOutOfRange {
        event: &'static str,
        kind: i64,
        limit: u16,
    },
    #[error("{event} hooks take a string key")]
    KeyExpected { event: &'static str },
    #[error("{event} hooks take an actor kind")]
    KindExpected { event: &'static str },
    #[error("hooks cannot be registered while a HUD layer is drawing")]
    HudRunning,
    #[error("{event} dispatch would marshal {count} values (limit {limit})")]
    TooManyArguments {
        event: &'static str,
        count: usize,
        limit: usize,
    },
}

/// Resolves a registration name. String-keyed events are checked first
/// (their names carry contextual data), then the actor matrix, then the
/// generic list. The precedence is fixed.
pub fn resolve_event_name(name: &str) -> Option<EventRef> {
    if let Some(event) = StringEvent::from_name(name) {
        return Some(EventRef::String(event));
    }
    if let Some(event) = ActorEvent::from_name(name) {
        return Some(EventRef::Actor(event));
    }
    GenericEvent::from_name(name).map(EventRef::Generic)
}

#[derive(Debug, Default)]
struct ActorRow {
    /// The distinguished "any kind" row; dispatched before the
    /// kind-specific list for every firing.
    any: Vec<CallbackId>,
    by_kind: BTreeMap<u16, Vec<CallbackId>>,
}

#[derive(Debug, Default)]
struct StringBucket {
    /// Callbacks that fire for every key under this event.
    unqualified: Vec<CallbackId>,
    keyed: BTreeMap<String, Vec<CallbackId>>,
}

#[derive(Debug)]
pub(crate) struct HookRegistry {
    pinned: Vec<RegistryKey>,
    generic: Vec<Vec<CallbackId>>,
    actor: Vec<ActorRow>,
    string: Vec<StringBucket>,
    hud: Vec<Vec<CallbackId>>,
    actor_kind_limit: u16,
}

impl HookRegistry {
    pub(crate) fn new(actor_kind_limit: u16) -> Self {
        HookRegistry {
            pinned: Vec::new(),
            generic: (0..GenericEvent::COUNT).map(|_| Vec::new()).collect(),
            actor: (0..ActorEvent::COUNT).map(|_| ActorRow::default()).collect(),
            string: (0..StringEvent::COUNT)
                .map(|_| StringBucket::default())
                .collect(),
            hud: (0..HudLayer::COUNT).map(|_| Vec::new()).collect(),
            actor_kind_limit,
        }
    }

    pub(crate) fn actor_kind_limit(&self) -> u16 {
        self.actor_kind_limit
    }

    /// Appends a callback under the resolved event. On success the
    /// pinned reference is owned by the registry until session teardown.
    pub(crate) fn add(
        &mut self,
        event: EventRef,
        discriminator: Discriminator,
        pinned: RegistryKey,
    ) -> Result<CallbackId, HookError> {
        let id = self.pinned.len() as CallbackId;
        let list = match (event, discriminator) {
            (EventRef::Generic(event), _) => &mut self.generic[event as usize],
            (EventRef::Actor(event), Discriminator::None) => &mut self.actor[event as usize].any,
            (EventRef::Actor(event), Discriminator::ActorKind(kind)) => {
                if kind >= self.actor_kind_limit {
                    return Err(HookError::KindOutOfRange {
                        event: event.name(),
                        kind: i64::from(kind),
                        limit: self.actor_kind_limit,
                    });
                }
                self.actor[event as usize].by_kind.entry(kind).or_default()
            }
            (EventRef::Actor(event), Discriminator::Key(_)) => {
                return Err(HookError::KindExpected { event: event.name() })
            }
            (EventRef::String(event), Discriminator::None) => {
                &mut self.string[event as usize].unqualified
            }
            (EventRef::String(event), Discriminator::Key(key)) => self.string[event as usize]
                .keyed
                .entry(key)
                .or_default(),
            (EventRef::String(event), Discriminator::ActorKind(_)) => {
                return Err(HookError::KeyExpected { event: event.name() })
            }
        };
        list.push(id);
        self.pinned.push(pinned);
        Ok(id)
    }

    pub(crate) fn add_hud(&mut self, layer: HudLayer, pinned: RegistryKey) -> CallbackId {
        let id = self.pinned.len() as CallbackId;
        self.hud[layer as usize].push(id);
        self.pinned.push(pinned);
        id
    }

    pub(crate) fn pinned(&self, id: CallbackId) -> &RegistryKey {
        &self.pinned[id as usize]
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.pinned.len()
    }

    /// Snapshot of the generic list, in registration order.
    pub(crate) fn generic_list(&self, event: GenericEvent) -> Vec<CallbackId> {
        self.generic[event as usize].clone()
    }

    /// Snapshots of the "any kind" row and the kind-specific row, in
    /// that dispatch order.
    pub(crate) fn actor_lists(
        &self,
        event: ActorEvent,
        kind: u16,
    ) -> (Vec<CallbackId>, Vec<CallbackId>) {
        let row = &self.actor[event as usize];
        let keyed = row.by_kind.get(&kind).cloned().unwrap_or_default();
        (row.any.clone(), keyed)
    }

    /// Snapshots of the unqualified bucket and the exact-key bucket.
    /// The key is matched verbatim; canonicalization happened at
    /// registration.
    pub(crate) fn string_lists(
        &self,
        event: StringEvent,
        key: &str,
    ) -> (Vec<CallbackId>, Vec<CallbackId>) {
        let bucket = &self.string[event as usize];
        let keyed = bucket.keyed.get(key).cloned().unwrap_or_default();
        (bucket.unqualified.clone(), keyed)
    }

    pub(crate) fn hud_list(&self, layer: HudLayer) -> Vec<CallbackId> {
        self.hud[layer as usize].clone()
    }

    pub(crate) fn generic_count(&self, event: GenericEvent) -> usize {
        self.generic[event as usize].len()
    }

    pub(crate) fn actor_count(&self, event: ActorEvent) -> usize {
        let row = &self.actor[event as usize];
        row.any.len() + row.by_kind.values().map(Vec::len).sum::<usize>()
    }

    pub(crate) fn string_count(&self, event: StringEvent) -> usize {
        let bucket = &self.string[event as usize];
        bucket.unqualified.len() + bucket.keyed.values().map(Vec::len).sum::<usize>()
    }

    pub(crate) fn hud_count(&self, layer: HudLayer) -> usize {
        self.hud[layer as usize].len()
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve_event_name, Discriminator, EventRef, HookError, HookRegistry};
    use crate::events::{ActorEvent, GenericEvent, StringEvent};
    use mlua::Lua;

    fn pin(lua: &Lua) -> mlua::RegistryKey {
        lua.create_registry_value(lua.create_table().expect("table"))
            .expect("registry value")
    }

    #[test]
    fn resolution_prefers_string_hooks_over_the_rest() {
        assert_eq!(
            resolve_event_name("BotThink"),
            Some(EventRef::String(StringEvent::BotThink))
        );
        assert_eq!(
            resolve_event_name("ActorSpawn"),
            Some(EventRef::Actor(ActorEvent::Spawn))
        );
        assert_eq!(
            resolve_event_name("ThinkFrame"),
            Some(EventRef::Generic(GenericEvent::ThinkFrame))
        );
        assert_eq!(resolve_event_name("NotAnEvent"), None);
    }

    #[test]
    fn registration_appends_without_deduplication() {
        let lua = Lua::new();
        let mut registry = HookRegistry::new(8);
        let first = registry
            .add(
                EventRef::Generic(GenericEvent::ThinkFrame),
                Discriminator::None,
                pin(&lua),
            )
            .expect("first registration");
        let second = registry
            .add(
                EventRef::Generic(GenericEvent::ThinkFrame),
                Discriminator::None,
                pin(&lua),
            )
            .expect("second registration");
        assert_eq!(
            registry.generic_list(GenericEvent::ThinkFrame),
            vec![first, second]
        );
    }

    #[test]
    fn actor_kind_limit_is_enforced() {
        let lua = Lua::new();
        let mut registry = HookRegistry::new(4);
        let err = registry
            .add(
                EventRef::Actor(ActorEvent::Think),
                Discriminator::ActorKind(4),
                pin(&lua),
            )
            .expect_err("kind 4 should be out of range");
        assert!(matches!(err, HookError::KindOutOfRange { kind: 4, .. }));
    }

    #[test]
    fn string_buckets_keep_unqualified_and_keyed_lists_apart() {
        let lua = Lua::new();
        let mut registry = HookRegistry::new(4);
        let unqualified = registry
            .add(
                EventRef::String(StringEvent::TriggerExecute),
                Discriminator::None,
                pin(&lua),
            )
            .expect("unqualified");
        let keyed = registry
            .add(
                EventRef::String(StringEvent::TriggerExecute),
                Discriminator::Key("FOX".to_string()),
                pin(&lua),
            )
            .expect("keyed");
        let (any, fox) = registry.string_lists(StringEvent::TriggerExecute, "FOX");
        assert_eq!(any, vec![unqualified]);
        assert_eq!(fox, vec![keyed]);
        let (any, wolf) = registry.string_lists(StringEvent::TriggerExecute, "WOLF");
        assert_eq!(any, vec![unqualified]);
        assert!(wolf.is_empty());
    }
}
