//! Event identities for the hook system.
//!
//! Four disjoint enumerations cover the ways the simulation addresses
//! hooks: plain event id, event id crossed with an actor kind, one HUD
//! layer, and event id crossed with a runtime string key. Each enum is
//! expanded from an ordered name list; the ordinal is the in-process
//! identity and is never persisted.

macro_rules! define_events {
    (
        $(#[$outer:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $label:literal,)+
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        $vis enum $name {
            $($variant,)+
        }

        impl $name {
            /// Canonical names, in enumeration order.
            $vis const NAMES: &'static [&'static str] = &[$($label,)+];

            /// Every member, in enumeration order.
            $vis const ALL: &'static [$name] = &[$(Self::$variant,)+];

            $vis const COUNT: usize = Self::NAMES.len();

            $vis fn name(self) -> &'static str {
                Self::NAMES[self as usize]
            }

            $vis fn from_name(name: &str) -> Option<Self> {
                $(
                    if name == $label {
                        return Some(Self::$variant);
                    }
                )+
                None
            }
        }
    };
}

define_events! {
    /// Events addressed purely by id.
    pub enum GenericEvent {
        NetVars => "NetVars",
        MapChange => "MapChange",
        MapLoad => "MapLoad",
        PlayerJoin => "PlayerJoin",
        PreThinkFrame => "PreThinkFrame",
        ThinkFrame => "ThinkFrame",
        PostThinkFrame => "PostThinkFrame",
        PlayerMsg => "PlayerMsg",
        TeamSwitch => "TeamSwitch",
        ScoreAward => "ScoreAward",
        MusicChange => "MusicChange",
        GameQuit => "GameQuit",
    }
}

define_events! {
    /// Events dispatched through the actor-kind matrix. Every firing
    /// walks the "any kind" row before the kind-specific one.
    pub enum ActorEvent {
        Spawn => "ActorSpawn",
        Collide => "ActorCollide",
        MoveCollide => "ActorMoveCollide",
        Touch => "ActorTouch",
        Fuse => "ActorFuse",
        Think => "ActorThink",
        BossThink => "BossThink",
        ShouldDamage => "ShouldDamage",
        Damage => "ActorDamage",
        Death => "ActorDeath",
        BossDeath => "BossDeath",
        Removed => "ActorRemoved",
    }
}

define_events! {
    /// HUD layers. These register through `hud.add`, not `addHook`, and
    /// dispatch outside the protected/aggregated model.
    pub enum HudLayer {
        Game => "game",
        Scores => "scores",
        Title => "title",
        Intermission => "intermission",
    }
}

define_events! {
    /// Events keyed by an arbitrary runtime string.
    pub enum StringEvent {
        BotThink => "BotThink",
        TriggerExecute => "TriggerExecute",
    }
}

/// Casing convention applied to a string hook's key at registration.
/// Keys are canonicalized exactly once; dispatch matches them verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCasing {
    Lower,
    Upper,
}

impl StringEvent {
    pub fn casing(self) -> KeyCasing {
        match self {
            StringEvent::BotThink => KeyCasing::Lower,
            StringEvent::TriggerExecute => KeyCasing::Upper,
        }
    }

    pub fn canonical_key(self, raw: &str) -> String {
        match self.casing() {
            KeyCasing::Lower => raw.to_ascii_lowercase(),
            KeyCasing::Upper => raw.to_ascii_uppercase(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ActorEvent, GenericEvent, HudLayer, StringEvent};

    #[test]
    fn names_round_trip_in_enumeration_order() {
        for (index, event) in GenericEvent::ALL.iter().enumerate() {
            assert_eq!(*event as usize, index);
            assert_eq!(GenericEvent::from_name(event.name()), Some(*event));
        }
        for event in ActorEvent::ALL {
            assert_eq!(ActorEvent::from_name(event.name()), Some(*event));
        }
        for layer in HudLayer::ALL {
            assert_eq!(HudLayer::from_name(layer.name()), Some(*layer));
        }
    }

    #[test]
    fn lookup_is_case_sensitive() {
        assert_eq!(GenericEvent::from_name("thinkframe"), None);
        assert_eq!(GenericEvent::from_name("ThinkFrame"), Some(GenericEvent::ThinkFrame));
    }

    #[test]
    fn string_keys_canonicalize_per_event() {
        assert_eq!(StringEvent::BotThink.canonical_key("Fox"), "fox");
        assert_eq!(StringEvent::TriggerExecute.canonical_key("fox"), "FOX");
    }
}
