//! Minimal native-side world the scripting core dispatches over.
//!
//! The simulation proper lives elsewhere; this module models just the
//! surfaces the core's interfaces need: fixed player slots, an actor
//! arena with stable ids assigned in spawn order, and positional
//! geometry arrays scoped to the current level.

/// Handle to one arena slot. A handle whose generation no longer
/// matches the slot is stale and reports itself invalid; no explicit
/// invalidation callback is needed beyond despawning the actor once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ActorHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub kind: u16,
    /// Spawn-order identity; stable across save/load and across
    /// independently-running clients, unlike slot indices.
    pub stable_id: u32,
    pub health: i32,
    pub fuse: i32,
}

#[derive(Debug, Clone)]
pub struct Player {
    pub skin: String,
}

#[derive(Debug, Clone, Default)]
pub struct LineDef {
    /// Trigger tag fired through the string-keyed hook bucket.
    pub trigger: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Sector {
    pub tag: i32,
}

#[derive(Debug, Clone, Default)]
pub struct SideDef {
    pub texture: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Vertex {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug)]
struct ActorSlot {
    generation: u32,
    actor: Option<Actor>,
}

#[derive(Debug)]
pub struct World {
    players: Vec<Option<Player>>,
    slots: Vec<ActorSlot>,
    /// Slot indices in spawn order; this is the live-object traversal
    /// order the archival engine depends on.
    order: Vec<u32>,
    next_stable_id: u32,
    lines: Vec<LineDef>,
    sectors: Vec<Sector>,
    sides: Vec<SideDef>,
    vertices: Vec<Vertex>,
}

impl World {
    pub fn new(player_slots: usize) -> Self {
        World {
            players: (0..player_slots.max(1)).map(|_| None).collect(),
            slots: Vec::new(),
            order: Vec::new(),
            next_stable_id: 1,
            lines: Vec::new(),
            sectors: Vec::new(),
            sides: Vec::new(),
            vertices: Vec::new(),
        }
    }

    pub fn player_slot_count(&self) -> usize {
        self.players.len()
    }

    pub fn player(&self, slot: usize) -> Option<&Player> {
        self.players.get(slot).and_then(Option::as_ref)
    }

    pub fn player_occupied(&self, slot: usize) -> bool {
        self.player(slot).is_some()
    }

    pub(crate) fn join_player(&mut self, slot: usize, skin: &str) -> bool {
        match self.players.get_mut(slot) {
            Some(entry) => {
                *entry = Some(Player {
                    skin: skin.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub(crate) fn leave_player(&mut self, slot: usize) -> bool {
        match self.players.get_mut(slot) {
            Some(entry) => entry.take().is_some(),
            None => false,
        }
    }

    pub(crate) fn spawn(&mut self, kind: u16) -> ActorHandle {
        let stable_id = self.next_stable_id;
        self.next_stable_id += 1;
        let actor = Actor {
            kind,
            stable_id,
            health: 1,
            fuse: 0,
        };
        // First free slot keeps reuse deterministic across clients.
        let index = match self
            .slots
            .iter()
            .position(|slot| slot.actor.is_none())
        {
            Some(free) => {
                self.slots[free].actor = Some(actor);
                free as u32
            }
            None => {
                self.slots.push(ActorSlot {
                    generation: 0,
                    actor: Some(actor),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.order.push(index);
        ActorHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    pub(crate) fn despawn(&mut self, handle: ActorHandle) -> Option<Actor> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let actor = slot.actor.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.order.retain(|index| *index != handle.index);
        Some(actor)
    }

    pub fn is_live(&self, handle: ActorHandle) -> bool {
        self.actor(handle).is_some()
    }

    pub fn actor(&self, handle: ActorHandle) -> Option<&Actor> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.actor.as_ref()
    }

    pub fn actor_mut(&mut self, handle: ActorHandle) -> Option<&mut Actor> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.actor.as_mut()
    }

    /// Live actors in spawn order.
    pub fn live_actors(&self) -> impl Iterator<Item = (ActorHandle, &Actor)> {
        self.order.iter().filter_map(|index| {
            let slot = &self.slots[*index as usize];
            slot.actor.as_ref().map(|actor| {
                (
                    ActorHandle {
                        index: *index,
                        generation: slot.generation,
                    },
                    actor,
                )
            })
        })
    }

    /// Searches live actors for a stable id. Reconstruction may happen
    /// in a different slot order than the original run, so the archive
    /// reader must never assume positional correspondence.
    pub fn find_by_stable_id(&self, stable_id: u32) -> Option<ActorHandle> {
        self.live_actors()
            .find(|(_, actor)| actor.stable_id == stable_id)
            .map(|(handle, _)| handle)
    }

    pub fn add_line(&mut self, trigger: Option<&str>) -> u16 {
        self.lines.push(LineDef {
            trigger: trigger.map(str::to_string),
        });
        (self.lines.len() - 1) as u16
    }

    pub fn add_sector(&mut self, tag: i32) -> u16 {
        self.sectors.push(Sector { tag });
        (self.sectors.len() - 1) as u16
    }

    pub fn add_side(&mut self, texture: &str) -> u16 {
        self.sides.push(SideDef {
            texture: texture.to_string(),
        });
        (self.sides.len() - 1) as u16
    }

    pub fn add_vertex(&mut self, x: f32, y: f32) -> u16 {
        self.vertices.push(Vertex { x, y });
        (self.vertices.len() - 1) as u16
    }

    pub fn line(&self, index: u16) -> Option<&LineDef> {
        self.lines.get(index as usize)
    }

    pub fn sector(&self, index: u16) -> Option<&Sector> {
        self.sectors.get(index as usize)
    }

    pub fn side(&self, index: u16) -> Option<&SideDef> {
        self.sides.get(index as usize)
    }

    pub fn vertex(&self, index: u16) -> Option<&Vertex> {
        self.vertices.get(index as usize)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn side_count(&self) -> usize {
        self.sides.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Drops all level-scoped state: actors (their handles go stale
    /// through the generation bump) and geometry. Player slots survive.
    pub(crate) fn clear_level(&mut self) {
        for slot in &mut self.slots {
            if slot.actor.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.order.clear();
        self.lines.clear();
        self.sectors.clear();
        self.sides.clear();
        self.vertices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::World;

    #[test]
    fn stale_generations_invalidate_handles() {
        let mut world = World::new(2);
        let first = world.spawn(7);
        assert!(world.is_live(first));
        world.despawn(first).expect("despawn");
        assert!(!world.is_live(first));

        // The slot is reused; the old handle must stay invalid.
        let second = world.spawn(9);
        assert_eq!(second.index, first.index);
        assert!(!world.is_live(first));
        assert!(world.is_live(second));
    }

    #[test]
    fn traversal_follows_spawn_order_across_slot_reuse() {
        let mut world = World::new(2);
        let a = world.spawn(1);
        let b = world.spawn(2);
        let _c = world.spawn(3);
        world.despawn(b).expect("despawn b");
        let d = world.spawn(4);
        assert_eq!(d.index, b.index);

        let kinds: Vec<u16> = world.live_actors().map(|(_, actor)| actor.kind).collect();
        assert_eq!(kinds, vec![1, 3, 4]);
        assert!(world.is_live(a));
    }

    #[test]
    fn stable_ids_survive_slot_reuse() {
        let mut world = World::new(2);
        let a = world.spawn(1);
        let a_id = world.actor(a).expect("actor").stable_id;
        world.despawn(a).expect("despawn");
        let b = world.spawn(1);
        let b_id = world.actor(b).expect("actor").stable_id;
        assert_ne!(a_id, b_id);
        assert_eq!(world.find_by_stable_id(b_id), Some(b));
        assert_eq!(world.find_by_stable_id(a_id), None);
    }
}
