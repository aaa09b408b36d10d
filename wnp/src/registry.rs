// The player registry: a fixed-capacity table of player records mutated only
// inside update cycles.
//
// `Registry::begin` locks the table and returns an `UpdateCycle` guard. The
// guard is the only way to add, update or remove records, so mutation outside
// a cycle cannot be written. A cycle sees a point-in-time `snapshot()` taken
// at `begin`, plus the live table through `players()`/`player()`.
//
// A live record's id is its slot index. Each record owns an opaque adapter
// payload (`Arc<dyn Any + Send + Sync>`); the registry drops its reference
// when the record is removed, which is how adapter resources get freed.
//
// Ending a cycle (explicitly or by dropping the guard):
// 1. Recomputes the active player (`selector::select_active`) while the
//    table lock is still held. Lock order is always table, then active.
// 2. Captures value snapshots of everything that needs a callback.
// 3. Releases the locks.
// 4. Delivers callbacks: added, then updated (a record added in the same
//    cycle is reported only as added), then removed, then active-changed if
//    the active id moved.
//
// Callbacks therefore run without any registry lock held and may call back
// into the read API or begin a new cycle. They receive clones, so a callback
// can observe an older value than the table currently holds.
//
// Timestamps: `created_at`/`updated_at` left at 0 by the adapter are stamped
// on add, `updated_at` is stamped on update unless the adapter moved it, and
// `active_at` is stamped when play begins or the title goes from empty to
// non-empty, unless the adapter set `active_at` itself.
//
// See also: `dispatch.rs`, which owns the registry alongside the event store,
// `web.rs` for the main producer of cycles.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::player::{MAX_PLAYERS, PlaybackState, Platform, Player, PlayerId, now_millis};
use crate::selector::select_active;

/// Adapter-private data attached to a player record.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Receives registry notifications. All methods default to no-ops.
///
/// Called from whichever thread ended the update cycle, never with a
/// registry lock held.
pub trait Listener: Send + Sync {
    fn on_player_added(&self, _player: &Player) {}
    fn on_player_updated(&self, _player: &Player) {}
    fn on_player_removed(&self, _player: &Player) {}
    /// `None` means there is no active player any more.
    fn on_active_player_changed(&self, _player: Option<&Player>) {}
}

struct Entry {
    player: Player,
    payload: Payload,
}

type Table = Vec<Option<Entry>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn live_players(table: &Table) -> impl Iterator<Item = &Player> + Clone {
    table.iter().flatten().map(|e| &e.player)
}

pub struct Registry {
    table: Mutex<Table>,
    active: Mutex<Option<PlayerId>>,
    listener: Option<Arc<dyn Listener>>,
}

impl Registry {
    pub fn new(listener: Option<Arc<dyn Listener>>) -> Self {
        Self::with_capacity(MAX_PLAYERS, listener)
    }

    pub fn with_capacity(capacity: usize, listener: Option<Arc<dyn Listener>>) -> Self {
        let mut table = Vec::with_capacity(capacity);
        table.resize_with(capacity, || None);
        Self {
            table: Mutex::new(table),
            active: Mutex::new(None),
            listener,
        }
    }

    pub fn capacity(&self) -> usize {
        lock(&self.table).len()
    }

    /// Open an update cycle. Blocks while another cycle is open.
    pub fn begin(&self) -> UpdateCycle<'_> {
        let table = lock(&self.table);
        let snapshot = live_players(&table).cloned().collect();
        UpdateCycle {
            registry: self,
            table: Some(table),
            snapshot,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn player(&self, id: PlayerId) -> Option<Player> {
        let table = lock(&self.table);
        table.get(id.0)?.as_ref().map(|e| e.player.clone())
    }

    pub fn active_player_id(&self) -> Option<PlayerId> {
        *lock(&self.active)
    }

    pub fn active_player(&self) -> Option<Player> {
        let table = lock(&self.table);
        let id = (*lock(&self.active))?;
        table.get(id.0)?.as_ref().map(|e| e.player.clone())
    }

    /// Every live player, in slot order.
    pub fn players(&self) -> Vec<Player> {
        live_players(&lock(&self.table)).cloned().collect()
    }

    pub fn players_on(&self, platform: Platform) -> Vec<Player> {
        live_players(&lock(&self.table))
            .filter(|p| p.platform == platform)
            .cloned()
            .collect()
    }

    /// The payload of a live player, if it has type `T`.
    pub fn payload<T: Any + Send + Sync>(&self, id: PlayerId) -> Option<Arc<T>> {
        payload_in(&lock(&self.table), id)
    }

    /// A live player together with its untyped payload, read atomically.
    pub fn entry(&self, id: PlayerId) -> Option<(Player, Payload)> {
        let table = lock(&self.table);
        let entry = table.get(id.0)?.as_ref()?;
        Some((entry.player.clone(), Arc::clone(&entry.payload)))
    }
}

fn payload_in<T: Any + Send + Sync>(table: &Table, id: PlayerId) -> Option<Arc<T>> {
    let entry = table.get(id.0)?.as_ref()?;
    Arc::clone(&entry.payload).downcast::<T>().ok()
}

/// An open update cycle. Holds the table lock until ended or dropped.
pub struct UpdateCycle<'a> {
    registry: &'a Registry,
    table: Option<MutexGuard<'a, Table>>,
    snapshot: Vec<Player>,
    added: Vec<PlayerId>,
    updated: Vec<PlayerId>,
    removed: Vec<Player>,
}

impl UpdateCycle<'_> {
    fn table(&self) -> &Table {
        // Only `finish` takes the guard, and it runs at most once, from
        // `Drop`; nothing else can observe the cycle afterwards.
        match &self.table {
            Some(table) => table,
            None => unreachable!("update cycle used after it ended"),
        }
    }

    fn table_mut(&mut self) -> &mut Table {
        match &mut self.table {
            Some(table) => table,
            None => unreachable!("update cycle used after it ended"),
        }
    }

    /// Live players as they were when the cycle began.
    pub fn snapshot(&self) -> &[Player] {
        &self.snapshot
    }

    /// Live players as they are now, including this cycle's changes.
    pub fn players(&self) -> Vec<Player> {
        live_players(self.table()).cloned().collect()
    }

    pub fn player(&self, id: PlayerId) -> Option<Player> {
        self.table().get(id.0)?.as_ref().map(|e| e.player.clone())
    }

    pub fn payload<T: Any + Send + Sync>(&self, id: PlayerId) -> Option<Arc<T>> {
        payload_in(self.table(), id)
    }

    /// Live players whose payload has type `T`.
    pub fn payloads<T: Any + Send + Sync>(&self) -> Vec<(PlayerId, Arc<T>)> {
        self.table()
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                let entry = entry.as_ref()?;
                let payload = Arc::clone(&entry.payload).downcast::<T>().ok()?;
                Some((PlayerId(slot), payload))
            })
            .collect()
    }

    /// Store `player` in the first free slot and return its id.
    pub fn add(&mut self, mut player: Player, payload: Payload) -> Result<PlayerId, RegistryError> {
        let table = self.table_mut();
        let Some(slot) = table.iter().position(Option::is_none) else {
            let capacity = table.len();
            warn!(capacity, name = %player.name, "player table full");
            return Err(RegistryError::Full { capacity });
        };

        let id = PlayerId(slot);
        let now = now_millis();
        player.id = Some(id);
        player.normalize();
        if player.created_at == 0 {
            player.created_at = now;
        }
        if player.updated_at == 0 {
            player.updated_at = now;
        }
        stamp_active(&Player::default(), &mut player, now);

        debug!(player = %id, name = %player.name, platform = %player.platform, "player added");
        table[slot] = Some(Entry { player, payload });
        self.added.push(id);
        Ok(id)
    }

    /// Overwrite the live record `player.id`. Returns false if the id is
    /// missing or not live.
    pub fn update(&mut self, mut player: Player) -> bool {
        let Some(id) = player.id else {
            return false;
        };
        let table = self.table_mut();
        let Some(Some(entry)) = table.get_mut(id.0) else {
            return false;
        };

        let now = now_millis();
        player.normalize();
        if player.updated_at == entry.player.updated_at {
            player.updated_at = now;
        }
        stamp_active(&entry.player, &mut player, now);
        entry.player = player;

        if !self.updated.contains(&id) {
            self.updated.push(id);
        }
        true
    }

    /// Free the slot of a live player, dropping its payload.
    pub fn remove(&mut self, id: PlayerId) -> bool {
        let table = self.table_mut();
        let Some(entry) = table.get_mut(id.0).and_then(Option::take) else {
            return false;
        };
        debug!(player = %id, name = %entry.player.name, "player removed");

        self.updated.retain(|&u| u != id);
        if let Some(pos) = self.added.iter().position(|&a| a == id) {
            // Added and removed within one cycle: nobody ever saw it.
            self.added.remove(pos);
        } else {
            self.removed.push(entry.player);
        }
        true
    }

    /// End the cycle and deliver callbacks. Equivalent to dropping the guard.
    pub fn end(self) {}

    fn finish(&mut self) {
        let Some(table) = self.table.take() else {
            return;
        };
        let registry = self.registry;

        let new_active = select_active(live_players(&table));
        let active_change = {
            let mut active = lock(&registry.active);
            if *active == new_active {
                None
            } else {
                debug!(from = ?*active, to = ?new_active, "active player changed");
                *active = new_active;
                Some(new_active.and_then(|id| table[id.0].as_ref().map(|e| e.player.clone())))
            }
        };

        let Some(listener) = registry.listener.clone() else {
            return;
        };

        let snapshot_of = |id: &PlayerId| table.get(id.0)?.as_ref().map(|e| e.player.clone());
        let added: Vec<Player> = self.added.iter().filter_map(snapshot_of).collect();
        let updated: Vec<Player> = self
            .updated
            .iter()
            .filter(|id| !self.added.contains(*id))
            .filter_map(snapshot_of)
            .collect();
        let removed = std::mem::take(&mut self.removed);
        drop(table);

        for player in &added {
            listener.on_player_added(player);
        }
        for player in &updated {
            listener.on_player_updated(player);
        }
        for player in &removed {
            listener.on_player_removed(player);
        }
        if let Some(active) = active_change {
            listener.on_active_player_changed(active.as_ref());
        }
    }
}

impl Drop for UpdateCycle<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn stamp_active(old: &Player, new: &mut Player, now: u64) {
    if new.active_at != old.active_at {
        return;
    }
    let began_playing = new.state == PlaybackState::Playing && old.state != PlaybackState::Playing;
    let gained_title = old.title.is_empty() && !new.title.is_empty();
    if began_playing || gained_title {
        new.active_at = now;
    }
}
