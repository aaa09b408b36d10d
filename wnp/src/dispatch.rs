// The shared core: player registry, event result store, the platform
// adapters, and the dispatcher that routes control actions between them.
//
// `Core` is created by `WebNowPlaying` and shared as `Arc<Core>`. Adapters
// get a reference in `Adapter::init` and keep a `Weak` back to it; the core
// holds the adapters strongly.
//
// Dispatch (`execute`):
// 1. The player must be live and the action permitted by its capability
//    flags, and an adapter for its platform must be registered. Otherwise an
//    already-failed event id is returned and nothing is sent.
// 2. A fresh event id is issued (pending).
// 3. For actions that set a field, the previous and new values are
//    recorded as an optimistic change.
// 4. The owning adapter's `on_event` runs on the caller's thread.
// 5. Unless the event has already failed, the new value is applied to the
//    record in an update cycle, firing `on_player_updated`.
//
// Resolution (`resolve_event`) may come from any thread, before or after
// step 5. A failure reverts the optimistic change, but only if the field
// still holds the value the dispatcher applied and the slot still belongs to
// the same player (matched by `created_at`); a newer report from the
// adapter always wins over a revert. The check and the revert both run
// inside update cycles, so they serialize with step 5.
//
// See also: `control.rs` for the per-action `try_*` API built on `execute`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::InitError;
use crate::events::{EventId, EventKind, EventResult, EventStore};
use crate::player::{PlaybackState, Platform, Player, PlayerId, Repeat};
use crate::registry::{Listener, Payload, Registry};

/// A source of players for one platform.
///
/// `on_event` is called on the thread that requested the action. The adapter
/// must eventually resolve `event_id` through `Core::resolve_event`, or the
/// caller's wait times out.
pub trait Adapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Start producing players. Called once, before any `on_event`.
    fn init(&self, core: &Arc<Core>) -> Result<(), InitError>;

    /// Stop producing players and release resources. Players still in the
    /// registry are removed by the caller afterwards.
    fn uninit(&self);

    fn on_event(
        &self,
        player: &Player,
        payload: &Payload,
        kind: EventKind,
        event_id: EventId,
        data: i64,
    );
}

/// An optimistic change awaiting its event result.
#[derive(Clone, Copy, Debug)]
struct Optimistic {
    player: PlayerId,
    created_at: u64,
    kind: EventKind,
    previous: i64,
    applied: i64,
}

pub struct Core {
    registry: Registry,
    events: EventStore,
    adapters: RwLock<Vec<Arc<dyn Adapter>>>,
    optimistic: Mutex<HashMap<EventId, Optimistic>>,
}

/// Current value of the field an action sets, as its wire integer.
pub(crate) fn field_value(player: &Player, kind: EventKind) -> Option<i64> {
    Some(match kind {
        EventKind::SetState => player.state.code(),
        EventKind::SetPosition => i64::from(player.position),
        EventKind::SetVolume => i64::from(player.volume),
        EventKind::SetRating => i64::from(player.rating),
        EventKind::SetRepeat => player.repeat.code(),
        EventKind::SetShuffle => i64::from(player.shuffle),
        EventKind::SkipPrevious | EventKind::SkipNext => return None,
    })
}

pub(crate) fn set_field(player: &mut Player, kind: EventKind, value: i64) {
    match kind {
        EventKind::SetState => {
            if let Some(state) = PlaybackState::from_code(value) {
                player.state = state;
            }
        }
        EventKind::SetPosition => {
            player.position = u32::try_from(value.max(0)).unwrap_or(u32::MAX);
        }
        EventKind::SetVolume => player.volume = u8::try_from(value.clamp(0, 100)).unwrap_or(100),
        EventKind::SetRating => player.rating = u8::try_from(value.clamp(0, 5)).unwrap_or(5),
        EventKind::SetRepeat => {
            if let Some(repeat) = Repeat::from_code(value) {
                player.repeat = repeat;
            }
        }
        EventKind::SetShuffle => player.shuffle = value != 0,
        EventKind::SkipPrevious | EventKind::SkipNext => {}
    }
}

impl Core {
    pub fn new(listener: Option<Arc<dyn Listener>>) -> Self {
        Self::with_registry(Registry::new(listener))
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            events: EventStore::new(),
            adapters: RwLock::new(Vec::new()),
            optimistic: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<EventId, Optimistic>> {
        self.optimistic.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Adapters
    // -----------------------------------------------------------------------

    /// Make `adapter` the target for events on its platform. Does not call
    /// `init`.
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        info!(platform = %adapter.platform(), "adapter registered");
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(adapter);
    }

    pub fn unregister_adapter(&self, adapter: &Arc<dyn Adapter>) {
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|a| !Arc::ptr_eq(a, adapter));
    }

    pub fn adapter_for(&self, platform: Platform) -> Option<Arc<dyn Adapter>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.platform() == platform)
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Read API
    // -----------------------------------------------------------------------

    pub fn player(&self, id: PlayerId) -> Option<Player> {
        self.registry.player(id)
    }

    pub fn active_player(&self) -> Option<Player> {
        self.registry.active_player()
    }

    pub fn players(&self) -> Vec<Player> {
        self.registry.players()
    }

    pub fn players_on(&self, platform: Platform) -> Vec<Player> {
        self.registry.players_on(platform)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn event_result(&self, id: EventId) -> EventResult {
        self.events.get(id)
    }

    /// Block for up to a second on `id`. A timeout fails the event and
    /// reverts its optimistic change.
    pub fn wait_for_event_result(&self, id: EventId) -> EventResult {
        let result = self.events.wait(id);
        match result {
            EventResult::Failed => self.revert(id),
            EventResult::Succeeded => {
                self.pending().remove(&id);
            }
            EventResult::Pending => {}
        }
        result
    }

    /// Record the outcome of `id`. Returns false for ids outside the ring
    /// and for events that already have a result.
    pub fn resolve_event(&self, id: EventId, result: EventResult) -> bool {
        if !self.events.resolve(id, result) {
            debug!(event = %id, ?result, "dropping answer for a settled event");
            return false;
        }
        debug!(event = %id, ?result, "event resolved");
        match result {
            EventResult::Failed => self.revert(id),
            EventResult::Succeeded => {
                self.pending().remove(&id);
            }
            EventResult::Pending => {}
        }
        true
    }

    fn revert(&self, id: EventId) {
        let Some(change) = self.pending().remove(&id) else {
            return;
        };
        let mut cycle = self.registry.begin();
        let Some(mut player) = cycle.player(change.player) else {
            return;
        };
        if player.created_at != change.created_at
            || field_value(&player, change.kind) != Some(change.applied)
        {
            return;
        }
        debug!(event = %id, player = %change.player, kind = ?change.kind, "reverting optimistic update");
        set_field(&mut player, change.kind, change.previous);
        cycle.update(player);
        cycle.end();
    }

    /// Dispatch `kind` with argument `data` to the player's adapter.
    pub fn execute(&self, id: PlayerId, kind: EventKind, data: i64) -> EventId {
        let Some((player, payload)) = self.registry.entry(id) else {
            debug!(player = %id, ?kind, "event for unknown player");
            return self.events.failed();
        };
        if !player.capabilities.allows(kind) {
            debug!(player = %id, ?kind, "event not permitted by player");
            return self.events.failed();
        }
        let Some(adapter) = self.adapter_for(player.platform) else {
            debug!(player = %id, platform = %player.platform, "no adapter for player");
            return self.events.failed();
        };

        let event_id = self.events.issue();
        let change = field_value(&player, kind).map(|previous| {
            let mut target = player.clone();
            set_field(&mut target, kind, data);
            Optimistic {
                player: id,
                created_at: player.created_at,
                kind,
                previous,
                applied: field_value(&target, kind).unwrap_or(previous),
            }
        });
        {
            let mut pending = self.pending();
            // The slot may be reused after the ring wrapped.
            pending.remove(&event_id);
            if let Some(change) = change {
                pending.insert(event_id, change);
            }
        }

        debug!(player = %id, event = %event_id, ?kind, data, "dispatching event");
        adapter.on_event(&player, &payload, kind, event_id, data);

        if let Some(change) = change {
            let mut cycle = self.registry.begin();
            if self.events.get(event_id) != EventResult::Failed {
                if let Some(mut current) = cycle.player(id) {
                    if current.created_at == change.created_at {
                        set_field(&mut current, kind, change.applied);
                        cycle.update(current);
                    }
                }
            }
            cycle.end();
        }

        event_id
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::player::Capabilities;
    use std::sync::Weak;

    /// Adapter that records events and answers with a fixed result (or not
    /// at all).
    pub(crate) struct ScriptedAdapter {
        pub platform: Platform,
        pub answer: Mutex<Option<EventResult>>,
        pub seen: Mutex<Vec<(PlayerId, EventKind, EventId, i64)>>,
        pub core: Mutex<Weak<Core>>,
    }

    impl ScriptedAdapter {
        pub fn new(platform: Platform, answer: Option<EventResult>) -> Arc<Self> {
            Arc::new(Self {
                platform,
                answer: Mutex::new(answer),
                seen: Mutex::new(Vec::new()),
                core: Mutex::new(Weak::new()),
            })
        }
    }

    impl Adapter for ScriptedAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }
        fn init(&self, core: &Arc<Core>) -> Result<(), InitError> {
            *self.core.lock().unwrap() = Arc::downgrade(core);
            Ok(())
        }
        fn uninit(&self) {}
        fn on_event(&self, player: &Player, _payload: &Payload, kind: EventKind, event_id: EventId, data: i64) {
            self.seen
                .lock()
                .unwrap()
                .push((player.id.unwrap(), kind, event_id, data));
            if let Some(result) = *self.answer.lock().unwrap() {
                if let Some(core) = self.core.lock().unwrap().upgrade() {
                    core.resolve_event(event_id, result);
                }
            }
        }
    }

    /// A core with `adapter` registered and one controllable player on its
    /// platform.
    pub(crate) fn core_with_player(adapter: &Arc<ScriptedAdapter>, player: Player) -> (Arc<Core>, PlayerId) {
        let core = Arc::new(Core::new(None));
        let dyn_adapter: Arc<dyn Adapter> = adapter.clone();
        dyn_adapter.init(&core).unwrap();
        core.register_adapter(dyn_adapter);
        let mut cycle = core.registry().begin();
        let id = cycle
            .add(
                Player {
                    platform: adapter.platform,
                    capabilities: Capabilities::ALL,
                    ..player
                },
                Arc::new(()),
            )
            .unwrap();
        cycle.end();
        (core, id)
    }

    #[test]
    fn unknown_player_gets_failed_event() {
        let core = Core::new(None);
        let id = core.execute(PlayerId(3), EventKind::SetVolume, 10);
        assert_eq!(core.event_result(id), EventResult::Failed);
    }

    #[test]
    fn missing_capability_fails_without_dispatch() {
        let adapter = ScriptedAdapter::new(Platform::Linux, Some(EventResult::Succeeded));
        let (core, pid) = core_with_player(&adapter, Player::default());
        let mut cycle = core.registry().begin();
        let mut p = cycle.player(pid).unwrap();
        p.capabilities.can_set_volume = false;
        cycle.update(p);
        cycle.end();

        let id = core.execute(pid, EventKind::SetVolume, 10);
        assert_eq!(core.event_result(id), EventResult::Failed);
        assert!(adapter.seen.lock().unwrap().is_empty());
        assert_eq!(core.player(pid).unwrap().volume, 100);
    }

    #[test]
    fn player_without_adapter_fails() {
        let adapter = ScriptedAdapter::new(Platform::Linux, None);
        let (core, _) = core_with_player(&adapter, Player::default());
        let mut cycle = core.registry().begin();
        let other = cycle
            .add(
                Player {
                    capabilities: Capabilities::ALL,
                    ..Player::new(Platform::Darwin)
                },
                Arc::new(()),
            )
            .unwrap();
        cycle.end();
        let id = core.execute(other, EventKind::SkipNext, 0);
        assert_eq!(core.event_result(id), EventResult::Failed);
    }

    #[test]
    fn successful_event_keeps_optimistic_value() {
        let adapter = ScriptedAdapter::new(Platform::Linux, Some(EventResult::Succeeded));
        let (core, pid) = core_with_player(&adapter, Player::default());
        let id = core.execute(pid, EventKind::SetVolume, 42);
        assert_eq!(core.event_result(id), EventResult::Succeeded);
        assert_eq!(core.player(pid).unwrap().volume, 42);
        assert_eq!(
            adapter.seen.lock().unwrap().as_slice(),
            &[(pid, EventKind::SetVolume, id, 42)]
        );
    }

    #[test]
    fn synchronous_failure_skips_optimistic_update() {
        let adapter = ScriptedAdapter::new(Platform::Linux, Some(EventResult::Failed));
        let (core, pid) = core_with_player(&adapter, Player::default());
        let id = core.execute(pid, EventKind::SetShuffle, 1);
        assert_eq!(core.event_result(id), EventResult::Failed);
        assert!(!core.player(pid).unwrap().shuffle);
    }

    #[test]
    fn late_failure_reverts_optimistic_update() {
        let adapter = ScriptedAdapter::new(Platform::Linux, None);
        let (core, pid) = core_with_player(&adapter, Player::default());
        let id = core.execute(pid, EventKind::SetState, PlaybackState::Playing.code());
        assert_eq!(core.event_result(id), EventResult::Pending);
        assert_eq!(core.player(pid).unwrap().state, PlaybackState::Playing);

        assert!(core.resolve_event(id, EventResult::Failed));
        assert_eq!(core.player(pid).unwrap().state, PlaybackState::Stopped);
    }

    #[test]
    fn newer_report_is_not_reverted() {
        let adapter = ScriptedAdapter::new(Platform::Linux, None);
        let (core, pid) = core_with_player(&adapter, Player::default());
        let id = core.execute(pid, EventKind::SetVolume, 30);

        // The adapter reports a different volume before the failure lands.
        let mut cycle = core.registry().begin();
        let mut p = cycle.player(pid).unwrap();
        p.volume = 55;
        cycle.update(p);
        cycle.end();

        core.resolve_event(id, EventResult::Failed);
        assert_eq!(core.player(pid).unwrap().volume, 55);
    }

    #[test]
    fn timeout_reverts_optimistic_update() {
        let adapter = ScriptedAdapter::new(Platform::Linux, None);
        let (core, pid) = core_with_player(&adapter, Player::default());
        let id = core.execute(pid, EventKind::SetRating, 4);
        assert_eq!(core.player(pid).unwrap().rating, 4);
        assert_eq!(core.wait_for_event_result(id), EventResult::Failed);
        assert_eq!(core.player(pid).unwrap().rating, 0);
    }

    #[test]
    fn skips_never_touch_the_record() {
        let adapter = ScriptedAdapter::new(Platform::Linux, None);
        let (core, pid) = core_with_player(&adapter, Player::default());
        let before = core.player(pid).unwrap();
        let id = core.execute(pid, EventKind::SkipNext, 0);
        assert_eq!(core.event_result(id), EventResult::Pending);
        assert_eq!(core.player(pid).unwrap(), before);
        core.resolve_event(id, EventResult::Failed);
        assert_eq!(core.player(pid).unwrap(), before);
    }

    #[test]
    fn revert_ignores_reused_slot() {
        let adapter = ScriptedAdapter::new(Platform::Linux, None);
        let (core, pid) = core_with_player(&adapter, Player::default());
        let id = core.execute(pid, EventKind::SetVolume, 20);

        let mut cycle = core.registry().begin();
        cycle.remove(pid);
        let replacement = Player {
            volume: 20,
            created_at: 1,
            ..Player::new(Platform::Linux)
        };
        assert_eq!(cycle.add(replacement, Arc::new(())).unwrap(), pid);
        cycle.end();

        core.resolve_event(id, EventResult::Failed);
        assert_eq!(core.player(pid).unwrap().volume, 20);
    }

    #[test]
    fn resolve_rejects_out_of_range_ids() {
        let core = Core::new(None);
        assert!(!core.resolve_event(EventId(9999), EventResult::Succeeded));
    }

    #[test]
    fn field_helpers_clamp() {
        let mut p = Player::default();
        set_field(&mut p, EventKind::SetVolume, 500);
        assert_eq!(p.volume, 100);
        set_field(&mut p, EventKind::SetPosition, -3);
        assert_eq!(p.position, 0);
        set_field(&mut p, EventKind::SetRepeat, 3);
        assert_eq!(p.repeat, Repeat::None);
        set_field(&mut p, EventKind::SetRepeat, 4);
        assert_eq!(field_value(&p, EventKind::SetRepeat), Some(4));
        assert_eq!(field_value(&p, EventKind::SkipPrevious), None);
    }
}
