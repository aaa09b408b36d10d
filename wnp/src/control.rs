// Control API: one `try_*` method per action plus helpers built on them.
//
// Every method returns an `EventId` right away; poll it with
// `Core::event_result` or block with `Core::wait_for_event_result`. Invalid
// requests (unknown player, unsupported action, nothing to change) come back
// as an already-failed id.
//
// Arguments are normalized before dispatch: positions clamp to
// `[0, duration]` (a player with no known duration cannot seek), volume to
// `0..=100` and rating to `0..=5`. Relative helpers read the player's
// current value at call time.

use crate::dispatch::Core;
use crate::events::{EventId, EventKind};
use crate::player::{PlaybackState, PlayerId, Repeat};

/// `percent` of `duration`, rounded to whole seconds.
fn percent_seconds(percent: f64, duration: u32) -> i64 {
    (percent / 100.0 * f64::from(duration)).round() as i64
}

impl Core {
    pub fn try_set_state(&self, id: PlayerId, state: PlaybackState) -> EventId {
        self.execute(id, EventKind::SetState, state.code())
    }

    pub fn try_skip_previous(&self, id: PlayerId) -> EventId {
        self.execute(id, EventKind::SkipPrevious, 0)
    }

    pub fn try_skip_next(&self, id: PlayerId) -> EventId {
        self.execute(id, EventKind::SkipNext, 0)
    }

    pub fn try_set_position(&self, id: PlayerId, seconds: i64) -> EventId {
        let Some(player) = self.player(id) else {
            return self.events().failed();
        };
        if player.duration == 0 {
            return self.events().failed();
        }
        let seconds = seconds.clamp(0, i64::from(player.duration));
        self.execute(id, EventKind::SetPosition, seconds)
    }

    pub fn try_set_volume(&self, id: PlayerId, volume: i64) -> EventId {
        self.execute(id, EventKind::SetVolume, volume.clamp(0, 100))
    }

    pub fn try_set_rating(&self, id: PlayerId, rating: i64) -> EventId {
        self.execute(id, EventKind::SetRating, rating.clamp(0, 5))
    }

    pub fn try_set_repeat(&self, id: PlayerId, repeat: Repeat) -> EventId {
        self.execute(id, EventKind::SetRepeat, repeat.code())
    }

    pub fn try_set_shuffle(&self, id: PlayerId, shuffle: bool) -> EventId {
        self.execute(id, EventKind::SetShuffle, i64::from(shuffle))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Paused or stopped players start playing; anything else pauses.
    pub fn try_play_pause(&self, id: PlayerId) -> EventId {
        let Some(player) = self.player(id) else {
            return self.events().failed();
        };
        let next = match player.state {
            PlaybackState::Paused | PlaybackState::Stopped => PlaybackState::Playing,
            PlaybackState::Playing => PlaybackState::Paused,
        };
        self.try_set_state(id, next)
    }

    /// Seek `seconds` back from the current position.
    pub fn try_revert(&self, id: PlayerId, seconds: i64) -> EventId {
        self.seek_relative(id, |position, _| position - seconds)
    }

    pub fn try_forward(&self, id: PlayerId, seconds: i64) -> EventId {
        self.seek_relative(id, |position, _| position + seconds)
    }

    pub fn try_set_position_percent(&self, id: PlayerId, percent: f64) -> EventId {
        self.seek_relative(id, |_, duration| percent_seconds(percent, duration))
    }

    pub fn try_revert_percent(&self, id: PlayerId, percent: f64) -> EventId {
        self.seek_relative(id, |position, duration| {
            position - percent_seconds(percent, duration)
        })
    }

    pub fn try_forward_percent(&self, id: PlayerId, percent: f64) -> EventId {
        self.seek_relative(id, |position, duration| {
            position + percent_seconds(percent, duration)
        })
    }

    fn seek_relative(&self, id: PlayerId, target: impl FnOnce(i64, u32) -> i64) -> EventId {
        let Some(player) = self.player(id) else {
            return self.events().failed();
        };
        self.try_set_position(id, target(i64::from(player.position), player.duration))
    }

    /// Step none -> all -> one -> none, skipping modes the player does not
    /// offer. Fails if there is nowhere to go.
    pub fn try_toggle_repeat(&self, id: PlayerId) -> EventId {
        let Some(player) = self.player(id) else {
            return self.events().failed();
        };
        let available = player.available_repeat;
        let order = match player.repeat {
            Repeat::None => [Repeat::All, Repeat::One],
            Repeat::All => [Repeat::One, Repeat::None],
            Repeat::One => [Repeat::None, Repeat::All],
        };
        let next = order
            .into_iter()
            .find(|mode| available.contains(mode.as_mode()) && *mode != player.repeat);
        match next {
            Some(mode) => self.try_set_repeat(id, mode),
            None => self.events().failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::{ScriptedAdapter, core_with_player};
    use crate::events::EventResult;
    use crate::player::{Platform, Player, RepeatModes};

    fn setup(player: Player) -> (std::sync::Arc<Core>, PlayerId, std::sync::Arc<ScriptedAdapter>) {
        let adapter = ScriptedAdapter::new(Platform::Linux, Some(EventResult::Succeeded));
        let (core, id) = core_with_player(&adapter, player);
        (core, id, adapter)
    }

    fn last_data(adapter: &ScriptedAdapter) -> (EventKind, i64) {
        let seen = adapter.seen.lock().unwrap();
        let (_, kind, _, data) = *seen.last().unwrap();
        (kind, data)
    }

    #[test]
    fn position_is_clamped_to_duration() {
        let (core, id, adapter) = setup(Player {
            duration: 100,
            ..Player::default()
        });
        core.try_set_position(id, 250);
        assert_eq!(last_data(&adapter), (EventKind::SetPosition, 100));
        core.try_set_position(id, -5);
        assert_eq!(last_data(&adapter), (EventKind::SetPosition, 0));
        assert_eq!(core.player(id).unwrap().position, 0);
    }

    #[test]
    fn seeking_without_duration_fails() {
        let (core, id, adapter) = setup(Player::default());
        let event = core.try_set_position(id, 5);
        assert_eq!(core.event_result(event), EventResult::Failed);
        assert!(adapter.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn volume_and_rating_are_clamped() {
        let (core, id, adapter) = setup(Player::default());
        core.try_set_volume(id, 140);
        assert_eq!(last_data(&adapter), (EventKind::SetVolume, 100));
        core.try_set_volume(id, -1);
        assert_eq!(last_data(&adapter), (EventKind::SetVolume, 0));
        core.try_set_rating(id, 9);
        assert_eq!(last_data(&adapter), (EventKind::SetRating, 5));
    }

    #[test]
    fn play_pause_toggles() {
        let (core, id, adapter) = setup(Player::default());
        core.try_play_pause(id);
        assert_eq!(last_data(&adapter), (EventKind::SetState, PlaybackState::Playing.code()));
        assert_eq!(core.player(id).unwrap().state, PlaybackState::Playing);
        core.try_play_pause(id);
        assert_eq!(last_data(&adapter), (EventKind::SetState, PlaybackState::Paused.code()));
        core.try_play_pause(id);
        assert_eq!(last_data(&adapter), (EventKind::SetState, PlaybackState::Playing.code()));
    }

    #[test]
    fn relative_and_percent_seeks() {
        let (core, id, adapter) = setup(Player {
            position: 50,
            duration: 200,
            ..Player::default()
        });
        core.try_forward(id, 10);
        assert_eq!(last_data(&adapter), (EventKind::SetPosition, 60));
        core.try_revert(id, 100);
        assert_eq!(last_data(&adapter), (EventKind::SetPosition, 0));
        core.try_set_position_percent(id, 25.0);
        assert_eq!(last_data(&adapter), (EventKind::SetPosition, 50));
        core.try_forward_percent(id, 10.0);
        assert_eq!(last_data(&adapter), (EventKind::SetPosition, 70));
        core.try_revert_percent(id, 0.2);
        assert_eq!(last_data(&adapter), (EventKind::SetPosition, 70), "0.4s rounds to 0");
    }

    #[test]
    fn toggle_repeat_walks_available_modes() {
        let (core, id, adapter) = setup(Player {
            available_repeat: RepeatModes::all(),
            ..Player::default()
        });
        core.try_toggle_repeat(id);
        assert_eq!(last_data(&adapter), (EventKind::SetRepeat, Repeat::All.code()));
        core.try_toggle_repeat(id);
        assert_eq!(last_data(&adapter), (EventKind::SetRepeat, Repeat::One.code()));
        core.try_toggle_repeat(id);
        assert_eq!(last_data(&adapter), (EventKind::SetRepeat, Repeat::None.code()));
    }

    #[test]
    fn toggle_repeat_skips_unavailable_and_fails_when_stuck() {
        let (core, id, adapter) = setup(Player {
            available_repeat: RepeatModes::NONE | RepeatModes::ONE,
            ..Player::default()
        });
        core.try_toggle_repeat(id);
        assert_eq!(last_data(&adapter), (EventKind::SetRepeat, Repeat::One.code()));

        let (core, id, _) = setup(Player {
            available_repeat: RepeatModes::NONE,
            ..Player::default()
        });
        let event = core.try_toggle_repeat(id);
        assert_eq!(core.event_result(event), EventResult::Failed);
    }

    #[test]
    fn unknown_player_helpers_fail() {
        let (core, _, _) = setup(Player::default());
        let ghost = PlayerId(40);
        for event in [
            core.try_play_pause(ghost),
            core.try_forward(ghost, 1),
            core.try_toggle_repeat(ghost),
            core.try_skip_next(ghost),
        ] {
            assert_eq!(core.event_result(event), EventResult::Failed);
        }
    }
}
