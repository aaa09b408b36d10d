// Active-player selection.
//
// A pure function over a registry snapshot. The registry calls it at the end
// of every update cycle and fires `on_active_player_changed` when the result
// differs from the stored active id.
//
// Rules, in priority order:
// 1. A playing player with nonzero volume; the greatest `active_at` wins,
//    the earliest slot on ties.
// 2. Any playing player (first in slot order).
// 3. The non-playing player with the greatest `active_at`, provided it is
//    nonzero. A player that was never active is never selected.
//
// Browser players are only candidates when no non-browser player exists, so
// a desktop app always outranks a browser tab.

use crate::player::{Player, PlayerId};

pub fn select_active<'a, I>(players: I) -> Option<PlayerId>
where
    I: IntoIterator<Item = &'a Player>,
    I::IntoIter: Clone,
{
    let players = players.into_iter();
    let has_native = players.clone().any(|p| !p.is_web_browser);
    let candidates = players.filter(|p| p.id.is_some() && (!has_native || !p.is_web_browser));

    let mut audible: Option<&Player> = None;
    let mut playing: Option<&Player> = None;
    let mut recent: Option<&Player> = None;

    for p in candidates {
        if p.is_playing() {
            if p.volume > 0 && audible.is_none_or(|best| p.active_at > best.active_at) {
                audible = Some(p);
            }
            if playing.is_none() {
                playing = Some(p);
            }
        } else if p.active_at > 0 && recent.is_none_or(|best| p.active_at > best.active_at) {
            recent = Some(p);
        }
    }

    audible.or(playing).or(recent).and_then(|p| p.id)
}
