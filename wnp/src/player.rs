// Player records: one tracked media source and its playback state.
//
// A `Player` is a plain value. The registry hands out clones, callbacks
// receive clones, and adapters build one up and pass it to
// `UpdateCycle::add`/`update`. Nothing outside the registry holds a live
// reference into the table.
//
// String fields are bounded to `MAX_STR_BYTES` bytes; `normalize` cuts them
// back to a character boundary and clamps volume and rating into range. The
// registry normalizes every record it stores, so adapters may assign freely.
//
// Also here: the small enums shared by the wire protocol and the control
// API (`PlaybackState`, `Repeat`, `RatingSystem`, `Platform`), the
// `RepeatModes` availability mask, per-action `Capabilities`, and the
// display helpers `position_percent`, `remaining_seconds` and
// `format_seconds`.
//
// See also: `registry.rs` for how records are stored and stamped,
// `protocol.rs` for the pipe-delimited field encoding.

use bitflags::bitflags;
use serde::Serialize;

use crate::events::EventKind;

/// Capacity of the player table.
pub const MAX_PLAYERS: usize = 64;

/// Longest string a player field may hold, in bytes.
pub const MAX_STR_BYTES: usize = 511;

/// Slot index of a live player. Stable for the record's lifetime and reused
/// only after the record is removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PlayerId(pub usize);

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "player#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing = 0,
    Paused = 1,
    #[default]
    Stopped = 2,
}

impl PlaybackState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Playing),
            1 => Some(Self::Paused),
            2 => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

/// The repeat mode a player is currently in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    #[default]
    None = 1,
    All = 2,
    One = 4,
}

impl Repeat {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::None),
            2 => Some(Self::All),
            4 => Some(Self::One),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn as_mode(self) -> RepeatModes {
        match self {
            Self::None => RepeatModes::NONE,
            Self::All => RepeatModes::ALL,
            Self::One => RepeatModes::ONE,
        }
    }
}

bitflags! {
    /// Which repeat modes a player can be switched into.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
    #[serde(transparent)]
    pub struct RepeatModes: u8 {
        const NONE = 1;
        const ALL = 2;
        const ONE = 4;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingSystem {
    #[default]
    None = 0,
    Like = 1,
    LikeDislike = 2,
    Scale = 3,
}

impl RatingSystem {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Like),
            2 => Some(Self::LikeDislike),
            3 => Some(Self::Scale),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Where a player comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    None = 0,
    Web = 1,
    Linux = 2,
    Darwin = 3,
    Windows = 4,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Web => "web",
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        };
        f.write_str(name)
    }
}

/// Per-action permission flags. Field order matches the wire order and the
/// `EventKind` codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub can_set_state: bool,
    pub can_skip_previous: bool,
    pub can_skip_next: bool,
    pub can_set_position: bool,
    pub can_set_volume: bool,
    pub can_set_rating: bool,
    pub can_set_repeat: bool,
    pub can_set_shuffle: bool,
}

impl Capabilities {
    /// Every action permitted.
    pub const ALL: Self = Self {
        can_set_state: true,
        can_skip_previous: true,
        can_skip_next: true,
        can_set_position: true,
        can_set_volume: true,
        can_set_rating: true,
        can_set_repeat: true,
        can_set_shuffle: true,
    };

    pub fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::SetState => self.can_set_state,
            EventKind::SkipPrevious => self.can_skip_previous,
            EventKind::SkipNext => self.can_skip_next,
            EventKind::SetPosition => self.can_set_position,
            EventKind::SetVolume => self.can_set_volume,
            EventKind::SetRating => self.can_set_rating,
            EventKind::SetRepeat => self.can_set_repeat,
            EventKind::SetShuffle => self.can_set_shuffle,
        }
    }

    /// Flags in wire order.
    pub fn as_array(&self) -> [bool; 8] {
        [
            self.can_set_state,
            self.can_skip_previous,
            self.can_skip_next,
            self.can_set_position,
            self.can_set_volume,
            self.can_set_rating,
            self.can_set_repeat,
            self.can_set_shuffle,
        ]
    }

    /// Mutable flags in wire order.
    pub fn flags_mut(&mut self) -> [&mut bool; 8] {
        [
            &mut self.can_set_state,
            &mut self.can_skip_previous,
            &mut self.can_skip_next,
            &mut self.can_set_position,
            &mut self.can_set_volume,
            &mut self.can_set_rating,
            &mut self.can_set_repeat,
            &mut self.can_set_shuffle,
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Player {
    /// `None` until the registry assigns a slot.
    pub id: Option<PlayerId>,
    pub name: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Local file URI of the cover image.
    pub cover: String,
    /// Where the cover originally came from (usually an http URL).
    pub cover_src: String,
    pub state: PlaybackState,
    /// Seconds.
    pub position: u32,
    /// Seconds.
    pub duration: u32,
    /// 0..=100.
    pub volume: u8,
    /// 0..=5.
    pub rating: u8,
    pub repeat: Repeat,
    pub shuffle: bool,
    pub rating_system: RatingSystem,
    pub available_repeat: RepeatModes,
    pub capabilities: Capabilities,
    /// Milliseconds since the epoch.
    pub created_at: u64,
    pub updated_at: u64,
    pub active_at: u64,
    pub is_web_browser: bool,
    pub platform: Platform,
}

impl Default for Player {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            cover: String::new(),
            cover_src: String::new(),
            state: PlaybackState::Stopped,
            position: 0,
            duration: 0,
            volume: 100,
            rating: 0,
            repeat: Repeat::None,
            shuffle: false,
            rating_system: RatingSystem::None,
            available_repeat: RepeatModes::empty(),
            capabilities: Capabilities::default(),
            created_at: 0,
            updated_at: 0,
            active_at: 0,
            is_web_browser: false,
            platform: Platform::None,
        }
    }
}

impl Player {
    /// A default record tagged with `platform`.
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            ..Self::default()
        }
    }

    /// Truncate string fields to `MAX_STR_BYTES` and clamp numeric ranges.
    pub fn normalize(&mut self) {
        for field in [
            &mut self.name,
            &mut self.title,
            &mut self.artist,
            &mut self.album,
            &mut self.cover,
            &mut self.cover_src,
        ] {
            truncate_bounded(field);
        }
        self.volume = self.volume.min(100);
        self.rating = self.rating.min(5);
    }

    /// Playback progress in percent; 100 when the duration is unknown.
    pub fn position_percent(&self) -> f64 {
        if self.duration == 0 {
            return 100.0;
        }
        f64::from(self.position) / f64::from(self.duration) * 100.0
    }

    pub fn remaining_seconds(&self) -> u32 {
        self.duration.saturating_sub(self.position)
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }
}

/// Cut `s` to at most `MAX_STR_BYTES` bytes without splitting a character.
pub fn truncate_bounded(s: &mut String) {
    if s.len() <= MAX_STR_BYTES {
        return;
    }
    let mut end = MAX_STR_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// `H:MM:SS` or `M:SS`; with `pad`, the leading group gets two digits.
pub fn format_seconds(seconds: u32, pad: bool) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    match (hours > 0, pad) {
        (true, true) => format!("{hours:02}:{minutes:02}:{secs:02}"),
        (true, false) => format!("{hours}:{minutes:02}:{secs:02}"),
        (false, true) => format!("{minutes:02}:{secs:02}"),
        (false, false) => format!("{minutes}:{secs:02}"),
    }
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
