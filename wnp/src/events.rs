// Event ids and the result ring.
//
// Every control action gets an `EventId` naming a slot in a fixed ring of
// `MAX_EVENT_RESULTS` results. The counter pre-increments, so the first id
// handed out is 1, and wraps silently: an id issued 512 actions ago now
// names someone else's slot. Callers that care about a result read it soon.
//
// A slot starts `Pending` and is resolved once, by the owning adapter (from
// any thread, at any time) or by validation failing before dispatch. Later
// answers for the same slot are dropped. Ids outside the ring read as
// `Failed` and cannot be written.
//
// `wait` is the blocking bridge for synchronous callers: it polls every
// `WAIT_INTERVAL` for `WAIT_ATTEMPTS` rounds and then fails the slot if it is
// still pending, so a late adapter answer cannot flip it back.
//
// The ring has its own lock, never held together with the registry lock.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

pub const MAX_EVENT_RESULTS: usize = 512;
pub const WAIT_INTERVAL: Duration = Duration::from_millis(10);
pub const WAIT_ATTEMPTS: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EventId(pub usize);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// A control action. The numeric codes are the wire codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SetState = 0,
    SkipPrevious = 1,
    SkipNext = 2,
    SetPosition = 3,
    SetVolume = 4,
    SetRating = 5,
    SetRepeat = 6,
    SetShuffle = 7,
}

impl EventKind {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::SetState,
            1 => Self::SkipPrevious,
            2 => Self::SkipNext,
            3 => Self::SetPosition,
            4 => Self::SetVolume,
            5 => Self::SetRating,
            6 => Self::SetRepeat,
            7 => Self::SetShuffle,
            _ => return None,
        })
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventResult {
    #[default]
    Pending = 0,
    Succeeded = 1,
    Failed = 2,
}

impl EventResult {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Succeeded),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

struct Ring {
    last: usize,
    results: [EventResult; MAX_EVENT_RESULTS],
}

pub struct EventStore {
    ring: Mutex<Ring>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                last: 0,
                results: [EventResult::Pending; MAX_EVENT_RESULTS],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and mark it pending.
    pub fn issue(&self) -> EventId {
        let mut ring = self.lock();
        ring.last = (ring.last + 1) % MAX_EVENT_RESULTS;
        let id = ring.last;
        ring.results[id] = EventResult::Pending;
        EventId(id)
    }

    /// Allocate an id that is already failed.
    pub fn failed(&self) -> EventId {
        let mut ring = self.lock();
        ring.last = (ring.last + 1) % MAX_EVENT_RESULTS;
        let id = ring.last;
        ring.results[id] = EventResult::Failed;
        EventId(id)
    }

    /// Record the result of a pending event. The first answer wins: returns
    /// false for ids outside the ring and for slots already resolved.
    pub fn resolve(&self, id: EventId, result: EventResult) -> bool {
        let mut ring = self.lock();
        match ring.results.get_mut(id.0) {
            Some(slot) if *slot == EventResult::Pending => {
                *slot = result;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: EventId) -> EventResult {
        self.lock()
            .results
            .get(id.0)
            .copied()
            .unwrap_or(EventResult::Failed)
    }

    /// Block until `id` resolves, failing it after `WAIT_ATTEMPTS` polls.
    pub fn wait(&self, id: EventId) -> EventResult {
        for _ in 0..WAIT_ATTEMPTS {
            let result = self.get(id);
            if result != EventResult::Pending {
                return result;
            }
            thread::sleep(WAIT_INTERVAL);
        }

        let mut ring = self.lock();
        match ring.results.get_mut(id.0) {
            Some(slot) if *slot == EventResult::Pending => {
                debug!(event = %id, "event timed out");
                *slot = EventResult::Failed;
                EventResult::Failed
            }
            Some(slot) => *slot,
            None => EventResult::Failed,
        }
    }
}
