//! Outage episode value carried by the delivery loop between ticks.

use crate::buffer::EpisodeKey;

/// Smallest increment used to keep episode keys strictly increasing.
const KEY_STEP: f64 = 0.000_001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutageEpisode {
    /// First-failure timestamp of the open episode
    pub started_at: Option<EpisodeKey>,
    pub connected: bool,
}

impl Default for OutageEpisode {
    fn default() -> Self {
        Self::connected()
    }
}

impl OutageEpisode {
    pub fn connected() -> Self {
        Self {
            started_at: None,
            connected: true,
        }
    }

    pub fn is_outage(&self) -> bool {
        !self.connected
    }

    /// A failed send at `at`. Opens an episode when connected, otherwise the
    /// current episode continues and keeps its original key.
    ///
    /// `floor` is the largest key already used by this process; a new key is
    /// pushed above it so episodes never share a file.
    pub fn on_failure(self, at: f64, floor: Option<EpisodeKey>) -> Self {
        match self.started_at {
            Some(_) if !self.connected => self,
            _ => {
                let mut key = at;
                if let Some(EpisodeKey(prev)) = floor {
                    if key <= prev {
                        key = prev + KEY_STEP.max(prev.abs() * f64::EPSILON * 4.0);
                    }
                }
                Self {
                    started_at: Some(EpisodeKey(key)),
                    connected: false,
                }
            }
        }
    }

    /// The episode was drained; back to a clean connected state.
    pub fn close(self) -> Self {
        Self::connected()
    }

    pub fn opened_new(before: &Self, after: &Self) -> bool {
        after.started_at.is_some() && before.started_at != after.started_at
    }
}
