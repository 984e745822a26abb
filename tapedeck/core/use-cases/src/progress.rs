//! Maps phase-local percentages onto one session-wide scale.
//!
//! Fetching occupies `[0, 70)`, merging or converting `[70, 100)`, and the
//! done phase pins the bar at 100. Whatever the adapter reports, the emitted
//! sequence never goes backwards.

use ::domain::Phase;

use crate::models::events::ProgressEvent;

const FETCH_CEILING: u8 = 70;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedProgress {
    /// Set when the event moved the session into a new phase.
    pub status: Option<&'static str>,
    /// Set when the session-wide percent increased.
    pub percent: Option<u8>,
}

#[derive(Debug, Default)]
pub struct ProgressNormalizer {
    phase: Option<Phase>,
    emitted: Option<u8>,
}

impl ProgressNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, event: &ProgressEvent) -> NormalizedProgress {
        let mut update = NormalizedProgress::default();

        // A phase that ranks below the current one is a late or bogus event;
        // its percent would be mapped into the wrong band.
        let phase = match self.phase {
            Some(current) if event.phase.rank() < current.rank() => current,
            Some(current) if event.phase == current => current,
            _ => {
                self.phase = Some(event.phase);
                update.status = Some(status_of(event.phase));
                event.phase
            },
        };

        let percent = scale(phase, event.percent);

        if self.emitted.is_none_or(|emitted| percent > emitted) {
            self.emitted = Some(percent);
            update.percent = Some(percent);
        }

        update
    }
}

fn scale(phase: Phase, percent: u8) -> u8 {
    let percent = u16::from(percent.min(100));

    let (floor, ceiling) = match phase {
        Phase::Fetching => (0, u16::from(FETCH_CEILING)),
        Phase::Merging | Phase::Converting => (u16::from(FETCH_CEILING), 100),
        Phase::Done => (100, 100),
    };

    (floor + percent * (ceiling - floor) / 100) as u8
}

fn status_of(phase: Phase) -> &'static str {
    match phase {
        Phase::Fetching => "Fetching media...",
        Phase::Merging => "Merging audio and video...",
        Phase::Converting => "Converting to audio...",
        Phase::Done => "Finalizing...",
    }
}
