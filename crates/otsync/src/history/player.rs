use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{HistoryEntry, OperationHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Playing,
    Paused,
    Stopped,
    Finished,
}

/// Controls a running [`HistoryPlayer`]
#[derive(Clone)]
pub struct PlayerControl {
    state: Arc<watch::Sender<PlayState>>,
}

impl PlayerControl {
    pub fn pause(&self) {
        self.transition(PlayState::Playing, PlayState::Paused);
    }

    pub fn resume(&self) {
        self.transition(PlayState::Paused, PlayState::Playing);
    }

    /// Stop playback; the player returns before the next entry
    pub fn stop(&self) {
        self.state.send_if_modified(|state| match state {
            PlayState::Playing | PlayState::Paused => {
                *state = PlayState::Stopped;
                true
            }
            PlayState::Stopped | PlayState::Finished => false,
        });
    }

    pub fn state(&self) -> PlayState {
        *self.state.borrow()
    }

    fn transition(&self, from: PlayState, to: PlayState) {
        self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        });
    }
}

/// Replays history entries one at a time, for demos and debugging
pub struct HistoryPlayer {
    entries: Vec<HistoryEntry>,
    interval: Duration,
    speed: f64,
}

impl HistoryPlayer {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        Self {
            entries,
            interval: Self::DEFAULT_INTERVAL,
            speed: 1.0,
        }
    }

    /// Replay every entry currently in `history`
    pub fn from_history(history: &OperationHistory) -> Self {
        Self::new(history.entries().iter().cloned().collect())
    }

    /// Time between entries at normal speed
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Playback speed multiplier; 2.0 plays twice as fast
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = if speed.is_finite() && speed > 0.0 {
            speed
        } else {
            1.0
        };
        self
    }

    /// Delay between entries after applying the speed
    pub fn delay(&self) -> Duration {
        self.interval.div_f64(self.speed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start playback on a new task, calling `on_entry` with each entry's
    /// position and the entry. The task yields the number of entries played.
    pub fn play<F>(self, on_entry: F) -> (PlayerControl, JoinHandle<usize>)
    where
        F: FnMut(usize, &HistoryEntry) + Send + 'static,
    {
        let (state, _) = watch::channel(PlayState::Playing);
        let control = PlayerControl {
            state: Arc::new(state),
        };

        let delay = self.delay();
        let task = tokio::spawn(run(self.entries, delay, control.clone(), on_entry));
        (control, task)
    }
}

async fn run<F>(
    entries: Vec<HistoryEntry>,
    delay: Duration,
    control: PlayerControl,
    mut on_entry: F,
) -> usize
where
    F: FnMut(usize, &HistoryEntry) + Send + 'static,
{
    let mut state = control.state.subscribe();
    let mut played = 0;

    for (index, entry) in entries.iter().enumerate() {
        let current = match state.wait_for(|state| *state != PlayState::Paused).await {
            Ok(current) => *current,
            Err(_) => break,
        };
        if current == PlayState::Stopped {
            break;
        }

        debug!("Replaying history entry {}: {}", index, entry.description);
        on_entry(index, entry);
        played += 1;

        if index + 1 < entries.len() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = state.wait_for(|state| *state == PlayState::Stopped) => break,
            }
        }
    }

    control.transition(PlayState::Playing, PlayState::Finished);
    info!("History playback ended after {} of {} entries", played, entries.len());
    played
}
