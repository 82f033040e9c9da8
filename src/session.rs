use std::sync::Arc;

use dashmap::DashMap;
use serenity::{model::id::GuildId, prelude::TypeMapKey};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch, Mutex, OwnedMutexGuard,
};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Activity {
    state: SessionState,

    /// Number of playbacks that have returned to `Idle` so far.
    completed: u64,
}

/// Voice activity of a single destination.
///
/// Playback requests are serialized through a FIFO gate: a request that
/// arrives while another one is playing waits for it instead of failing.
#[derive(Debug)]
pub struct PlaybackSession {
    destination: GuildId,
    gate: Arc<Mutex<()>>,
    activity: Arc<watch::Sender<Activity>>,
    signals: broadcast::Sender<SessionSignal>,
}

impl PlaybackSession {
    pub fn new(destination: GuildId) -> Self {
        let (activity, _) = watch::channel(Activity {
            state: SessionState::Idle,
            completed: 0,
        });
        let (signals, _) = broadcast::channel(16);
        Self {
            destination,
            gate: Arc::new(Mutex::new(())),
            activity: Arc::new(activity),
            signals,
        }
    }

    pub fn destination(&self) -> GuildId {
        self.destination
    }

    pub fn state(&self) -> SessionState {
        self.activity.borrow().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    /// Waits until every earlier request has finished, then marks the session
    /// as playing. The session returns to `Idle` when the guard is dropped.
    pub async fn begin(&self) -> PlaybackGuard {
        let permit = Arc::clone(&self.gate).lock_owned().await;
        self.activity.send_modify(|a| a.state = SessionState::Playing);
        debug!(destination = %self.destination, "playback session acquired");
        PlaybackGuard {
            destination: self.destination,
            activity: Arc::clone(&self.activity),
            _permit: permit,
        }
    }

    /// Suspends until the playback in progress (if any) has completed.
    pub async fn wait_for_completion(&self) {
        let mut rx = self.activity.subscribe();
        let started = *rx.borrow_and_update();
        if started.state == SessionState::Idle {
            return;
        }
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        rx.wait_for(|a| a.state == SessionState::Idle || a.completed > started.completed)
            .await
            .ok();
    }

    pub fn subscribe(&self) -> StopListener {
        StopListener {
            rx: self.signals.subscribe(),
        }
    }

    /// Asks every in-flight and queued request of this session to stop.
    ///
    /// Returns the number of listeners that were notified.
    pub fn stop(&self) -> usize {
        self.signals.send(SessionSignal::Stop).unwrap_or(0)
    }
}

/// Holds a session in the `Playing` state.
#[derive(Debug)]
pub struct PlaybackGuard {
    destination: GuildId,
    activity: Arc<watch::Sender<Activity>>,
    // Dropped after `Drop::drop` has published `Idle`.
    _permit: OwnedMutexGuard<()>,
}

impl PlaybackGuard {
    pub fn destination(&self) -> GuildId {
        self.destination
    }
}

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        self.activity.send_modify(|a| {
            a.state = SessionState::Idle;
            a.completed += 1;
        });
        debug!(destination = %self.destination, "playback session released");
    }
}

#[derive(Debug)]
pub struct StopListener {
    rx: broadcast::Receiver<SessionSignal>,
}

impl StopListener {
    /// Resolves once the session is asked to stop.
    pub async fn stopped(&mut self) {
        loop {
            match self.rx.recv().await {
                Ok(SessionSignal::Stop) | Err(RecvError::Lagged(_)) => return,
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

/// Keeps one [`PlaybackSession`] per guild.
#[derive(Debug, Default)]
pub struct PlaybackSessions {
    sessions: DashMap<GuildId, Arc<PlaybackSession>>,
}

impl PlaybackSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<PlaybackSession> {
        Arc::clone(
            self.sessions
                .entry(guild_id)
                .or_insert_with(|| Arc::new(PlaybackSession::new(guild_id)))
                .value(),
        )
    }

    /// Like [`Self::get_or_create`], but also subscribes to the session's stop
    /// signal while the entry is locked, so a concurrent [`Self::remove`]
    /// either reaches the listener or happens before the session is created.
    pub fn subscribe(&self, guild_id: GuildId) -> (Arc<PlaybackSession>, StopListener) {
        let entry = self
            .sessions
            .entry(guild_id)
            .or_insert_with(|| Arc::new(PlaybackSession::new(guild_id)));
        let listener = entry.subscribe();
        (Arc::clone(entry.value()), listener)
    }

    pub fn get(&self, guild_id: &GuildId) -> Option<Arc<PlaybackSession>> {
        self.sessions.get(guild_id).map(|s| Arc::clone(s.value()))
    }

    /// Stops the guild's playback. Returns `false` if nothing was listening.
    pub fn stop(&self, guild_id: &GuildId) -> bool {
        self.get(guild_id).map_or(false, |s| s.stop() > 0)
    }

    /// Stops and forgets the guild's session.
    pub fn remove(&self, guild_id: &GuildId) -> Option<Arc<PlaybackSession>> {
        let (_, session) = self.sessions.remove(guild_id)?;
        let stopped = session.stop();
        info!(%guild_id, stopped, "removed playback session");
        Some(session)
    }
}

impl TypeMapKey for PlaybackSessions {
    type Value = Arc<Self>;
}
