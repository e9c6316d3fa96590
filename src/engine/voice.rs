// Weft Engine — Voice / queue manager
//
// Per-guild playback state machine: disconnected → connected → playing ⇄
// paused, with a queue, loop modes, a filter set, clamped volume, and
// position accounting that survives pauses and filter restarts.
//
// The actual transport lives behind `VoiceBackend`; the gateway module wires
// a real one, `NullVoiceBackend` records calls for dry runs and tests.
// Track-end events come back through `handle_track_end`, which applies the
// loop mode and advances the queue.

use crate::atoms::constants::VOICE_VOLUME_MAX;
use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub requester_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl LoopMode {
    pub fn parse(s: &str) -> LoopMode {
        match s.to_ascii_lowercase().as_str() {
            "track" | "song" => LoopMode::Track,
            "queue" | "all" => LoopMode::Queue,
            _ => LoopMode::Off,
        }
    }
}

/// Where `queue_add` puts a track.
#[derive(Debug, Clone, Copy)]
pub enum QueuePosition {
    Next,
    Last,
    At(usize),
}

impl QueuePosition {
    pub fn parse(v: &serde_json::Value) -> QueuePosition {
        match v {
            serde_json::Value::String(s) if s == "next" => QueuePosition::Next,
            serde_json::Value::String(s) if s == "last" => QueuePosition::Last,
            serde_json::Value::Number(n) => {
                QueuePosition::At(n.as_u64().unwrap_or(0) as usize)
            }
            _ => QueuePosition::Last,
        }
    }
}

struct GuildVoice {
    channel_id: String,
    queue: VecDeque<QueueItem>,
    current: Option<QueueItem>,
    volume: u32,
    loop_mode: LoopMode,
    filters: BTreeSet<String>,
    playing: bool,
    paused: bool,
    start_time: Option<Instant>,
    paused_at: Option<Instant>,
}

impl GuildVoice {
    fn new(channel_id: String, volume: u32) -> Self {
        GuildVoice {
            channel_id,
            queue: VecDeque::new(),
            current: None,
            volume,
            loop_mode: LoopMode::Off,
            filters: BTreeSet::new(),
            playing: false,
            paused: false,
            start_time: None,
            paused_at: None,
        }
    }

    fn position_ms(&self) -> u64 {
        let Some(start) = self.start_time else { return 0 };
        let at = if self.paused {
            match self.paused_at {
                Some(p) => p,
                None => return 0,
            }
        } else {
            Instant::now()
        };
        at.saturating_duration_since(start).as_millis() as u64
    }
}

/// Public snapshot of a guild's playback state.
#[derive(Debug, Clone)]
pub struct VoiceStatus {
    pub channel_id: String,
    pub current: Option<QueueItem>,
    pub queue: Vec<QueueItem>,
    pub volume: u32,
    pub loop_mode: LoopMode,
    pub filters: Vec<String>,
    pub playing: bool,
    pub paused: bool,
    pub position_ms: u64,
}

// ── Backend trait ──────────────────────────────────────────────────────────

#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Join a channel and wait for the transport ready signal (bounded by
    /// the engine's ready timeout at the call site).
    async fn join(
        &self,
        guild_id: &str,
        channel_id: &str,
        self_deaf: bool,
        self_mute: bool,
    ) -> EngineResult<()>;
    async fn leave(&self, guild_id: &str) -> EngineResult<()>;
    /// Start (or restart) a source at `seek_ms` with the given filter chain
    /// and inline volume.
    async fn play(
        &self,
        guild_id: &str,
        url: &str,
        volume: u32,
        seek_ms: u64,
        filters: &[String],
    ) -> EngineResult<()>;
    async fn pause(&self, guild_id: &str) -> EngineResult<()>;
    async fn resume(&self, guild_id: &str) -> EngineResult<()>;
    async fn stop(&self, guild_id: &str) -> EngineResult<()>;
    async fn set_volume(&self, guild_id: &str, volume: u32) -> EngineResult<()>;
    /// Resolve a search query or URL into playable items.
    async fn search(&self, query: &str) -> EngineResult<Vec<QueueItem>>;
}

/// Records calls; `search` echoes the query back as a single fake track.
#[derive(Default)]
pub struct NullVoiceBackend {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl VoiceBackend for NullVoiceBackend {
    async fn join(&self, guild_id: &str, channel_id: &str, _d: bool, _m: bool) -> EngineResult<()> {
        self.calls.lock().push(format!("join {guild_id} {channel_id}"));
        Ok(())
    }

    async fn leave(&self, guild_id: &str) -> EngineResult<()> {
        self.calls.lock().push(format!("leave {guild_id}"));
        Ok(())
    }

    async fn play(
        &self,
        guild_id: &str,
        url: &str,
        volume: u32,
        seek_ms: u64,
        filters: &[String],
    ) -> EngineResult<()> {
        self.calls
            .lock()
            .push(format!("play {guild_id} {url} vol={volume} seek={seek_ms} filters={filters:?}"));
        Ok(())
    }

    async fn pause(&self, guild_id: &str) -> EngineResult<()> {
        self.calls.lock().push(format!("pause {guild_id}"));
        Ok(())
    }

    async fn resume(&self, guild_id: &str) -> EngineResult<()> {
        self.calls.lock().push(format!("resume {guild_id}"));
        Ok(())
    }

    async fn stop(&self, guild_id: &str) -> EngineResult<()> {
        self.calls.lock().push(format!("stop {guild_id}"));
        Ok(())
    }

    async fn set_volume(&self, guild_id: &str, volume: u32) -> EngineResult<()> {
        self.calls.lock().push(format!("volume {guild_id} {volume}"));
        Ok(())
    }

    async fn search(&self, query: &str) -> EngineResult<Vec<QueueItem>> {
        Ok(vec![QueueItem {
            url: query.to_string(),
            title: query.to_string(),
            duration_ms: None,
            thumbnail: None,
            requester_id: None,
        }])
    }
}

// ── Manager ────────────────────────────────────────────────────────────────

pub struct VoiceManager {
    backend: Arc<dyn VoiceBackend>,
    guilds: Mutex<HashMap<String, GuildVoice>>,
    max_queue_size: usize,
    default_volume: u32,
}

impl VoiceManager {
    pub fn new(backend: Arc<dyn VoiceBackend>, max_queue_size: usize, default_volume: u32) -> Self {
        VoiceManager {
            backend,
            guilds: Mutex::new(HashMap::new()),
            max_queue_size,
            default_volume: default_volume.min(VOICE_VOLUME_MAX),
        }
    }

    fn with_guild<T>(
        &self,
        guild_id: &str,
        f: impl FnOnce(&mut GuildVoice) -> T,
    ) -> EngineResult<T> {
        let mut guilds = self.guilds.lock();
        let state = guilds
            .get_mut(guild_id)
            .ok_or_else(|| EngineError::backend(format!("not connected in guild {guild_id}")))?;
        Ok(f(state))
    }

    pub fn is_connected(&self, guild_id: &str) -> bool {
        self.guilds.lock().contains_key(guild_id)
    }

    pub fn status(&self, guild_id: &str) -> Option<VoiceStatus> {
        let guilds = self.guilds.lock();
        guilds.get(guild_id).map(|g| VoiceStatus {
            channel_id: g.channel_id.clone(),
            current: g.current.clone(),
            queue: g.queue.iter().cloned().collect(),
            volume: g.volume,
            loop_mode: g.loop_mode,
            filters: g.filters.iter().cloned().collect(),
            playing: g.playing,
            paused: g.paused,
            position_ms: g.position_ms(),
        })
    }

    // ── Connection lifecycle ───────────────────────────────────────────

    pub async fn join(
        &self,
        guild_id: &str,
        channel_id: &str,
        self_deaf: bool,
        self_mute: bool,
    ) -> EngineResult<()> {
        self.backend.join(guild_id, channel_id, self_deaf, self_mute).await?;
        let mut guilds = self.guilds.lock();
        guilds
            .entry(guild_id.to_string())
            .or_insert_with(|| GuildVoice::new(channel_id.to_string(), self.default_volume))
            .channel_id = channel_id.to_string();
        Ok(())
    }

    pub async fn leave(&self, guild_id: &str) -> EngineResult<()> {
        self.backend.stop(guild_id).await.ok();
        self.backend.leave(guild_id).await?;
        self.guilds.lock().remove(guild_id);
        Ok(())
    }

    // ── Playback ───────────────────────────────────────────────────────

    /// Play a track immediately, replacing whatever is current.
    pub async fn play(
        &self,
        guild_id: &str,
        item: QueueItem,
        volume: Option<u32>,
        seek_ms: u64,
    ) -> EngineResult<()> {
        let (url, vol, filters) = self.with_guild(guild_id, |g| {
            if let Some(v) = volume {
                g.volume = v.min(VOICE_VOLUME_MAX);
            }
            g.current = Some(item.clone());
            g.playing = true;
            g.paused = false;
            g.start_time = Some(Instant::now() - Duration::from_millis(seek_ms));
            g.paused_at = None;
            (item.url.clone(), g.volume, g.filters.iter().cloned().collect::<Vec<_>>())
        })?;
        self.backend.play(guild_id, &url, vol, seek_ms, &filters).await
    }

    pub async fn pause(&self, guild_id: &str) -> EngineResult<()> {
        self.with_guild(guild_id, |g| {
            if g.playing && !g.paused {
                g.paused = true;
                g.paused_at = Some(Instant::now());
            }
        })?;
        self.backend.pause(guild_id).await
    }

    pub async fn resume(&self, guild_id: &str) -> EngineResult<()> {
        self.with_guild(guild_id, |g| {
            if g.paused {
                if let (Some(start), Some(paused_at)) = (g.start_time, g.paused_at) {
                    g.start_time = Some(start + paused_at.elapsed());
                }
                g.paused = false;
                g.paused_at = None;
            }
        })?;
        self.backend.resume(guild_id).await
    }

    /// Stop playback and clear the queue; stays connected.
    pub async fn stop(&self, guild_id: &str) -> EngineResult<()> {
        self.with_guild(guild_id, |g| {
            g.queue.clear();
            g.current = None;
            g.playing = false;
            g.paused = false;
            g.start_time = None;
            g.paused_at = None;
        })?;
        self.backend.stop(guild_id).await
    }

    /// Skip to the next queued track. The current track is not replayed even
    /// under track loop; queue loop still re-enqueues it.
    pub async fn skip(&self, guild_id: &str) -> EngineResult<Option<QueueItem>> {
        self.backend.stop(guild_id).await.ok();
        self.advance(guild_id, true).await
    }

    pub async fn seek(&self, guild_id: &str, position_ms: u64) -> EngineResult<()> {
        let (url, vol, filters) = self.with_guild(guild_id, |g| {
            g.start_time = Some(Instant::now() - Duration::from_millis(position_ms));
            g.paused = false;
            g.paused_at = None;
            (g.current.as_ref().map(|c| c.url.clone()), g.volume, g.filters.iter().cloned().collect::<Vec<_>>())
        })?;
        let url = url.ok_or_else(|| EngineError::backend("nothing is playing"))?;
        self.backend.play(guild_id, &url, vol, position_ms, &filters).await
    }

    /// Clamp into [0, 200] and apply to the live resource immediately.
    pub async fn set_volume(&self, guild_id: &str, volume: u32) -> EngineResult<u32> {
        let clamped = volume.min(VOICE_VOLUME_MAX);
        self.with_guild(guild_id, |g| g.volume = clamped)?;
        self.backend.set_volume(guild_id, clamped).await?;
        Ok(clamped)
    }

    pub fn set_loop(&self, guild_id: &str, mode: LoopMode) -> EngineResult<()> {
        self.with_guild(guild_id, |g| g.loop_mode = mode)
    }

    /// Replace the filter set. A live track restarts at its playhead with
    /// the new chain.
    pub async fn set_filters(&self, guild_id: &str, filters: Vec<String>) -> EngineResult<()> {
        let restart = self.with_guild(guild_id, |g| {
            let new: BTreeSet<String> = filters.into_iter().collect();
            if new == g.filters {
                return None;
            }
            g.filters = new;
            if g.playing && !g.paused {
                let pos = g.position_ms();
                g.start_time = Some(Instant::now() - Duration::from_millis(pos));
                g.current.as_ref().map(|c| (c.url.clone(), g.volume, pos, g.filters.iter().cloned().collect::<Vec<_>>()))
            } else {
                None
            }
        })?;
        if let Some((url, vol, pos, filters)) = restart {
            self.backend.play(guild_id, &url, vol, pos, &filters).await?;
        }
        Ok(())
    }

    pub async fn search(&self, query: &str) -> EngineResult<Vec<QueueItem>> {
        self.backend.search(query).await
    }

    // ── Queue ──────────────────────────────────────────────────────────

    pub fn add_to_queue(
        &self,
        guild_id: &str,
        item: QueueItem,
        position: QueuePosition,
    ) -> EngineResult<usize> {
        self.with_guild(guild_id, |g| {
            if g.queue.len() >= self.max_queue_size {
                return Err(EngineError::backend("queue is full"));
            }
            match position {
                QueuePosition::Next => g.queue.push_front(item),
                QueuePosition::Last => g.queue.push_back(item),
                QueuePosition::At(i) => {
                    let i = i.min(g.queue.len());
                    g.queue.insert(i, item);
                }
            }
            Ok(g.queue.len())
        })?
    }

    pub fn clear_queue(&self, guild_id: &str) -> EngineResult<usize> {
        self.with_guild(guild_id, |g| {
            let n = g.queue.len();
            g.queue.clear();
            n
        })
    }

    pub fn shuffle_queue(&self, guild_id: &str) -> EngineResult<()> {
        use rand::seq::SliceRandom;
        self.with_guild(guild_id, |g| {
            let mut items: Vec<QueueItem> = g.queue.drain(..).collect();
            items.shuffle(&mut rand::thread_rng());
            g.queue = items.into();
        })
    }

    /// Playhead in milliseconds: frozen while paused, 0 when idle.
    pub fn playback_position(&self, guild_id: &str) -> u64 {
        self.guilds.lock().get(guild_id).map(|g| g.position_ms()).unwrap_or(0)
    }

    // ── Track end ──────────────────────────────────────────────────────

    /// Called when the current resource ends. Applies the loop mode, then
    /// dequeues and plays the next track; idles when the queue is empty.
    /// Returns the track now playing, if any.
    pub async fn handle_track_end(&self, guild_id: &str) -> EngineResult<Option<QueueItem>> {
        self.advance(guild_id, false).await
    }

    async fn advance(&self, guild_id: &str, skip: bool) -> EngineResult<Option<QueueItem>> {
        let next = self.with_guild(guild_id, |g| {
            match g.loop_mode {
                LoopMode::Track if !skip => {
                    // Replay the current track from the top.
                    return g.current.clone();
                }
                LoopMode::Queue => {
                    if let Some(cur) = g.current.take() {
                        g.queue.push_back(cur);
                    }
                }
                _ => {
                    g.current = None;
                }
            }
            g.queue.pop_front()
        })?;

        match next {
            Some(item) => {
                self.play(guild_id, item.clone(), None, 0).await?;
                Ok(Some(item))
            }
            None => {
                self.with_guild(guild_id, |g| {
                    g.current = None;
                    g.playing = false;
                    g.paused = false;
                    g.start_time = None;
                    g.paused_at = None;
                })?;
                Ok(None)
            }
        }
    }
}
