// Weft Engine — Action Executor
//
// One handler per leaf verb. Every action goes through here after its
// parameters have been interpolated; flow-control verbs never reach this
// dispatch (the flow engine owns them).

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::actions;
use crate::engine::builders::TemplateRegistry;
use crate::engine::client::PlatformClient;
use crate::engine::context::{ActionContext, SyntheticEvent};
use crate::engine::state::StateManager;
use crate::engine::storage::StorageAdapter;
use crate::engine::timers::TimerManager;
use crate::engine::voice::VoiceManager;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub struct Executor {
    pub client: Arc<dyn PlatformClient>,
    pub storage: Arc<dyn StorageAdapter>,
    pub state: Arc<StateManager>,
    pub voice: Arc<VoiceManager>,
    pub timers: Arc<TimerManager>,
    pub templates: Arc<TemplateRegistry>,
    pub events_tx: UnboundedSender<SyntheticEvent>,
}

impl Executor {
    /// Dispatch one leaf verb to its handler. Parameters arrive fully
    /// interpolated. Verbs nobody registered fail with a normalization
    /// error, which the flow layer records as a failed action result.
    pub async fn execute_leaf(
        &self,
        verb: &str,
        params: &Map<String, Value>,
        ctx: &mut ActionContext,
    ) -> EngineResult<Value> {
        log::debug!("[executor] {verb}");
        match verb {
            // ── Messaging ──
            "reply" => actions::messaging::reply(self, params, ctx).await,
            "send_message" => actions::messaging::send_message(self, params, ctx).await,
            "send_dm" => actions::messaging::send_dm(self, params, ctx).await,
            "edit_message" => actions::messaging::edit_message(self, params, ctx).await,
            "delete_message" => actions::messaging::delete_message(self, params, ctx).await,
            "bulk_delete" => actions::messaging::bulk_delete(self, params, ctx).await,
            "defer" => actions::messaging::defer(self, params, ctx).await,
            "create_thread" => actions::messaging::create_thread(self, params, ctx).await,
            // ── Moderation ──
            "kick" => actions::moderation::kick(self, params, ctx).await,
            "ban" => actions::moderation::ban(self, params, ctx).await,
            "unban" => actions::moderation::unban(self, params, ctx).await,
            "timeout" => actions::moderation::timeout(self, params, ctx).await,
            "add_role" => actions::moderation::add_role(self, params, ctx).await,
            "remove_role" => actions::moderation::remove_role(self, params, ctx).await,
            // ── Voice ──
            "voice_join" => actions::voice::join(self, params, ctx).await,
            "voice_leave" => actions::voice::leave(self, params, ctx).await,
            "voice_play" => actions::voice::play(self, params, ctx).await,
            "voice_search" => actions::voice::search(self, params, ctx).await,
            "voice_pause" => actions::voice::pause(self, params, ctx).await,
            "voice_resume" => actions::voice::resume(self, params, ctx).await,
            "voice_skip" => actions::voice::skip(self, params, ctx).await,
            "voice_stop" => actions::voice::stop(self, params, ctx).await,
            "voice_seek" => actions::voice::seek(self, params, ctx).await,
            "voice_filter" => actions::voice::filter(self, params, ctx).await,
            "voice_volume" => actions::voice::volume(self, params, ctx).await,
            "voice_loop" => actions::voice::set_loop(self, params, ctx).await,
            "queue_add" => actions::voice::queue_add(self, params, ctx).await,
            "queue_clear" => actions::voice::queue_clear(self, params, ctx).await,
            "queue_shuffle" => actions::voice::queue_shuffle(self, params, ctx).await,
            // ── State ──
            "set" => actions::state::set(self, params, ctx).await,
            "set_variable" => actions::state::set_variable(self, params, ctx).await,
            "increment" => actions::state::increment(self, params, ctx).await,
            "db_insert" => actions::state::db_insert(self, params, ctx).await,
            "db_query" => actions::state::db_query(self, params, ctx).await,
            "db_update" => actions::state::db_update(self, params, ctx).await,
            "db_delete" => actions::state::db_delete(self, params, ctx).await,
            // ── Control feedback ──
            "log" => actions::control::log_action(self, params, ctx).await,
            "emit" => actions::control::emit(self, params, ctx).await,
            "timer_create" => actions::control::timer_create(self, params, ctx).await,
            "timer_cancel" => actions::control::timer_cancel(self, params, ctx).await,
            other => Err(EngineError::normalization(format!("unknown action verb '{other}'"))),
        }
    }
}
