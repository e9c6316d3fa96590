// weft — run a declarative bot spec against Discord.
//
//   weft <spec.yaml>            connect and run (token from DISCORD_TOKEN)
//   weft --dry-run <spec.yaml>  validate, register against a recording
//                               client, simulate ready, and exit
//
// Storage: WEFT_DB selects the SQLite file (default weft.db next to the
// spec); WEFT_DB=:memory: keeps everything in process.

use std::path::PathBuf;
use std::sync::Arc;

use weft::engine::client::{derive_intents, NullClient, PlatformClient};
use weft::engine::gateway::{DiscordClient, GatewayBridge};
use weft::engine::runtime::Engine;
use weft::engine::spec;
use weft::engine::storage::memory::MemoryStorage;
use weft::engine::storage::sqlite::SqliteStorage;
use weft::engine::storage::StorageAdapter;
use weft::engine::voice::NullVoiceBackend;
use weft::EngineResult;

fn usage() -> ! {
    eprintln!("usage: weft [--dry-run] <spec.yaml>");
    std::process::exit(2);
}

fn open_storage(spec_path: &std::path::Path) -> EngineResult<Arc<dyn StorageAdapter>> {
    let db = std::env::var("WEFT_DB").unwrap_or_else(|_| {
        spec_path.with_extension("db").to_string_lossy().into_owned()
    });
    if db == ":memory:" {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    Ok(Arc::new(SqliteStorage::open(&PathBuf::from(db))?))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut dry_run = false;
    let mut spec_arg: Option<String> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "-h" | "--help" => usage(),
            other if spec_arg.is_none() => spec_arg = Some(other.to_string()),
            _ => usage(),
        }
    }
    let Some(spec_arg) = spec_arg else { usage() };
    let spec_path = PathBuf::from(&spec_arg);

    if let Err(e) = run(&spec_path, dry_run).await {
        log::error!("[weft] Fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(spec_path: &std::path::Path, dry_run: bool) -> EngineResult<()> {
    let doc = spec::load_spec(spec_path)?;
    log::info!(
        "[weft] Loaded spec '{}': {} command(s), {} event handler(s), {} flow(s), {} job(s), {} rule(s)",
        doc.identity.name,
        doc.commands.len(),
        doc.events.len(),
        doc.flows.len(),
        doc.scheduler.jobs.len(),
        doc.automod.rules.len(),
    );
    let intents = derive_intents(&doc);
    let storage = open_storage(spec_path)?;

    if dry_run {
        let client = Arc::new(NullClient::new());
        let engine = Arc::new(
            Engine::new(doc, client.clone(), storage, Arc::new(NullVoiceBackend::default()))
                .await?,
        );
        engine.start().await?;
        log::info!(
            "[weft] Dry run complete: intents=0b{intents:b}, {} outbound call(s) recorded",
            client.calls().len()
        );
        engine.stop();
        return Ok(());
    }

    let token = std::env::var("DISCORD_TOKEN")
        .map_err(|_| weft::EngineError::Other("DISCORD_TOKEN is not set".into()))?;
    let client = Arc::new(DiscordClient::new(token));
    let engine = Arc::new(
        Engine::new(
            doc,
            client.clone() as Arc<dyn PlatformClient>,
            storage,
            Arc::new(NullVoiceBackend::default()),
        )
        .await?,
    );

    let bridge = Arc::new(GatewayBridge::new(client, engine.clone(), intents));

    // Command registration and presence need the application id from READY;
    // give the first session a moment before pushing them.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            if let Err(e) = engine.start().await {
                log::error!("[weft] Startup registration failed: {e}");
            }
        });
    }

    let runner = bridge.clone();
    let result = runner.run().await;
    engine.stop();
    result
}
