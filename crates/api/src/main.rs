use api::{build_router, AppContext};
use api::ws::{ConnectionLimiter, RateLimiter};
use config::{LoggingConfig, RenfieldConfig};
use database::{
    PgChunkSearchRepository, PgConversationRepository, PgDeviceRepository, PgMemoryRepository,
    PgOutputDeviceRepository, PgRoomRepository, PgSettingsRepository,
};
use integrations::{
    HomeAssistantClient, HomeController, HttpSttClient, HttpToolServer, HttpTtsClient, LlmClient,
    OllamaClient, SttClient, ToolServerClient, TtsClient,
};
use services::common::CircuitBreaker;
use services::conversations::ConversationStore;
use services::memory::MemoryService;
use services::output::TtsAudioCache;
use services::tools::{InternalTools, RemoteTools, ToolRegistry};
use services::{
    AudioOutputService, AudioPipeline, DeviceRegistry, IntentRouter, OutputRouter,
    PresenceService, RetrievalEngine, RoomService, TurnCoordinator, WakeWordBroadcaster,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    // Load configuration first to get logging settings
    let config = RenfieldConfig::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Application cannot start without a valid configuration file.");
        std::process::exit(1);
    });
    let config = Arc::new(config);

    init_tracing(&config.logging);
    tracing::info!("Renfield server starting");

    // Database pool + migrations
    let pool = database::create_pool(&config.database)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Database connection failed: {}", e);
            std::process::exit(1);
        });
    if let Err(e) = database::migrations::run(&pool).await {
        tracing::error!("Migrations failed: {}", e);
        std::process::exit(1);
    }

    // Repositories
    let room_repo = Arc::new(PgRoomRepository::new(pool.clone()));
    let device_repo = Arc::new(PgDeviceRepository::new(pool.clone()));
    let output_repo = Arc::new(PgOutputDeviceRepository::new(pool.clone()));
    let conversation_repo = Arc::new(PgConversationRepository::new(pool.clone()));
    let chunk_repo = Arc::new(PgChunkSearchRepository::new(pool.clone(), &config.retrieval));
    let memory_repo = Arc::new(PgMemoryRepository::new(pool.clone()));
    let settings_repo = Arc::new(PgSettingsRepository::new(pool.clone()));

    // Collaborator clients
    let llm: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(&config.llm).unwrap_or_else(|e| {
        tracing::error!("Failed to build LLM client: {}", e);
        std::process::exit(1);
    }));
    let stt: Arc<dyn SttClient> = Arc::new(HttpSttClient::new(&config.stt).unwrap_or_else(|e| {
        tracing::error!("Failed to build STT client: {}", e);
        std::process::exit(1);
    }));
    let tts: Arc<dyn TtsClient> = Arc::new(HttpTtsClient::new(&config.tts).unwrap_or_else(|e| {
        tracing::error!("Failed to build TTS client: {}", e);
        std::process::exit(1);
    }));
    let controller: Arc<dyn HomeController> = Arc::new(
        HomeAssistantClient::new(&config.home_assistant).unwrap_or_else(|e| {
            tracing::error!("Failed to build home-automation client: {}", e);
            std::process::exit(1);
        }),
    );

    // Circuit breakers guarding the collaborators
    let llm_breaker = Arc::new(CircuitBreaker::new("llm", &config.llm.circuit_breaker));
    let stt_breaker = Arc::new(CircuitBreaker::new("stt", &config.stt.circuit_breaker));
    let tts_breaker = Arc::new(CircuitBreaker::new("tts", &config.tts.circuit_breaker));

    // Core services
    let registry = Arc::new(DeviceRegistry::new(&config.audio, &config.session));
    let rooms = Arc::new(RoomService::new(
        room_repo.clone(),
        device_repo.clone(),
        &config.rooms,
    ));
    let presence = Arc::new(PresenceService::new(&config.presence));

    let broadcaster = Arc::new(WakeWordBroadcaster::new(settings_repo, &config.wakeword));
    if let Err(e) = broadcaster.load().await {
        tracing::warn!("Could not load wake-word config, using defaults: {}", e);
    }

    let retrieval = Arc::new(RetrievalEngine::new(
        llm.clone(),
        chunk_repo,
        &config.retrieval,
    ));
    let memory = Arc::new(MemoryService::new(
        llm.clone(),
        memory_repo,
        &config.memory,
        &config.llm,
    ));
    let conversations = Arc::new(ConversationStore::new(conversation_repo));

    let output_router = Arc::new(OutputRouter::new(
        output_repo,
        controller.clone(),
        registry.clone(),
    ));
    let tts_cache = Arc::new(TtsAudioCache::new(Duration::from_secs(300)));
    let audio_output = Arc::new(AudioOutputService::new(
        controller.clone(),
        registry.clone(),
        tts_cache.clone(),
        &config.server,
        &config.audio,
    ));

    // Tool registry: internal tools plus one executor per remote server
    let mut tool_registry = ToolRegistry::new();
    tool_registry.register(Arc::new(InternalTools::new(
        rooms.clone(),
        output_router.clone(),
        controller.clone(),
        presence.clone(),
        retrieval.clone(),
    )));
    for server_config in &config.tool_servers {
        match HttpToolServer::new(server_config) {
            Ok(server) => {
                let server: Arc<dyn ToolServerClient> = Arc::new(server);
                tool_registry.register(Arc::new(RemoteTools::new(server)));
            }
            Err(e) => {
                tracing::warn!(server = %server_config.name, "Tool server skipped: {}", e);
            }
        }
    }
    let tool_registry = Arc::new(tool_registry);

    let router = Arc::new(IntentRouter::new(
        llm.clone(),
        tool_registry,
        retrieval.clone(),
        memory.clone(),
        llm_breaker,
        &config.llm,
        &config.agent,
        &config.retrieval,
    ));

    let pipeline = Arc::new(AudioPipeline::new(
        registry.clone(),
        stt,
        stt_breaker,
        &config.stt,
        &config.audio,
    ));

    let turns = Arc::new(TurnCoordinator::new(
        registry.clone(),
        pipeline,
        router,
        retrieval,
        conversations,
        memory,
        presence.clone(),
        tts,
        tts_breaker,
        output_router,
        audio_output,
        &config,
    ));

    // Import controller areas as rooms in the background; startup must not
    // block on a slow or absent controller
    {
        let rooms = rooms.clone();
        let controller = controller.clone();
        tokio::spawn(async move {
            match rooms.import_areas(controller.as_ref()).await {
                Ok((created, linked)) => {
                    tracing::info!(created, linked, "Controller areas imported")
                }
                Err(e) => tracing::warn!("Controller area import failed: {}", e),
            }
        });
    }

    let ctx = AppContext {
        config: config.clone(),
        registry,
        rooms,
        turns: turns.clone(),
        broadcaster,
        presence,
        tts_cache,
        connection_limiter: Arc::new(ConnectionLimiter::new(&config.limits)),
        rate_limiter: Arc::new(RateLimiter::new(&config.limits)),
    };

    let app = build_router(ctx);
    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_address).await.unwrap();

    tracing::info!(address = %bind_address, "Server started successfully");
    tracing::info!(
        "Authentication: {}",
        if config.auth.enabled {
            "ENABLED"
        } else {
            "DISABLED"
        }
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    // Let fire-and-forget background work (memory extraction) finish
    turns.drain_background().await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}

fn init_tracing(logging_config: &LoggingConfig) {
    // Build the filter string from the logging configuration
    let mut filter = logging_config.level.clone();

    for (module, level) in &logging_config.modules {
        filter.push_str(&format!(",{}={}", module, level));
    }

    // Initialize tracing based on the format specified in config
    match logging_config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .compact()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .init();
        }
    }
}
