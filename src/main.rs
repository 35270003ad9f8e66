use std::sync::Arc;

use anyhow::Context;

use ai_concierge::channels::{
    ChannelRegistry, EmailChannel, EmailConfig, SmsChannel, SmsConfig, WebChannel,
    WhatsAppChannel, WhatsAppConfig,
};
use ai_concierge::config::AgentConfig;
use ai_concierge::llm::{LlmConfig, create_provider};
use ai_concierge::pipeline::{Normalizer, TriageRouter};
use ai_concierge::server::{AppState, app};
use ai_concierge::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing; the guard flushes buffered logs on exit
    let (writer, _log_guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(writer)
        .init();

    let config = AgentConfig::from_env().context("Invalid agent configuration")?;
    let llm_config = LlmConfig::from_env().context("Invalid LLM configuration")?;
    let llm = create_provider(&llm_config)?;

    let bind_addr =
        std::env::var("CONCIERGE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    eprintln!("🤖 AI Concierge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {}", config.name);
    eprintln!("   Model: {}", llm_config.model);
    eprintln!(
        "   Onboarding fields: {}",
        config
            .fields
            .iter()
            .map(|f| f.field_key.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("CONCIERGE_DB_PATH").unwrap_or_else(|_| "./data/concierge.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("Failed to open database at {db_path}"))?,
    );
    eprintln!("   Database: {}", db_path);

    // ── Channels ─────────────────────────────────────────────────────────
    let web = WebChannel::new();
    let mut channels = ChannelRegistry::new().with(Arc::new(web.clone()));
    let mut active_channels = vec!["web"];

    if let Some(whatsapp) = WhatsAppConfig::from_env() {
        channels.register(Arc::new(WhatsAppChannel::new(whatsapp)));
        active_channels.push("whatsapp");
    }
    if let Some(sms) = SmsConfig::from_env() {
        channels.register(Arc::new(SmsChannel::new(sms)));
        active_channels.push("sms");
    }
    if let Some(email) = EmailConfig::from_env() {
        eprintln!("   Email: SMTP {}:{}", email.smtp_host, email.smtp_port);
        channels.register(Arc::new(EmailChannel::new(email)));
        active_channels.push("email");
    }
    eprintln!("   Channels: {}", active_channels.join(", "));

    // ── Server ───────────────────────────────────────────────────────────
    let state = AppState {
        normalizer: Arc::new(Normalizer::new(&config)),
        router: Arc::new(TriageRouter::new(&config, db, channels, llm)),
    };
    let app = app(state, &web);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    eprintln!("   Listening: http://{}\n", bind_addr);
    tracing::info!(addr = %bind_addr, "Concierge server started");

    axum::serve(listener, app).await?;
    Ok(())
}
