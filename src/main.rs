use anyhow::{bail, Context, Result};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use officeq::backends::phaser::{self, PhaseOutOptions};
use officeq::backends::BackendRegistry;
use officeq::config::AppConfig;
use officeq::notify::{NotificationDispatcher, SmsSender, TwilioSender};
use officeq::realtime::UpdatePublisher;
use officeq::shared::state::AppState;
use officeq::shared::utils::{create_pool, run_migrations, DbPool};
use officeq::{backends, meetings, queues, realtime, users};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let pool = create_pool(&config.database_url)?;
    run_migrations(&pool)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => serve(config, pool).await,
        Some("create-user") => create_user(&pool, &args[1..]),
        Some("phase-out") => phase_out(&config, &pool, &args[1..]),
        Some(other) => bail!("unknown command {other:?}; expected create-user or phase-out"),
    }
}

async fn serve(config: AppConfig, pool: DbPool) -> Result<()> {
    let registry = Arc::new(BackendRegistry::from_config(&config, &pool)?);
    tracing::info!(backends = ?registry.enabled_names(), default = registry.default_backend(),
        "meeting backends ready");

    let sender = config
        .twilio
        .clone()
        .map(|twilio| Arc::new(TwilioSender::new(twilio)) as Arc<dyn SmsSender>);
    if sender.is_none() {
        tracing::warn!("Twilio is not configured; SMS notifications are disabled");
    }
    let notifier = Arc::new(NotificationDispatcher::new(
        sender,
        config.public_base_url.clone(),
    ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState {
        conn: pool,
        config,
        registry,
        publisher: Arc::new(UpdatePublisher::new()),
        notifier,
    });

    let app = Router::new()
        .merge(backends::router())
        .merge(queues::router())
        .merge(meetings::router())
        .merge(users::router())
        .merge(realtime::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}

fn create_user(pool: &DbPool, args: &[String]) -> Result<()> {
    let (username, email) = match args {
        [username, email] => (username, email),
        _ => bail!("usage: officeq create-user <username> <email>"),
    };
    let mut conn = pool.get()?;
    let (user, token) = users::create_user(&mut conn, username, email)
        .map_err(|err| anyhow::anyhow!("failed to create user: {err}"))?;
    println!("created user {} ({})", user.username, user.id);
    println!("api token: {token}");
    Ok(())
}

fn phase_out(config: &AppConfig, pool: &DbPool, args: &[String]) -> Result<()> {
    let Some(backend) = args.first() else {
        bail!("usage: officeq phase-out <backend> [--dry-run] [--delete-started]");
    };
    let mut options = PhaseOutOptions::default();
    for flag in &args[1..] {
        match flag.as_str() {
            "--dry-run" => options.dry_run = true,
            "--delete-started" => options.delete_started = true,
            other => bail!("unknown flag {other:?}"),
        }
    }

    let registry = BackendRegistry::from_config(config, pool)?;
    let mut conn = pool.get()?;
    let report = phaser::phase_out(&mut conn, &registry, backend, options)
        .map_err(|err| anyhow::anyhow!("phase-out failed: {err}"))?;
    println!(
        "queues scrubbed: {}, meetings reassigned: {}, meetings deleted: {}, failures: {}{}",
        report.queues_scrubbed,
        report.meetings_reassigned,
        report.meetings_deleted,
        report.failures,
        if options.dry_run { " (dry run)" } else { "" },
    );
    Ok(())
}
