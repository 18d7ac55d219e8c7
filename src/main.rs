use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use carmarket_payments::config::AppConfig;
use carmarket_payments::database::connection::open_ledger;
use carmarket_payments::services::mpesa_service::MpesaService;
use carmarket_payments::services::notifier::log_events;
use carmarket_payments::services::payment_service::PaymentService;
use carmarket_payments::state::AppState;
use carmarket_payments::workers::callback_retry::CallbackRetryWorker;
use carmarket_payments::workers::expiry_sweep::ExpirySweepWorker;
use carmarket_payments::build_router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    tracing::info!("{}", config.get_config_info());

    let ledger = open_ledger(&config)
        .await
        .context("failed to open transaction ledger")?;
    let app_state = initialize_app_state(config, ledger).await?;

    tokio::spawn(log_events(app_state.notifier.subscribe()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = ExpirySweepWorker::new(
        app_state.ledger.clone(),
        app_state.config.payment_expiry,
        app_state.config.sweep_interval,
    );
    let retry = CallbackRetryWorker::new(
        app_state.reconciler.clone(),
        app_state.config.sweep_interval,
    );
    let workers = [
        tokio::spawn(sweep.run(shutdown_rx.clone())),
        tokio::spawn(retry.run(shutdown_rx)),
    ];

    let addr: SocketAddr = format!("{}:{}", app_state.config.host, app_state.config.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let app = build_router(app_state);

    tracing::info!("🚀 Server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    shutdown_tx.send(true).ok();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!("worker did not stop cleanly: {}", e);
        }
    }
    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn initialize_app_state(
    config: AppConfig,
    ledger: Arc<dyn carmarket_payments::database::TransactionLedger>,
) -> anyhow::Result<AppState> {
    let mpesa_config = config.mpesa.clone();
    let mut app_state = AppState::new(config, ledger.clone());

    tracing::info!("🔧 Attempting to initialize M-Pesa service...");
    let Some(mpesa_config) = mpesa_config else {
        tracing::warn!("M-Pesa credentials missing; STK push disabled, callbacks still reconciled");
        return Ok(app_state);
    };

    tracing::info!("📱 Short code: {}", mpesa_config.short_code);
    tracing::info!("🌐 Environment: {}", mpesa_config.environment);
    let mpesa_service =
        Arc::new(MpesaService::new(mpesa_config).context("failed to build M-Pesa client")?);

    // Verify credentials early; a failure here is retried on first use.
    match mpesa_service.get_access_token().await {
        Ok(_) => tracing::info!("✅ M-Pesa access token obtained"),
        Err(e) => tracing::error!("❌ Failed to get M-Pesa access token: {}", e),
    }

    app_state = app_state.with_payments(Arc::new(PaymentService::new(ledger, mpesa_service)));
    tracing::info!("✅ M-Pesa service initialized and ready");
    Ok(app_state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("shutdown signal received");
}
