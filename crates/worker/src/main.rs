use imageflow::api;
use imageflow::config::Config;
use imageflow::convert::PngConverter;
use imageflow::db;
use imageflow::jobs::{JobStore, JobsRepo};
use imageflow::notify::{DisabledNotifier, Notifier, SmtpNotifier};
use imageflow::queue::{PgWorkQueue, WorkQueue};
use imageflow::runner::JobRunner;
use imageflow::telemetry;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    telemetry::init_tracing(cfg.log_json);

    tracing::info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        workers = cfg.workers,
        lease_seconds = cfg.lease_seconds,
        convert_timeout_seconds = cfg.convert_timeout_seconds,
        converted_folder = %cfg.converted_folder.display(),
        api = %cfg.admin_addr.as_deref().unwrap_or("disabled"),
        email = cfg.email.is_some(),
        migrate_on_startup = cfg.migrate_on_startup,
        "imageflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url, cfg.pool).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }
    let queue_pool = if cfg.queue_database_url == cfg.database_url {
        pool.clone()
    } else {
        let queue_pool = db::make_pool(&cfg.queue_database_url, cfg.pool).await?;
        if cfg.migrate_on_startup {
            db::run_migrations(&queue_pool).await?;
        }
        queue_pool
    };

    let store: Arc<dyn JobStore> = Arc::new(JobsRepo::new(pool));
    let queue: Arc<dyn WorkQueue> = Arc::new(PgWorkQueue::new(queue_pool, cfg.queue_settings()));
    let converter = Arc::new(PngConverter::new(cfg.converted_folder.clone()));
    let notifier: Arc<dyn Notifier> = match cfg.email.clone() {
        Some(email) => Arc::new(SmtpNotifier::new(email)?),
        None => {
            tracing::warn!("SMTP_SERVER not set, completion emails are disabled");
            Arc::new(DisabledNotifier)
        }
    };

    let runner = JobRunner::new(
        store.clone(),
        queue.clone(),
        converter,
        notifier,
        cfg.runner_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = JoinSet::new();
    for i in 0..cfg.workers {
        let consumer = if cfg.workers == 1 {
            cfg.worker_id.clone()
        } else {
            format!("{}-{}", cfg.worker_id, i + 1)
        };
        let runner = runner.with_consumer_id(consumer);
        let shutdown = shutdown_rx.clone();
        loops.spawn(async move { runner.run(shutdown).await });
    }

    // ---- API task ----
    if let Some(addr) = cfg.admin_addr.clone() {
        let app = api::router(api::ApiState {
            store,
            queue,
            queue_name: cfg.queue.clone(),
        });
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "admin api listening");

        let mut api_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "admin api stopped");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, finishing in-flight messages");
    shutdown_tx.send_replace(true);

    while let Some(joined) = loops.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "worker loop panicked");
        }
    }

    tracing::info!("imageflow worker stopped");
    Ok(())
}
