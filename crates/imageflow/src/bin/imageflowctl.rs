use imageflow::db;
use imageflow::jobs::{JobId, JobStore, JobsRepo};
use imageflow::queue::{PgWorkQueue, QueueSettings, WorkQueue, DEFAULT_QUEUE};
use imageflow::submit::submit;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::env;
use std::path::Path;

const USAGE: &str = "imageflowctl <command>\n\
     Commands:\n\
     - migrate\n\
     - reset\n\
     - submit <path> <email>\n\
     - publish <job_id>\n\
     - status <job_id>\n\
     - counts\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL; IMAGEFLOW_QUEUE picks the queue.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new().max_connections(2).connect(&url).await?;

    let queue_name = env::var("IMAGEFLOW_QUEUE")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
    let store = JobsRepo::new(pool.clone());
    let queue = PgWorkQueue::new(
        pool.clone(),
        QueueSettings {
            queue: queue_name,
            ..QueueSettings::default()
        },
    );

    match command.as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "reset" => reset(&pool).await?,
        "submit" => {
            let (Some(path), Some(email)) = (args.get(2), args.get(3)) else {
                anyhow::bail!("usage: imageflowctl submit <path> <email>");
            };
            let job_id = submit(&store, &queue, Path::new(path), email).await?;
            println!("submitted job {job_id}");
        }
        "publish" => {
            let job_id = job_id_arg(&args, "publish")?;
            let Some(job) = store.get(job_id).await? else {
                anyhow::bail!("job {job_id} not found");
            };
            if job.status.is_terminal() {
                anyhow::bail!("job {job_id} is already {}; nothing to publish", job.status);
            }
            queue.publish(job_id).await?;
            println!("published job {job_id}");
        }
        "status" => {
            let job_id = job_id_arg(&args, "status")?;
            match store.get(job_id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => println!("job {job_id} not found"),
            }
        }
        "counts" => {
            let counts = store.status_counts().await?;
            let depth = queue.depth().await?;
            println!(
                "jobs: uploaded={} converted={} failed={}\nmessages: ready={} in_flight={}",
                counts.uploaded, counts.converted, counts.failed, depth.ready, depth.in_flight
            );
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn job_id_arg(args: &[String], command: &str) -> anyhow::Result<JobId> {
    let raw = args
        .get(2)
        .ok_or_else(|| anyhow::anyhow!("usage: imageflowctl {command} <job_id>"))?;
    Ok(raw.parse()?)
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            queue_messages,
            images
        RESTART IDENTITY
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}
