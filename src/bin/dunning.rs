/// Run one dunning job (or the registration purge) immediately, outside the API process.
/// Useful from an external scheduler or to replay a missed run.
///
/// Usage: dunning <JOB> [--list]
///   JOB     : overdue_first_notice | overdue_final_notice | payment_reminder |
///             payment_reminder_second | registration_purge
///   --list  : Print the configured schedules and their next run, then exit

use chrono::Utc;
use clap::Parser;

use academy_api::{
    build_dunning_runner, build_notifier,
    config::Config,
    db,
    services::{dunning::CronJob, scheduler},
};

#[derive(Parser)]
#[command(name = "dunning", about = "Run academy dunning and purge jobs once")]
struct Args {
    /// Job to run
    #[arg(required_unless_present = "list")]
    job: Option<CronJob>,

    /// Show the configured schedules instead of running a job
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    if args.list {
        for info in scheduler::describe(&config.cron, Utc::now()) {
            match (info.next_run, info.error) {
                (_, Some(error)) => println!("{:<24} {:<16} invalid: {error}", info.job, info.expression),
                (Some(next), None) => println!("{:<24} {:<16} next {next}", info.job, info.expression),
                (None, None) => println!("{:<24} {:<16} never fires", info.job, info.expression),
            }
        }
        return Ok(());
    }
    let Some(job) = args.job else {
        anyhow::bail!("a job name is required");
    };

    let pool = db::create_pool(&config.database_url).await?;
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let runner = build_dunning_runner(&pool, redis_client, build_notifier(&config));

    tracing::info!(job = job.as_str(), "Starting job...");
    let report = runner.run(job, Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
