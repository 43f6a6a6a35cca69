use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use herald_core::HeraldConfig;
use herald_queue::{
    Dispatcher, DispatcherConfig, EmailFilter, EmailScheduler, JobStore, MailTransport, NewEmail,
    RetryPolicy, SqliteJobStore, TemplateStore,
};
use herald_smtp::SmtpMailer;
use serde::Serialize;
use tracing::{info, warn};

mod cli;

use cli::{Cli, Command, TemplateCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays clean JSON.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=info,herald_queue=info,herald_smtp=info".into()),
        )
        .init();

    let args = Cli::parse();

    // load config: --config > HERALD_CONFIG env > ~/.herald/herald.toml
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("HERALD_CONFIG").ok());
    let mut config = HeraldConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        HeraldConfig::default()
    });
    if let Some(db) = args.db {
        config.database.path = db;
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::open(db_path).with_context(|| format!("opening database {db_path}"))?,
    );
    let policy = RetryPolicy::from(&config.retry);

    match args.command {
        Command::Run => run(store, &config, policy).await?,
        Command::SendDue => {
            let dispatcher = Dispatcher::new(
                store,
                smtp_transport(&config)?,
                DispatcherConfig::from(&config.dispatcher),
                policy,
            );
            let report = dispatcher.run_once().await?;
            info!(
                sent = report.sent,
                requeued = report.requeued,
                failed = report.failed,
                "cycle complete"
            );
            print_json(&report)?;
        }
        Command::Schedule {
            user,
            org,
            to,
            subject,
            body,
            html,
            at,
            max_retries,
        } => {
            let scheduler = EmailScheduler::new(store);
            let id = scheduler.schedule_email(NewEmail {
                user_id: user,
                organization_id: org,
                recipients: to,
                subject,
                body,
                html_body: html,
                scheduled_at: at,
                max_retries: max_retries.unwrap_or(config.retry.default_max_retries),
                ..Default::default()
            })?;
            print_json(&serde_json::json!({ "id": id }))?;
        }
        Command::Status { id } => {
            let scheduler = EmailScheduler::new(store);
            print_json(&scheduler.get_email_status(&id)?)?;
        }
        Command::Cancel { id } => {
            let scheduler = EmailScheduler::new(store);
            let cancelled = scheduler.cancel_email(&id)?;
            print_json(&serde_json::json!({ "id": id, "cancelled": cancelled }))?;
        }
        Command::Stats { org } => {
            let scheduler = EmailScheduler::new(store);
            let stats = match org.as_deref() {
                Some(org) => scheduler.get_organization_stats(org)?,
                None => scheduler.get_queue_stats()?,
            };
            print_json(&stats)?;
        }
        Command::List {
            status,
            user,
            org,
            limit,
        } => {
            let scheduler = EmailScheduler::new(store);
            let emails = scheduler.list_emails(&EmailFilter {
                status,
                user_id: user,
                organization_id: org,
                limit: Some(limit),
            })?;
            print_json(&emails)?;
        }
        Command::Reconcile { grace_secs } => {
            let scheduler = EmailScheduler::new(store).with_retry_policy(policy);
            let grace =
                Duration::from_secs(grace_secs.unwrap_or(config.dispatcher.stale_after_secs));
            print_json(&scheduler.reconcile_stale(grace)?)?;
        }
        Command::Template { action } => {
            let templates = TemplateStore::open(db_path)?;
            match action {
                TemplateCommand::Add {
                    user,
                    org,
                    name,
                    subject,
                    body,
                    html,
                    var,
                } => {
                    let template = templates.create(
                        &user,
                        &org,
                        &name,
                        &subject,
                        &body,
                        html.as_deref(),
                        &var,
                    )?;
                    print_json(&template)?;
                }
                TemplateCommand::Get { id } => {
                    let template = templates
                        .get(&id)?
                        .with_context(|| format!("template {id} not found"))?;
                    print_json(&template)?;
                }
                TemplateCommand::List { user } => {
                    print_json(&templates.list_for_owner(&user)?)?;
                }
            }
        }
    }

    Ok(())
}

/// Start the dispatcher and block until Ctrl-C, then drain.
async fn run(
    store: Arc<dyn JobStore>,
    config: &HeraldConfig,
    policy: RetryPolicy,
) -> anyhow::Result<()> {
    let transport = smtp_transport(config)?;
    let dispatcher_config = DispatcherConfig::from(&config.dispatcher);
    let drain = Duration::from_secs(config.dispatcher.drain_timeout_secs);
    let scheduler = EmailScheduler::start(store, transport, dispatcher_config, policy);

    let stats = scheduler.get_queue_stats()?;
    info!(
        pending = stats.pending,
        overdue = stats.overdue,
        processing = stats.processing,
        "Herald dispatcher running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("shutdown signal received");
    scheduler.shutdown(drain).await;
    Ok(())
}

fn smtp_transport(config: &HeraldConfig) -> anyhow::Result<Arc<dyn MailTransport>> {
    let smtp = config
        .smtp
        .as_ref()
        .context("no [smtp] section configured; sending needs a mail transport")?;
    Ok(Arc::new(SmtpMailer::from_config(smtp)?))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
