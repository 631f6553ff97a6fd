use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coldmail::backend::{self, Clients};
use coldmail::batch::{BatchRun, RunOptions};
use coldmail::config::Config;
use coldmail::history::HistoryStore;
use coldmail::quota::{self, DailyQuota};
use coldmail::recipients::RecipientTable;
use coldmail::report::{self, RunSummary};
use coldmail::session::Session;
use coldmail::template;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "coldmail", version, about = "Send personalised cold emails from a CSV")]
struct Cli {
    /// Human-readable logs instead of JSON
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send the batch, skipping recipients already in history
    Send {
        #[arg(long)]
        session: PathBuf,
        #[arg(long)]
        recipients: PathBuf,
        /// Write the result log to this CSV file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Render messages without sending
    Preview {
        #[arg(long)]
        session: PathBuf,
        #[arg(long)]
        recipients: PathBuf,
        #[arg(long, default_value_t = 3)]
        limit: usize,
    },
    /// Report rows with empty template values
    Analyze {
        #[arg(long)]
        session: PathBuf,
        #[arg(long)]
        recipients: PathBuf,
    },
    /// Show how many recipients have been sent to
    History {
        /// Delete all send history
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.pretty {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }

    match cli.command {
        Command::Send {
            session,
            recipients,
            out,
        } => send(session, recipients, out).await,
        Command::Preview {
            session,
            recipients,
            limit,
        } => preview(session, recipients, limit),
        Command::Analyze {
            session,
            recipients,
        } => analyze(session, recipients),
        Command::History { clear } => history(clear).await,
    }
}

fn load_inputs(session: PathBuf, recipients: PathBuf) -> Result<(Session, RecipientTable)> {
    let session = Session::load(session)?;
    let table = RecipientTable::from_csv_path(recipients, &session.email_column)?;
    Ok((session, table))
}

async fn send(session: PathBuf, recipients: PathBuf, out: Option<PathBuf>) -> Result<()> {
    let config = Config::from_env()?;
    let (session, table) = load_inputs(session, recipients)?;
    let attachments = session.load_attachments()?;

    let clients = Clients::new(&config).await;
    let history = backend::build_history(&config, &clients).await?;
    let mailer = backend::build_mailer(&config, &clients).await?;
    let mut quota =
        DailyQuota::load_or_new(&config.quota_state_path, config.daily_limit, quota::today())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current recipient");
                cancel.cancel();
            }
        });
    }

    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id);
    info!(
        parent: &span,
        recipients = table.len(),
        remaining_quota = quota.remaining(),
        "Starting batch"
    );

    let options = RunOptions {
        send_interval: config.send_interval,
        cancel,
        attachments,
    };
    let mut run = BatchRun::new(
        &session,
        &table.records,
        &mut quota,
        &history,
        &mailer,
        options,
    )?;

    let mut outcomes = Vec::with_capacity(table.len());
    let mut summary = RunSummary::default();
    while let Some(outcome) = run.next().instrument(span.clone()).await {
        println!(
            "[{}/{}] {} {}{}",
            outcomes.len() + 1,
            table.len(),
            outcome.status,
            outcome.email,
            outcome
                .detail
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );
        summary.add(&outcome);
        outcomes.push(outcome);
    }
    let remaining_quota = run.remaining_quota();
    drop(run);

    let pending = table.len() - outcomes.len();
    info!(
        parent: &span,
        sent = summary.sent,
        failed = summary.failed,
        skipped = summary.skipped,
        quota_exceeded = summary.quota_exceeded,
        pending,
        remaining_quota,
        "Batch finished"
    );
    println!("{}", summary);
    if pending > 0 {
        println!("{} recipients not reached; run again to continue", pending);
    }

    if let Some(path) = out {
        report::write_csv_path(&outcomes, &path)?;
        println!("Results written to {}", path.display());
    }

    Ok(())
}

fn preview(session: PathBuf, recipients: PathBuf, limit: usize) -> Result<()> {
    let (session, table) = load_inputs(session, recipients)?;
    template::validate(
        &session.template,
        &session.binding,
        &session.empty_values,
        table.column_names(),
    )
    .context("Template does not match the recipient columns")?;

    for path in &session.attachments {
        println!("Attachment: {}", path.display());
    }
    for record in table.records.iter().take(limit) {
        let rendered = template::render(
            &session.template,
            &session.binding,
            record,
            &session.empty_values,
        )
        .with_context(|| format!("Failed to render message for {}", record.email))?;
        println!("To: {}", record.email);
        println!("Subject: {}", rendered.subject);
        if let Some(note) = rendered.note() {
            println!("Note: {}", note);
        }
        println!();
        println!("{}", rendered.body);
        println!("{}", "-".repeat(60));
    }
    Ok(())
}

fn analyze(session: PathBuf, recipients: PathBuf) -> Result<()> {
    let (session, table) = load_inputs(session, recipients)?;
    let analysis = table.analyze(&session.variables(), &session.binding);

    println!("Rows:            {}", analysis.total);
    println!("Complete:        {}", analysis.complete);
    println!("With empty data: {}", analysis.has_empty);
    println!("Without email:   {}", analysis.no_email);
    for detail in &analysis.empty_details {
        println!(
            "  row {}: {} missing {}",
            detail.row,
            detail.email,
            detail.empty_variables.join(", ")
        );
    }
    Ok(())
}

async fn history(clear: bool) -> Result<()> {
    let config = Config::from_env()?;
    let clients = Clients::new(&config).await;
    let history = backend::build_history(&config, &clients).await?;

    if clear {
        history.clear().await?;
        println!("Send history cleared");
    } else {
        println!("{} recipients marked as sent", history.sent_count().await?);
    }
    Ok(())
}
