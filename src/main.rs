use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::NaiveDate;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use order_intake::config::{IntakeConfig, MailboxConfig};
use order_intake::mailbox::ImapMailbox;
use order_intake::pipeline::service::IntakeService;
use order_intake::pipeline::types::CandidateInput;
use order_intake::store::{LibSqlBackend, ReferenceStore};
use order_intake::watch;

const USAGE: &str = "\
usage:
  order-intake preview [--from YYYY-MM-DD] [--to YYYY-MM-DD] [--out FILE]
  order-intake commit FILE [--create-customers] [--create-products]
  order-intake watch";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Preview {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        out: Option<PathBuf>,
    },
    Commit {
        file: PathBuf,
        create_customers: bool,
        create_products: bool,
    },
    Watch,
}

fn parse_date(flag: &str, value: Option<&String>) -> anyhow::Result<NaiveDate> {
    let raw = value.with_context(|| format!("{flag} needs a value"))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("{flag}: bad date '{raw}'"))
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    let Some(command) = args.first() else {
        bail!("{USAGE}");
    };
    let mut rest = args[1..].iter();

    match command.as_str() {
        "preview" => {
            let (mut from, mut to, mut out) = (None, None, None);
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--from" => from = Some(parse_date("--from", rest.next())?),
                    "--to" => to = Some(parse_date("--to", rest.next())?),
                    "--out" => out = Some(PathBuf::from(rest.next().context("--out needs a value")?)),
                    other => bail!("unknown argument '{other}'\n{USAGE}"),
                }
            }
            Ok(Command::Preview { from, to, out })
        }
        "commit" => {
            let (mut file, mut create_customers, mut create_products) = (None, false, false);
            for arg in rest {
                match arg.as_str() {
                    "--create-customers" => create_customers = true,
                    "--create-products" => create_products = true,
                    other if other.starts_with("--") => bail!("unknown argument '{other}'\n{USAGE}"),
                    other => file = Some(PathBuf::from(other)),
                }
            }
            Ok(Command::Commit {
                file: file.context("commit needs a candidates file")?,
                create_customers,
                create_products,
            })
        }
        "watch" => Ok(Command::Watch),
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing; optional daily log file next to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let _log_guard = match std::env::var("ORDER_INTAKE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "order-intake.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let config = IntakeConfig::from_env()?;
    let mailbox_config = MailboxConfig::from_env()?;

    eprintln!("📬 Order Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}:{}/{}", mailbox_config.imap_host, mailbox_config.imap_port, mailbox_config.folder);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Archive: {}", config.archive_dir.display());

    // ── Collaborators ───────────────────────────────────────────────────
    let store: Arc<dyn ReferenceStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let mailbox = Arc::new(ImapMailbox::new(mailbox_config));
    let service = Arc::new(IntakeService::new(mailbox.clone(), mailbox, store, config));

    match command {
        Command::Preview { from, to, out } => {
            let response = service.preview(from, to).await;
            let json = serde_json::to_string_pretty(&response)?;
            if let Some(path) = out {
                tokio::fs::write(&path, &json)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                eprintln!("   Report written to {}", path.display());
            }
            println!("{json}");
            if !response.success {
                bail!(response.message);
            }
        }
        Command::Commit {
            file,
            create_customers,
            create_products,
        } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let inputs: Vec<CandidateInput> =
                serde_json::from_str(&raw).context("Candidates file is not a JSON array of candidates")?;
            let response = service
                .commit(&inputs, create_customers, create_products)
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                bail!(response.message);
            }
        }
        Command::Watch => {
            let expression = service.config().watch_schedule()?.to_string();
            let schedule = watch::parse_schedule(&expression)?;
            eprintln!("   Schedule: {expression}\n");
            let handle = watch::spawn_watch(service, schedule, |response| {
                match serde_json::to_string(response) {
                    Ok(json) => println!("{json}"),
                    Err(e) => tracing::error!(error = %e, "Failed to serialize preview report"),
                }
            });
            tokio::select! {
                _ = handle => {}
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\nShutting down...");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn preview_with_window() {
        let command = parse_args(&args(&["preview", "--from", "2026-03-01", "--out", "r.json"])).unwrap();
        assert_eq!(
            command,
            Command::Preview {
                from: NaiveDate::from_ymd_opt(2026, 3, 1),
                to: None,
                out: Some(PathBuf::from("r.json")),
            }
        );
    }

    #[test]
    fn commit_flags() {
        let command = parse_args(&args(&["commit", "c.json", "--create-products"])).unwrap();
        assert_eq!(
            command,
            Command::Commit {
                file: PathBuf::from("c.json"),
                create_customers: false,
                create_products: true,
            }
        );
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&args(&["commit"])).is_err());
        assert!(parse_args(&args(&["preview", "--from", "03/01/2026"])).is_err());
    }
}
