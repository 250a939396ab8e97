use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tsunagi::{ClientConfiguration, ClientNotification, ProcessSpawner, ServiceClient};

/// Client for tsserver-style analysis servers
#[derive(Parser)]
#[command(name = "tsunagi")]
#[command(version)]
#[command(about = "Open files on a tsserver-style analysis server and report their diagnostics")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the analysis server executable (overrides the configuration)
    #[arg(long)]
    server: Option<PathBuf>,

    /// Files to open and check
    files: Vec<PathBuf>,
}

fn print_report(report: &tsunagi::DiagnosticsEvent) -> usize {
    for diagnostic in &report.diagnostics {
        let text = diagnostic
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("<no text>");
        println!("{}: {}", report.resource.path(), text);
    }
    report.diagnostics.len()
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match ClientConfiguration::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => ClientConfiguration::default(),
    };
    if let Some(server) = cli.server {
        config.server_path = server;
    }

    if cli.files.is_empty() {
        eprintln!("No files given; nothing to check.");
        return ExitCode::SUCCESS;
    }

    let (client, mut notifications) = ServiceClient::new(config, Arc::new(ProcessSpawner));
    if let Err(e) = client.start() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let mut files = Vec::new();
    for path in &cli.files {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("Error: cannot read {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        };
        let file = path.display().to_string();
        if let Err(e) = client.open_document(json!({ "file": file, "fileContent": content })) {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
        files.push(file);
    }

    // The sweep resolves once the server has pushed diagnostics for every
    // requested file; the reports themselves arrive as notifications.
    let mut sweep = tokio::spawn({
        let client = client.clone();
        let files = files.clone();
        async move {
            client
                .execute_async("geterr", json!({ "delay": 0, "files": files }))
                .await
        }
    });

    let mut findings = 0usize;
    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(ClientNotification::Diagnostics(report)) => {
                    findings += print_report(&report);
                }
                Some(ClientNotification::PermanentlyFailed) => {
                    eprintln!("Error: the analysis service crashed repeatedly; giving up.");
                    return ExitCode::FAILURE;
                }
                Some(_) => {}
                None => break,
            },
            result = &mut sweep => {
                if let Ok(Err(e)) = result {
                    eprintln!("Error: {}", e);
                    return ExitCode::FAILURE;
                }
                break;
            }
        }
    }

    // Reports already queued behind the completion still count.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    while let Ok(notification) = notifications.try_recv() {
        if let ClientNotification::Diagnostics(report) = notification {
            findings += print_report(&report);
        }
    }

    client.stop();
    if findings > 0 {
        eprintln!("{} problem(s) found in {} file(s).", findings, files.len());
        ExitCode::FAILURE
    } else {
        eprintln!("No problems found in {} file(s).", files.len());
        ExitCode::SUCCESS
    }
}
