use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tydom::config::{DEFAULT_RELAY_HOST, DEFAULT_REQUEST_TIMEOUT_MS, request_timeout_from_ms};
use tydom::{Client, ClientConfig, ClientError, ClientEvent};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "tydom", about = "Tydom gateway client")]
struct Cli {
    /// Gateway MAC address.
    #[arg(long, env = "TYDOM_USERNAME")]
    username: String,

    #[arg(long, env = "TYDOM_PASSWORD", hide_env_values = true)]
    password: String,

    #[arg(long, env = "TYDOM_HOSTNAME", default_value = DEFAULT_RELAY_HOST)]
    hostname: String,

    /// Accept self-signed gateway certificates.
    #[arg(long, env = "TYDOM_INSECURE", default_value_t = false)]
    insecure: bool,

    #[arg(long, env = "TYDOM_REQUEST_TIMEOUT_MS", default_value_t = DEFAULT_REQUEST_TIMEOUT_MS, allow_negative_numbers = true)]
    request_timeout_ms: i64,

    /// Close the socket gracefully on Ctrl-C.
    #[arg(long, env = "TYDOM_CLOSE_ON_EXIT", default_value_t = true, action = ArgAction::Set)]
    close_on_exit: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// GET each uri in order and print the bodies keyed by uri.
    Request {
        #[arg(required = true)]
        uris: Vec<String>,
        /// Also write the results to this file.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Run a polling command and print the collected values.
    Command { uri: String },
    /// Print unsolicited gateway messages.
    Listen {
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = ClientConfig::new(cli.username, cli.password).with_hostname(cli.hostname);
    config.accept_invalid_certs = cli.insecure;
    config.request_timeout = request_timeout_from_ms(cli.request_timeout_ms);
    config.close_on_exit = cli.close_on_exit;
    if matches!(cli.command, Command::Request { .. } | Command::Command { .. }) {
        config.keep_alive = false;
    }

    let client = Client::new(config)?;
    info!(hostname = %client.config().hostname, "connecting");
    client.connect().await?;
    info!(hostname = %client.config().hostname, "connected");

    let result = match cli.command {
        Command::Request { uris, file } => until_signal(&client, run_request(&client, uris, file)).await,
        Command::Command { uri } => until_signal(&client, run_command(&client, &uri)).await,
        Command::Listen { seconds } => until_signal(&client, run_listen(&client, seconds)).await,
    };

    client.shutdown().await;
    result
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,tydom=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Drive `work`, giving up early on Ctrl-C when `close_on_exit` is set.
async fn until_signal(client: &Client, work: impl Future<Output = Result<(), CliError>>) -> Result<(), CliError> {
    if !client.config().close_on_exit {
        return work.await;
    }
    tokio::select! {
        result = work => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "failed to listen for Ctrl-C");
            }
            info!("interrupted, closing socket");
            Ok(())
        }
    }
}

async fn run_request(client: &Client, uris: Vec<String>, file: Option<PathBuf>) -> Result<(), CliError> {
    info!(count = uris.len(), "performing requests");
    let mut results = Map::new();
    for uri in uris {
        info!(%uri, "GET");
        let body = client.get(&uri).await?;
        results.insert(uri, body);
    }

    let results = Value::Object(results);
    print_json(&results)?;
    if let Some(path) = file {
        std::fs::write(&path, serde_json::to_string_pretty(&results)?)?;
        info!(path = %path.display(), "wrote results");
    }
    Ok(())
}

async fn run_command(client: &Client, uri: &str) -> Result<(), CliError> {
    let values = client.command(uri).await?;
    print_json(&Value::Array(values))
}

async fn run_listen(client: &Client, seconds: Option<u64>) -> Result<(), CliError> {
    let mut events = client.subscribe();
    let deadline = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => return Ok(()),
            event = events.recv() => match event {
                Ok(ClientEvent::Message(message)) => print_json(&serde_json::to_value(&message)?)?,
                Ok(ClientEvent::Connect) => info!("socket connected"),
                Ok(ClientEvent::Disconnect) => warn!("socket disconnected"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped messages while printing"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
