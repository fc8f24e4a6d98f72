use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use wsrpc::config::{ENV_CANCEL_GRACE_MS, ENV_LISTEN_URL, ENV_RECONNECT_ATTEMPTS, ENV_RECONNECT_BASE_MS, ENV_SEND_URL};
use wsrpc::{ConfigError, PeerError, ReceiverConfig, RegistryError, RpcReceiver, Script, ScriptPeer, TransportError};

mod methods;

/// How long the peer keeps running after a verdict so its sockets finish
/// the close handshake.
const CLOSE_LINGER: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to read script from stdin: {0}")]
    Stdin(#[from] io::Error),
    #[error("stdin ended before a script line was read")]
    EmptyScript,
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Parser, Debug)]
#[command(name = "wsrpc-cli", about = "Websocket RPC receiver and script peer")]
struct Cli {
    /// Log at debug level.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a scripted conversation and judge the receiver's replies.
    Peer(PeerArgs),
    /// Connect to a peer and serve the demo methods until closed.
    Receive(ReceiveArgs),
}

#[derive(Args, Debug)]
struct PeerArgs {
    #[arg(long, default_value = "127.0.0.1:8765")]
    bind: SocketAddr,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Args, Debug)]
struct ReceiveArgs {
    #[arg(long, env = "RPC_LISTEN_URL")]
    listen_url: String,

    /// Separate send URL; omit for a single duplex socket.
    #[arg(long, env = "RPC_SEND_URL")]
    send_url: Option<String>,

    #[arg(long, env = "RPC_RECONNECT_ATTEMPTS")]
    reconnect_attempts: Option<String>,

    #[arg(long, env = "RPC_RECONNECT_BASE_MS")]
    reconnect_base_ms: Option<String>,

    #[arg(long, env = "RPC_CANCEL_GRACE_MS")]
    cancel_grace_ms: Option<String>,
}

impl ReceiveArgs {
    fn config(&self) -> Result<ReceiverConfig, ConfigError> {
        ReceiverConfig::from_lookup(|key| match key {
            ENV_LISTEN_URL => Some(self.listen_url.clone()),
            ENV_SEND_URL => self.send_url.clone(),
            ENV_RECONNECT_ATTEMPTS => self.reconnect_attempts.clone(),
            ENV_RECONNECT_BASE_MS => self.reconnect_base_ms.clone(),
            ENV_CANCEL_GRACE_MS => self.cancel_grace_ms.clone(),
            _ => None,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Command::Peer(args) => run_peer(args).await,
        Command::Receive(args) => run_receive(args).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "cli: failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

async fn run_peer(args: PeerArgs) -> Result<(), CliError> {
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(CliError::EmptyScript);
    }
    let script = Script::from_line(&line)?;

    let peer = ScriptPeer::spawn(script, args.bind).await?;
    println!("{}", peer.addr());

    let verdict = peer.wait(Duration::from_secs(args.timeout_secs)).await;
    tokio::time::sleep(CLOSE_LINGER).await;
    verdict?.into_result()?;
    println!("passed");
    Ok(())
}

async fn run_receive(args: ReceiveArgs) -> Result<(), CliError> {
    let config = args.config()?;
    let registry = methods::registry()?;
    info!(endpoint = %config.endpoint, methods = ?registry.names(), "cli: starting receiver");

    let mut receiver = RpcReceiver::connect(config, registry).await?;
    let handle = receiver.close_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("cli: interrupt received; closing");
                handle.close();
            }
            Err(e) => warn!(error = %e, "cli: cannot listen for interrupts"),
        }
    });

    receiver.run().await?;
    Ok(())
}
