use std::future::Future;
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use itr90_rs::bridge::{Bridge, BridgeConfig, DEFAULT_LISTEN_ADDR};
use itr90_rs::link::{self, SerialOpener};
use itr90_rs::logging;
use itr90_rs::manager::{ConnectionManager, ManagerConfig};
use itr90_rs::transport::{
    ConnectionState, DirectLinkConfig, EventReceiver, LinkEvent, RelayConfig, TransportKind,
};
use itr90_rs::Command;

#[derive(Parser, Debug)]
#[command(name = "itr90", about = "Read and control an ITR 90 vacuum gauge")]
struct Args {
    /// Enable debug logging (ITR90_LOG / RUST_LOG also apply)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List serial ports
    Ports,
    /// Print readings as they arrive
    Monitor {
        #[command(flatten)]
        link: LinkArgs,
        /// Print one JSON object per reading
        #[arg(long)]
        json: bool,
        /// Stop after this many readings
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Send one command (set_mbar, set_torr, set_pa, save_unit, degas_on, degas_off)
    Send {
        command: String,
        #[command(flatten)]
        link: LinkArgs,
    },
    /// Relay a serial port over WebSocket
    Bridge {
        /// Serial port (auto-detected when there is exactly one)
        #[arg(long)]
        port: Option<String>,
        /// Address to listen on
        #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
        listen: String,
    },
}

#[derive(ClapArgs, Debug)]
struct LinkArgs {
    /// Serial port (auto-detected when there is exactly one)
    #[arg(long)]
    port: Option<String>,
    /// Connect through a relay bridge instead, e.g. ws://localhost:8765
    #[arg(long, conflicts_with = "port")]
    relay: Option<String>,
}

impl LinkArgs {
    fn kind(&self) -> TransportKind {
        if self.relay.is_some() {
            TransportKind::RelayedSocket
        } else {
            TransportKind::DirectLink
        }
    }

    fn manager_config(&self) -> ManagerConfig {
        let mut relay = RelayConfig::default();
        if let Some(url) = &self.relay {
            relay.url = url.clone();
        }
        ManagerConfig {
            direct: DirectLinkConfig {
                serial: SerialOpener::new(self.port.clone()),
                ..DirectLinkConfig::default()
            },
            relay,
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_rust_logging(args.verbose);

    let rt = Runtime::new().context("tokio runtime init failed")?;
    rt.block_on(dispatch(args.cmd))
}

async fn dispatch(cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Ports => list_ports(),
        Cmd::Monitor { link, json, count } => monitor(link, json, count).await,
        Cmd::Send { command, link } => send(&command, link).await,
        Cmd::Bridge { port, listen } => bridge(port, listen).await,
    }
}

fn list_ports() -> Result<()> {
    let ports = link::discover_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for p in ports {
        println!("{:<24} {}", p.name, p.description);
    }
    Ok(())
}

async fn monitor(link: LinkArgs, json: bool, count: Option<usize>) -> Result<()> {
    let (mut manager, mut events) = ConnectionManager::new(link.manager_config());
    manager
        .connect(link.kind())
        .await
        .context("connection failed")?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let printed = print_readings(&manager, &mut events, json, count, shutdown).await;
    manager.disconnect().await;
    printed.map(|_| ())
}

/// Print readings until `count` is reached, the link is lost for good or
/// `shutdown` resolves. Returns how many readings were printed.
async fn print_readings(
    manager: &ConnectionManager,
    events: &mut EventReceiver,
    json: bool,
    count: Option<usize>,
    shutdown: impl Future<Output = ()>,
) -> Result<usize> {
    tokio::pin!(shutdown);
    let mut seen = 0usize;
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        match event {
            LinkEvent::Reading(r) => {
                if json {
                    println!("{}", serde_json::to_string(&r)?);
                } else {
                    println!("{r}");
                }
                seen += 1;
                if count.is_some_and(|n| seen >= n) {
                    break;
                }
            }
            LinkEvent::Error(msg) => eprintln!("error: {msg}"),
            LinkEvent::Disconnected if manager.state() == ConnectionState::Disconnected => break,
            _ => {}
        }
    }
    Ok(seen)
}

async fn send(name: &str, link: LinkArgs) -> Result<()> {
    let Some(command) = Command::by_name(name) else {
        let names: Vec<_> = Command::ALL.iter().map(|c| c.name()).collect();
        bail!("unknown command '{name}', expected one of: {}", names.join(", "));
    };

    let (mut manager, _events) = ConnectionManager::new(link.manager_config());
    manager
        .connect(link.kind())
        .await
        .context("connection failed")?;
    let sent = manager.send(command.as_bytes()).await;
    manager.disconnect().await;

    sent.with_context(|| format!("sending {command} failed"))?;
    println!("Sent {command}");
    Ok(())
}

async fn bridge(port: Option<String>, listen: String) -> Result<()> {
    let config = BridgeConfig {
        listen,
        serial: SerialOpener::new(port),
    };
    let bridge = Bridge::bind(config).await.context("failed to start bridge")?;
    println!("Relay listening on ws://{}", bridge.local_addr()?);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        on_signal.cancel();
    });

    bridge.run(shutdown).await?;
    println!("Bridge stopped.");
    Ok(())
}
