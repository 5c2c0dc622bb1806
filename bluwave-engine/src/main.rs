// BluWave chat daemon: host or join a nearby group from the terminal.

use std::net::SocketAddr;

use bluwave_core::MessageKind;
use bluwave_engine::{config, ChatEngine, EngineError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

enum Mode {
    Host,
    Join(SocketAddr),
    Scan,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match args.first().map(String::as_str) {
        Some("--version") | Some("-V") => {
            println!("bluwave {}", VERSION);
            return Ok(());
        }
        Some("host") => Mode::Host,
        Some("join") => {
            let addr = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("usage: bluwave join <addr:port>"))?
                .parse::<SocketAddr>()?;
            Mode::Join(addr)
        }
        Some("scan") => Mode::Scan,
        _ => {
            eprintln!("usage: bluwave host | join <addr:port> | scan");
            std::process::exit(2);
        }
    };

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(mode, cfg))
}

async fn run(mode: Mode, cfg: config::Config) -> anyhow::Result<()> {
    let scan_window = cfg.scan_window_secs;
    let engine = ChatEngine::new(cfg);

    if let Mode::Scan = mode {
        engine.scan_for_devices().await?;
        tokio::time::sleep(std::time::Duration::from_secs(scan_window)).await;
        let hosts = engine.discoverable_devices().borrow().clone();
        if hosts.is_empty() {
            println!("no hosts found");
        }
        for host in hosts {
            println!("{}  {}", host.id, host.name);
        }
        return Ok(());
    }

    tokio::spawn(print_messages(engine.clone()));

    match mode {
        Mode::Host => {
            engine.start_host().await?;
            if let Some(addr) = engine.listen_addr().await {
                println!("hosting on {addr}; waiting for peers");
            }
        }
        Mode::Join(addr) => {
            engine.join_addr(addr).await?;
            println!("joined {addr}");
        }
        Mode::Scan => unreachable!(),
    }

    // Lines typed here become chat messages; /quit or Ctrl+C leaves.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim() == "/quit" => break,
                    Some(line) => {
                        if let Err(err) = engine.send(&line).await {
                            if matches!(err, EngineError::NotInSession) {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            _ = shutdown_signal() => break,
        }
    }

    engine.disconnect().await;
    Ok(())
}

/// Print each new log entry exactly once. `disconnect` clears the log, which
/// the clamp below treats as a fresh start.
async fn print_messages(engine: ChatEngine) {
    let mut rx = engine.messages();
    let mut printed = 0usize;
    while rx.changed().await.is_ok() {
        let log = rx.borrow_and_update().clone();
        printed = printed.min(log.len());
        for msg in &log[printed..] {
            match msg.kind {
                MessageKind::System => println!("* {}", msg.text),
                MessageKind::Text if msg.originated_locally => {}
                MessageKind::Text => println!("[{}] {}", msg.sender_name, msg.text),
            }
        }
        printed = log.len();
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
