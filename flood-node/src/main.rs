// floodstore node: loads config, wires transport and file server, runs until signalled.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use flood_core::{
    FileServer, FileServerOptions, Handshake, NopHandshake, TcpTransport, TcpTransportOptions,
    Transport, VersionHandshake,
};
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, timeout};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Config, HandshakeKind};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEMO_WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

type Node = FileServer<TcpTransport>;

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut demo = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("flood-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => bail!("--config needs a path"),
            },
            "--demo" => demo = true,
            other => bail!("unknown argument: {}", other),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(config_path.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if demo {
            run_demo(&cfg).await
        } else {
            run_node(cfg).await
        }
    })
}

fn make_server(cfg: &Config) -> Node {
    let handshake: Arc<dyn Handshake> = match cfg.handshake {
        HandshakeKind::None => Arc::new(NopHandshake),
        HandshakeKind::Version => Arc::new(VersionHandshake::new()),
    };
    let transport = TcpTransport::new(TcpTransportOptions {
        listen_addr: cfg.listen_addr.clone(),
        handshake,
        rpc_buffer: cfg.rpc_buffer,
        ..Default::default()
    });
    FileServer::new(
        FileServerOptions {
            storage_root: cfg.storage_root(),
            bootstrap_nodes: cfg.bootstrap_nodes.clone(),
            send_timeout: Duration::from_secs(cfg.send_timeout_secs),
            ..Default::default()
        },
        transport,
    )
}

async fn run_node(cfg: Config) -> anyhow::Result<()> {
    let node = Arc::new(make_server(&cfg));
    info!(
        listen = %cfg.listen_addr,
        root = %node.store().root().display(),
        bootstrap = ?cfg.bootstrap_nodes,
        "starting node"
    );
    let server = node.clone();
    let mut running = tokio::spawn(async move { server.start().await });
    tokio::select! {
        res = &mut running => {
            res?.context("file server exited")?;
            return Ok(());
        }
        sig = shutdown_signal() => sig?,
    }
    info!("shutting down");
    node.stop();
    running.await??;
    Ok(())
}

/// Two nodes on loopback: the second bootstraps to the first, stores a file,
/// and the file shows up in the first node's store.
async fn run_demo(cfg: &Config) -> anyhow::Result<()> {
    let base = std::env::temp_dir().join("floodstore-demo");
    let first_cfg = Config {
        listen_addr: "127.0.0.1:0".to_string(),
        storage_root: Some(base.join("first_network")),
        bootstrap_nodes: Vec::new(),
        ..cfg.clone()
    };
    let first = Arc::new(make_server(&first_cfg));
    let first_task = tokio::spawn({
        let first = first.clone();
        async move { first.start().await }
    });
    let first_addr = timeout(DEMO_WAIT, async {
        loop {
            if let Some(addr) = first.transport().local_addr() {
                break addr;
            }
            sleep(POLL).await;
        }
    })
    .await
    .context("first node never started listening")?;

    let second_cfg = Config {
        storage_root: Some(base.join("second_network")),
        bootstrap_nodes: vec![String::new(), first_addr.to_string()],
        ..first_cfg
    };
    let second = Arc::new(make_server(&second_cfg));
    let second_task = tokio::spawn({
        let second = second.clone();
        async move { second.start().await }
    });
    timeout(DEMO_WAIT, async {
        while first.peer_count().await == 0 {
            sleep(POLL).await;
        }
    })
    .await
    .context("nodes never connected")?;

    let data = b"my big data file here";
    second.store_data("myprivatedata", &data[..]).await?;

    timeout(DEMO_WAIT, async {
        while !first.store().has("myprivatedata").await {
            sleep(POLL).await;
        }
    })
    .await
    .context("file never replicated")?;
    // let the in-flight write finish
    sleep(Duration::from_millis(100)).await;
    let mut replicated = Vec::new();
    first
        .store()
        .read("myprivatedata")
        .await?
        .read_to_end(&mut replicated)
        .await?;
    info!(
        key = "myprivatedata",
        content = %String::from_utf8_lossy(&replicated),
        "replicated to first node"
    );

    first.stop();
    second.stop();
    first_task.await??;
    second_task.await??;
    first.store().clear().await?;
    second.store().clear().await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
