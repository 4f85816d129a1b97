use anyhow::{anyhow, ensure, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use nbd_client_core::{
    metrics, resolve, BlockDevice, ControlRequest, ControlResponse, DataPath, DeviceTable,
    Direction, OpenerId, ServerEndpoint, TableConfig, TcpConnector, TcpConnectorConfig,
};
use nbd_export::{serve, BlockSource, FileBlockSource, PatternBlockSource};
use std::{net::SocketAddr, path::PathBuf, process, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "nbd-cli")]
#[command(about = "Oldstyle NBD export and client tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve a read-only export until interrupted
    Serve(ServeArgs),
    /// Connect, validate the greeting and report the export geometry
    Probe(ProbeArgs),
    /// Read blocks through the device engine
    Read(ReadArgs),
}

#[derive(Debug, Args)]
#[command(group = ArgGroup::new("backing").args(["file", "pattern_blocks"]).required(true))]
struct ServeArgs {
    /// Disk image to export
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Export this many blocks of offset-pattern data instead of a file
    #[arg(long, value_name = "BLOCKS")]
    pattern_blocks: Option<u64>,
    /// Logical block size of the backing source (bytes)
    #[arg(long, default_value_t = 512)]
    block_size: u32,
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:10809")]
    listen: SocketAddr,
}

#[derive(Debug, Args)]
struct ConnectArgs {
    /// Server as HOST:PORT
    #[arg(long)]
    server: String,
    /// Unit to attach the export to
    #[arg(long, default_value_t = 0)]
    unit: usize,
    /// How long to wait for the TCP connect (milliseconds)
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[derive(Debug, Args)]
struct ProbeArgs {
    #[command(flatten)]
    connect: ConnectArgs,
}

#[derive(Debug, Args)]
struct ReadArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    /// First 512-byte transfer block to read
    #[arg(long, default_value_t = 0)]
    block: u64,
    /// Number of transfer blocks to read
    #[arg(long, default_value_t = 1)]
    count: u32,
    /// Write the data here instead of dumping it as hex
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
    /// Produce reference data locally instead of issuing read commands
    #[arg(long)]
    pattern: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Probe(args) => run_probe(args).await,
        Command::Read(args) => run_read(args).await,
    };
    if let Err(err) = &result {
        if let Some(device_err) = err.downcast_ref::<nbd_client_core::DeviceError>() {
            eprintln!("error: {err:#}");
            process::exit(device_err.errno());
        }
    }
    result
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let source: Arc<dyn BlockSource> = match (&args.file, args.pattern_blocks) {
        (Some(path), _) => Arc::new(
            FileBlockSource::open(path, args.block_size)
                .await
                .context("open export file")?,
        ),
        (None, Some(blocks)) => Arc::new(PatternBlockSource::new(args.block_size, blocks)?),
        (None, None) => return Err(anyhow!("either --file or --pattern-blocks is required")),
    };
    let blocks = source
        .total_blocks()
        .await
        .map_err(|err| anyhow!("query export size: {err}"))?;
    ensure!(blocks > 0, "export is empty");
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(blocks, block_size = args.block_size, "export ready");

    tokio::select! {
        res = serve(listener, source) => res,
        _ = signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}

async fn run_probe(args: ProbeArgs) -> Result<()> {
    let session = Session::open(&args.connect, DataPath::Nbd).await?;
    let outcome = session.probe().await;
    session.close().await;
    outcome
}

async fn run_read(args: ReadArgs) -> Result<()> {
    ensure!(args.count > 0, "--count must be at least 1");
    let data_path = if args.pattern {
        DataPath::Pattern
    } else {
        DataPath::Nbd
    };
    let session = Session::open(&args.connect, data_path).await?;
    let outcome = session.read(args.block, args.count).await;
    session.close().await;
    let data = outcome?;

    match &args.out {
        Some(path) => tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("write {}", path.display()))?,
        None => hexdump(args.block * 512, &data),
    }
    let snapshot = metrics::snapshot();
    info!(
        reads = snapshot.read.count,
        bytes = snapshot.read.bytes,
        avg_ns = snapshot.read.avg_ns,
        "read complete"
    );
    Ok(())
}

/// One table with one attached unit, driven the way a device-node layer would.
struct Session {
    table: Arc<DeviceTable>,
    unit: usize,
}

impl Session {
    async fn open(args: &ConnectArgs, data_path: DataPath) -> Result<Self> {
        let endpoint = parse_server(&args.server).await?;
        let connector = TcpConnector::new(TcpConnectorConfig {
            data_path,
            ..TcpConnectorConfig::default()
        });
        let table = Arc::new(DeviceTable::new(TableConfig::default(), Arc::new(connector))?);
        let _monitor = table.spawn_connectivity_monitor()?;

        let controller = table.controller();
        controller.connect(args.unit, endpoint).await?;
        info!(unit = args.unit, server = %endpoint, "connecting");
        let session = Self {
            table: table.clone(),
            unit: args.unit,
        };
        if let Err(err) = Self::establish(&table, args).await {
            session.close().await;
            return Err(err);
        }
        Ok(session)
    }

    async fn establish(table: &DeviceTable, args: &ConnectArgs) -> Result<()> {
        let controller = table.controller();
        controller
            .wait_connected(
                args.unit,
                Duration::from_millis(args.timeout_ms),
                Duration::from_millis(10),
            )
            .await?;
        let handshake = controller.validate_handshake(args.unit).await?;
        if !handshake.oldstyle {
            warn!("server greeting carries no size; block counts will read zero");
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let state = self.table.get(self.unit)?.lock().await;
        let (capacity, writable) = (state.capacity_bytes(), state.writable());
        drop(state);
        let blocks = match self.table.control(self.unit, ControlRequest::GetBlockCount).await? {
            ControlResponse::BlockCount(blocks) => blocks,
            other => return Err(anyhow!("unexpected response {other:?}")),
        };
        println!("capacity_bytes: {capacity}");
        println!("block_count:    {blocks}");
        println!("writable:       {writable}");
        Ok(())
    }

    async fn read(&self, block: u64, count: u32) -> Result<Vec<u8>> {
        let device = self.table.handle(self.unit)?;
        let opener = OpenerId(u64::from(process::id()));
        device.open(opener).await?;
        let len = usize::try_from(count)? * 512;
        let mut buf = vec![0u8; len];
        let outcome = device.strategy(block, Direction::Read, &mut buf).await;
        device.close(opener).await?;
        let done = outcome?;
        ensure!(done.residual == 0, "short read: {} bytes left", done.residual);
        Ok(buf)
    }

    async fn close(&self) {
        if let Err(err) = self.table.controller().teardown(self.unit).await {
            warn!(unit = self.unit, error = %err, "teardown failed");
        }
        self.table.shutdown().await;
    }
}

async fn parse_server(server: &str) -> Result<ServerEndpoint> {
    let (host, port) = server
        .rsplit_once(':')
        .with_context(|| format!("server {server} is not HOST:PORT"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {server}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    resolve(host, port)
        .await
        .with_context(|| format!("resolve {server}"))
}

fn hexdump(base: u64, data: &[u8]) {
    for (line, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:010x}  {}", base + (line * 16) as u64, hex.join(" "));
    }
}
