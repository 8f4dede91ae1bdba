use clap::{Args, Parser, Subcommand};
use shared::Amount;
use tessera::node::NodeBuilder;
use tessera_core::NetworkParams;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera - Hybrid PoW + Direct Voting Blockchain Node")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local demonstration (mine blocks, transfer, stats)
    Demo(DemoArgs),
    /// Mine blocks continuously on a local chain
    Mine(MineArgs),
    /// Display version information
    Version,
}

#[derive(Args)]
struct DemoArgs {
    /// Number of blocks to mine in the demo
    #[arg(short, long, default_value = "3")]
    blocks: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Args)]
struct MineArgs {
    /// Number of blocks to mine (0 = forever)
    #[arg(short, long, default_value = "0")]
    blocks: u64,

    /// Mining threads
    #[arg(long, default_value = "1")]
    threads: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

#[tokio::main]
async fn main() -> shared::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Demo(args)) => demo(args).await,
        Some(Commands::Mine(args)) => mine(args).await,
        Some(Commands::Version) => {
            show_version();
            Ok(())
        }
        None => {
            demo(&DemoArgs {
                blocks: 3,
                log_level: "info".to_string(),
            })
            .await
        }
    }
}

async fn demo(args: &DemoArgs) -> shared::Result<()> {
    init_logging(&args.log_level);
    info!("🚀 Tessera demo - hybrid consensus chain");

    let mut params = NetworkParams::regtest();
    params.min_fee_per_byte = 0;
    params.coinbase_maturity = 1;
    let node = NodeBuilder::new(params).build()?;
    node.start().await?;

    for _ in 0..args.blocks {
        let block = node.mine_block().await?;
        info!(
            height = block.height(),
            hash = %block.hash(),
            txs = block.transactions.len(),
            "block mined"
        );
    }

    // Transferência simples do saldo minerado
    let friend = shared::Hash256::keccak256(b"demo-friend");
    let tx = node.create_transfer(friend, Amount::from_u64(100), Amount::from_u64(1))?;
    let id = node.submit_transaction(tx).await?;
    info!(tx = %id, "transfer submitted");

    let block = node.mine_block().await?;
    info!(height = block.height(), "transfer confirmed");

    let stats = node.stats()?;
    info!(
        height = stats.height,
        transactions = stats.total_transactions,
        utxos = stats.total_utxos,
        supply = %stats.circulating_supply,
        "final chain state"
    );

    let health = node.health_check();
    info!(healthy = health.healthy, "node health");

    node.shutdown();
    Ok(())
}

async fn mine(args: &MineArgs) -> shared::Result<()> {
    init_logging(&args.log_level);

    let mut params = NetworkParams::default();
    params.mining_threads = args.threads.max(1);
    let node = NodeBuilder::new(params).build()?;
    node.start().await?;

    info!(miner = %node.miner_address(), "mining started");

    let mut mined = 0u64;
    loop {
        let block = node.mine_block().await?;
        mined += 1;
        info!(height = block.height(), hash = %block.hash(), "block mined");

        if args.blocks != 0 && mined >= args.blocks {
            break;
        }
    }

    node.shutdown();
    Ok(())
}

fn show_version() {
    println!("Tessera Node v0.1.0");
    println!("Consensus: hybrid PoW + direct on-chain voting");
    println!("Hashing: Keccak-256 | Signatures: ML-DSA (post-quantum)");
}
