/// veil daemon - onion-routing relay node
///
/// Runs a relay that:
/// - Accepts authenticated peer connections over TLS
/// - Answers circuit creation and extension handshakes
/// - Forwards onion-encrypted relay cells between peers
/// - Bridges exit streams to real TCP and DNS
use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

use veil_common::NodeConfig;
use veil_core::crypto::{OnionKeypair, ResponderKeys};
use veil_core::provider::{
    IdentityKeystore, LocalKeystore, NoPaths, OpenExitPolicy, SystemResolver,
};
use veil_core::Core;
use veil_daemon::{ApiServer, Runtime, TlsContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting veil daemon v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "help" | "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "version" | "--version" | "-v" => {
                println!("veil daemon v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "relay" => {
                run_relay().await?;
            }
            _ => {
                eprintln!("Unknown command: {}", args[1]);
                eprintln!("Run with 'help' to see available commands");
                std::process::exit(1);
            }
        }
    } else {
        run_relay().await?;
    }

    Ok(())
}

/// Run the relay node.
async fn run_relay() -> Result<()> {
    let config = load_or_create_config();
    let data_dir = PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    // Long-term keys survive restarts under the data directory.
    let keystore = Arc::new(load_or_create_identity(&data_dir)?);
    let onion = load_or_create_onion_key(&data_dir)?;
    info!(
        identity = %hex::encode(keystore.my_identity_digest()),
        "relay identity loaded"
    );

    let responder = Arc::new(ResponderKeys {
        identity_digest: keystore.my_identity_digest(),
        onion,
    });

    let mut core = Core::new(
        config.core.clone(),
        keystore.clone() as Arc<dyn IdentityKeystore>,
        Box::new(OpenExitPolicy),
        Box::new(NoPaths),
        responder,
    )
    .with_workers(2, 64);

    // Learned build timeouts survive restart.
    let estimator_path = data_dir.join("build_times.bin");
    if let Ok(blob) = std::fs::read(&estimator_path) {
        core.restore_estimator(&blob);
    }

    let listen: SocketAddr = format!("{}:{}", config.listen_addr, config.listen_port).parse()?;
    let listener = tokio::net::TcpListener::bind(listen).await?;

    let tls = TlsContext::self_signed()?;
    let (runtime, handle) = Runtime::new(
        core,
        tls,
        keystore.clone(),
        Arc::new(SystemResolver),
        vec![listener.local_addr()?.ip()],
    );

    // Operator API on the loopback interface.
    let api_addr: SocketAddr = "127.0.0.1:0".parse()?;
    let api_server = ApiServer::new(api_addr, handle.clone());
    tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            warn!("API server error: {}", e);
        }
    });

    info!("Relay is running. Press Ctrl+C to stop.");
    let runtime_task = tokio::spawn(runtime.run(listener));
    tokio::select! {
        result = runtime_task => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            if let Some(blob) = handle.estimator_blob().await {
                if let Err(e) = std::fs::write(&estimator_path, blob) {
                    warn!("Failed to persist build-time state: {}", e);
                }
            }
        }
    }
    Ok(())
}

/// Load configuration from file or create defaults and persist them.
fn load_or_create_config() -> NodeConfig {
    let config_path = PathBuf::from("veil.toml");
    if config_path.exists() {
        info!("Loading configuration from {:?}", config_path);
        match NodeConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config (using defaults): {}", e);
                NodeConfig::default()
            }
        }
    } else {
        info!("No configuration file found, using defaults");
        let config = NodeConfig::default();

        if let Err(e) = config.save(&config_path) {
            warn!("Failed to save default config: {}", e);
        } else {
            info!("Saved default configuration to {:?}", config_path);
        }

        config
    }
}

fn load_or_create_identity(data_dir: &std::path::Path) -> Result<LocalKeystore> {
    let path = data_dir.join("identity.key");
    match std::fs::read(&path) {
        Ok(bytes) if bytes.len() == 32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            Ok(LocalKeystore::from_seed(seed))
        }
        _ => {
            use rand::RngCore;
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            std::fs::write(&path, seed)?;
            info!("Generated new identity key");
            Ok(LocalKeystore::from_seed(seed))
        }
    }
}

fn load_or_create_onion_key(data_dir: &std::path::Path) -> Result<OnionKeypair> {
    let path = data_dir.join("onion.key");
    match std::fs::read(&path) {
        Ok(bytes) if bytes.len() == 32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            Ok(OnionKeypair::from_seed(seed))
        }
        _ => {
            let keypair = OnionKeypair::generate(&mut rand::thread_rng());
            std::fs::write(&path, keypair.secret_bytes())?;
            info!("Generated new onion key");
            Ok(keypair)
        }
    }
}

/// Print help message
fn print_help() {
    println!("veil daemon - onion-routing relay node");
    println!();
    println!("USAGE:");
    println!("    veil-daemon [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    relay       Run the relay node (default)");
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("FILES:");
    println!("    veil.toml            Node configuration (created on first run)");
    println!("    <data>/identity.key  Long-term identity signing key");
    println!("    <data>/onion.key     Circuit-extension onion key");
    println!("    <data>/build_times.bin  Learned circuit-build timeouts");
}
