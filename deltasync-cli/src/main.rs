use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use deltasync_core::client::{Collaborators, MemoryBroadcast, MemoryDatastore, ThreeWayMerge};
use deltasync_core::crypto::{parse_version_pointer, verify_version_pointer};
use deltasync_core::transfer::HttpTransport;
use deltasync_core::{
    Device, Keyring, KvMap, LoopbackTransport, Server, SignedVerhash, SyncConfig, Transport,
    VersionStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_SECRET: &str = "deltasync-demo";

/// Encrypted key-value sync harness
#[derive(Parser)]
#[command(name = "deltasync")]
#[command(about = "Run and inspect encrypted key-value sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync two in-process devices and print what they converge to
    Demo {
        /// Relay base URL; an in-process server is used when omitted
        #[arg(long)]
        relay: Option<String>,

        /// Shared dataset secret
        #[arg(long, default_value = DEFAULT_SECRET)]
        secret: String,
    },

    /// Decode a signed version pointer
    Inspect {
        pointer: String,

        /// Verify the pointer's signature with this secret
        #[arg(long)]
        secret: Option<String>,
    },
}

/// One running device and the datastore it watches.
struct DemoDevice {
    local: Arc<MemoryDatastore>,
    task: JoinHandle<()>,
}

fn spawn_device(
    name: &str,
    secret: &str,
    transport: Arc<dyn Transport>,
    broadcast: &Arc<MemoryBroadcast>,
) -> Result<DemoDevice> {
    let (tx, rx) = mpsc::unbounded_channel();
    broadcast.subscribe(tx.clone());
    let local = Arc::new(MemoryDatastore::new(tx));

    let store = VersionStore::new(Keyring::from_secret(secret.as_bytes())?);
    let mut device = Device::new(
        name,
        store,
        Collaborators {
            transport,
            local: local.clone(),
            broadcast: broadcast.clone(),
            merge: Arc::new(ThreeWayMerge),
        },
        SyncConfig::default(),
    );
    let task = tokio::spawn(async move { device.run(rx).await });
    Ok(DemoDevice { local, task })
}

async fn wait_until(what: &str, done: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        if Instant::now() > deadline {
            bail!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

async fn run_demo(relay: Option<String>, secret: String) -> Result<()> {
    let transport: Arc<dyn Transport> = match &relay {
        Some(url) => {
            info!("Syncing through relay {}", url);
            Arc::new(HttpTransport::new(url)?)
        }
        None => {
            info!("Syncing through an in-process server");
            Arc::new(LoopbackTransport::new(Server::default()))
        }
    };
    let broadcast = Arc::new(MemoryBroadcast::new());
    let a = spawn_device("A", &secret, transport.clone(), &broadcast)?;
    let b = spawn_device("B", &secret, transport, &broadcast)?;

    let mut first = a.local.snapshot();
    first.insert("greeting".to_string(), json!("hello"));
    first.insert("written_by".to_string(), json!("A"));
    a.local.write(first)?;
    wait_until("B to receive A's data", || {
        let theirs = b.local.snapshot();
        theirs.contains_key("greeting") && theirs == a.local.snapshot()
    })
    .await?;

    let mut second = b.local.snapshot();
    second.insert("written_by".to_string(), json!("B"));
    second.insert("counter".to_string(), json!(1));
    b.local.write(second)?;
    wait_until("A to receive B's edit", || {
        let mine = a.local.snapshot();
        mine.get("counter") == Some(&json!(1)) && mine == b.local.snapshot()
    })
    .await?;

    print_map("A", &a.local.snapshot())?;
    print_map("B", &b.local.snapshot())?;

    a.task.abort();
    b.task.abort();
    Ok(())
}

fn print_map(name: &str, kvs: &KvMap) -> Result<()> {
    println!("{}: {}", name, serde_json::to_string_pretty(kvs)?);
    Ok(())
}

fn inspect(pointer: String, secret: Option<String>) -> Result<()> {
    let signed = SignedVerhash::from(pointer);
    let parsed = parse_version_pointer(&signed)?;
    println!("seqnum:  {}", parsed.seqnum);
    println!("verhash: {}", parsed.verhash);

    if let Some(secret) = secret {
        let keyring = Keyring::from_secret(secret.as_bytes())?;
        match verify_version_pointer(keyring.sign_key(), &signed) {
            Ok(_) => println!("signature: valid"),
            Err(e) => bail!("signature: {}", e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { relay, secret } => run_demo(relay, secret).await,
        Commands::Inspect { pointer, secret } => inspect(pointer, secret),
    }
}
