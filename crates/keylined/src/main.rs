//! `keylined`: the Keyline key-transparency log daemon.
//!
//! Binary entrypoint that opens the durable log, recovers the epoch builder
//! and seals epochs on a fixed interval.
//!
//! # Usage
//!
//! ```text
//! keylined start                             # run the sealer until ctrl-c
//! keylined start -c keyline.toml             # start with a config file
//! keylined start --memory                    # in-memory log, nothing persisted
//! keylined post --index <hex> --commitment <hex>
//! keylined seal                              # seal the open epoch once
//! keylined verify --key <hex>                # replay the log, prove one key
//! ```
//!
//! `post`, `seal` and `verify` open the log directly and must not run while
//! a `start` process holds it.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use ed25519_dalek::{Signer, SigningKey};
use keyline_builder::{
    AllowAll, Ed25519Authorizer, EpochBuilder, UpdateAuthorizer, status_of,
};
use keyline_index::Proof;
use keyline_store::{FjallGateway, MemoryGateway, StorageGateway};
use keyline_types::{Digest, Entry, IdentityKey, SignedEntryUpdate};
use tracing::{debug, info, warn};

use config::{AuthMode, CliConfig, StorageBackend};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "keylined",
    version,
    about = "Keyline key-transparency log daemon"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover the log and seal epochs periodically until interrupted.
    Start {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Run fully in-memory (no disk persistence).
        #[arg(short, long)]
        memory: bool,
    },

    /// Admit a single update into the open epoch.
    Post {
        /// Identity key, hex encoded (32 bytes).
        #[arg(long)]
        index: String,

        /// Key material commitment, hex encoded.
        #[arg(long, default_value = "")]
        commitment: String,

        /// Client update counter carried in the entry.
        #[arg(long, default_value_t = 0)]
        update_count: u64,

        /// ed25519 seed (32 bytes, hex) that signs the update and becomes
        /// the entry's authorized key.
        #[arg(long, env = "KEYLINE_SIGNING_KEY")]
        signing_key: Option<String>,
    },

    /// Seal the open epoch once.
    Seal,

    /// Replay and verify the whole log.
    Verify {
        /// Identity key (hex) to prove against the last sealed root.
        #[arg(long)]
        key: Option<String>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Start { data_dir, memory } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if memory {
                config.storage.backend = StorageBackend::Memory;
            }
            cmd_start(config).await
        }
        Commands::Post {
            index,
            commitment,
            update_count,
            signing_key,
        } => {
            cmd_post(
                &config,
                &index,
                &commitment,
                update_count,
                signing_key.as_deref(),
            )
            .await
        }
        Commands::Seal => cmd_seal(&config).await,
        Commands::Verify { key } => cmd_verify(&config, key.as_deref()).await,
    }
}

// -----------------------------------------------------------------------
// Wiring
// -----------------------------------------------------------------------

fn open_gateway(config: &CliConfig) -> Result<Arc<dyn StorageGateway>> {
    let capacity = config.storage.subscriber_capacity;

    match config.storage.backend {
        StorageBackend::Fjall => {
            let path = config.log_dir();
            std::fs::create_dir_all(&path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            let gateway = FjallGateway::open_with_capacity(&path, capacity)
                .with_context(|| format!("cannot open log at {}", path.display()))?;
            Ok(Arc::new(gateway))
        }
        StorageBackend::Memory => {
            warn!("using in-memory log, nothing will be persisted");
            Ok(Arc::new(MemoryGateway::with_capacity(capacity)))
        }
    }
}

fn authorizer(mode: AuthMode) -> Arc<dyn UpdateAuthorizer> {
    match mode {
        AuthMode::AllowAll => Arc::new(AllowAll),
        AuthMode::Ed25519 => Arc::new(Ed25519Authorizer),
    }
}

async fn open_builder(config: &CliConfig) -> Result<EpochBuilder> {
    let gateway = open_gateway(config)?;
    let builder = EpochBuilder::recover(
        gateway,
        authorizer(config.auth.mode),
        config.builder_config(),
    )
    .await
    .context("failed to recover epoch builder")?;
    Ok(builder)
}

async fn shutdown(builder: &EpochBuilder) -> Result<()> {
    builder.close().await;
    builder
        .gateway()
        .disconnect()
        .await
        .context("failed to disconnect storage gateway")
}

// -----------------------------------------------------------------------
// keylined start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    info!(
        data_dir = %config.node.data_dir.display(),
        backend = ?config.storage.backend,
        auth = ?config.auth.mode,
        "starting keylined"
    );

    let builder = Arc::new(open_builder(&config).await?);
    let status = builder.state().await;
    info!(
        open_epoch = status.open_epoch,
        next_sequence = status.next_sequence,
        pending = status.pending_updates,
        identities = status.index_len,
        "epoch builder ready"
    );

    let mut epochs = builder
        .gateway()
        .subscribe_epoch_info()
        .context("failed to subscribe to epoch records")?;
    let watcher = tokio::spawn(async move {
        while let Some(info) = epochs.recv().await {
            debug!(
                epoch = info.epoch,
                root = %info.root,
                updates = info.update_count,
                "epoch published"
            );
        }
        if epochs.dropped() > 0 {
            warn!(dropped = epochs.dropped(), "epoch watcher fell behind");
        }
    });

    builder.spawn_sealer();
    info!(
        interval_secs = config.builder_config().seal_interval.as_secs(),
        "periodic sealer running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    if config.epoch.seal_on_shutdown {
        match builder.seal().await {
            Ok(info) => info!(epoch = info.epoch, root = %info.root, "sealed open epoch"),
            Err(e) => warn!(error = %e, code = %e.code(), "final seal failed"),
        }
    }

    shutdown(&builder).await?;
    if let Err(e) = watcher.await {
        warn!(error = %e, "epoch watcher task failed");
    }

    info!("keylined stopped");
    Ok(())
}

// -----------------------------------------------------------------------
// keylined post
// -----------------------------------------------------------------------

async fn cmd_post(
    config: &CliConfig,
    index: &str,
    commitment: &str,
    update_count: u64,
    signing_key: Option<&str>,
) -> Result<()> {
    let signing_key = signing_key.map(parse_signing_key).transpose()?;

    let mut entry = Entry::new(hex::decode(index).context("index must be hex")?);
    entry.commitment = hex::decode(commitment).context("commitment must be hex")?;
    entry.update_count = update_count;
    if let Some(key) = &signing_key {
        entry.authorized_keys.push(key.verifying_key().to_bytes());
    }

    let mut update = SignedEntryUpdate::unsigned(entry.encode());
    if let Some(key) = &signing_key {
        let signature = key.sign(&update.new_entry);
        update = update.with_signature(
            key.verifying_key().to_bytes(),
            signature.to_bytes().to_vec(),
        );
    }

    let builder = open_builder(config).await?;
    let result = builder.post(update).await;
    let code = status_of(&result);
    shutdown(&builder).await?;

    let record = result.with_context(|| format!("update rejected ({code})"))?;
    println!(
        "admitted sequence={} epoch={}",
        record.sequence, record.epoch
    );
    Ok(())
}

fn parse_signing_key(hex_seed: &str) -> Result<SigningKey> {
    let bytes = hex::decode(hex_seed).context("signing key must be hex")?;
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("signing key must be 32 bytes, got {}", bytes.len()))?;
    Ok(SigningKey::from_bytes(&seed))
}

// -----------------------------------------------------------------------
// keylined seal
// -----------------------------------------------------------------------

async fn cmd_seal(config: &CliConfig) -> Result<()> {
    let builder = open_builder(config).await?;
    let result = builder.seal().await;
    let code = status_of(&result);
    shutdown(&builder).await?;

    let info = result.with_context(|| format!("seal failed ({code})"))?;
    println!(
        "epoch {} root={} updates={} sequences={}..={}",
        info.epoch, info.root, info.update_count, info.first_sequence, info.last_sequence
    );
    Ok(())
}

// -----------------------------------------------------------------------
// keylined verify
// -----------------------------------------------------------------------

async fn cmd_verify(config: &CliConfig, key: Option<&str>) -> Result<()> {
    let builder = open_builder(config).await?;
    let outcome = verify_log(&builder, key).await;
    shutdown(&builder).await?;
    outcome
}

async fn verify_log(builder: &EpochBuilder, key: Option<&str>) -> Result<()> {
    let status = builder.state().await;
    let last = builder.last_sealed().await?;

    println!("log verified");
    println!("  last sealed epoch: {} root={}", last.epoch, last.root);
    println!(
        "  open epoch: {} pending={} next_sequence={}",
        status.open_epoch, status.pending_updates, status.next_sequence
    );
    println!("  identities: {}", status.index_len);

    let Some(key) = key else {
        return Ok(());
    };

    let bytes = hex::decode(key).context("key must be hex")?;
    let key = IdentityKey::try_from(bytes.as_slice()).context("invalid identity key")?;
    let sealed = builder
        .sealed_epoch(last.epoch)
        .await
        .ok_or_else(|| anyhow!("epoch {} is not retained in memory", last.epoch))?;

    let proof = sealed.prove(&key);
    let value = sealed.lookup(&key).value();
    check_proof(&proof, &last.root, value)?;

    match value {
        Some(v) => println!("  {key}: present ({} bytes), inclusion proof verified", v.len()),
        None => println!("  {key}: absent, exclusion proof verified"),
    }
    Ok(())
}

fn check_proof(proof: &Proof, root: &Digest, value: Option<&[u8]>) -> Result<()> {
    let verified = match value {
        Some(v) => proof.verify_inclusion(root, v),
        None => proof.verify_exclusion(root),
    };
    if let Err(e) = verified {
        bail!("proof for {} does not verify: {e}", proof.key);
    }
    Ok(())
}
