//! sealfs: operator CLI for encrypted overlay volumes
//!
//! Volume commands:
//!   init <root>                   - create a volume (passphrase-protected)
//!   info <root>                   - show the control record (no key needed)
//!   encode / decode <root> <path> - map plaintext paths to backing names
//!   ls / cat / put                - browse and copy through the volume
//!   verify <root>                 - decode every name and read every block
//!   recovery-key <root>           - print the 24-word recovery phrase
//!
//! Settings:
//!   config show                   - display the active sealfs.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sealfs_core::config::SealfsConfig;
use sealfs_core::{FileKind, IntegrityMode, NameContextMode, Profile, SealfsError, SealfsResult};
use sealfs_crypto::phrase_to_volume_key;
use sealfs_volume::{ControlRecord, MountOptions, MountSecret, Volume};

/// Plaintext bytes moved per read/write call
const IO_CHUNK: usize = 64 * 1024;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sealfs",
    version,
    about = "Encrypted overlay volume tool",
    long_about = "sealfs: create, inspect, and verify encrypted overlay volumes"
)]
struct Cli {
    /// Path to sealfs.toml settings file
    #[arg(long, short = 'c', env = "SEALFS_CONFIG", default_value = "/etc/sealfs/sealfs.toml")]
    config: PathBuf,

    /// Log filter (overrides the settings file), e.g. "debug" or "sealfs_volume=trace"
    #[arg(long, env = "SEALFS_LOG")]
    log: Option<String>,

    /// Unlock with the recovery phrase instead of the passphrase
    ///
    /// The phrase is read from SEALFS_RECOVERY_PHRASE or prompted for.
    #[arg(long, global = true)]
    recovery: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new volume in an existing directory
    ///
    /// The passphrase is read from SEALFS_PASSWORD or prompted for twice.
    Init {
        /// Backing root directory
        root: PathBuf,
        /// Use the paranoid profile (block MACs, path-bound file headers)
        #[arg(long)]
        paranoid: bool,
        /// Enable per-block MACs on a standard volume
        #[arg(long)]
        block_mac: bool,
        /// Plaintext bytes per block (overrides settings)
        #[arg(long)]
        block_size: Option<u32>,
        /// Use one filename context for the whole volume
        #[arg(long)]
        global_names: bool,
    },

    /// Show a volume's parameters without unlocking it
    Info {
        root: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the backing path for a plaintext path
    Encode { root: PathBuf, path: String },

    /// Print the plaintext path for a backing path
    Decode { root: PathBuf, encoded: String },

    /// List a directory inside the volume
    Ls {
        root: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },

    /// Write a file's plaintext to stdout
    Cat { root: PathBuf, path: String },

    /// Copy a local file into the volume, replacing any existing file
    Put {
        root: PathBuf,
        local: PathBuf,
        path: String,
    },

    /// Decode every name and authenticate every block in the volume
    Verify { root: PathBuf },

    /// Print the recovery phrase for the volume key
    #[command(name = "recovery-key")]
    RecoveryKey { root: PathBuf },

    /// Settings management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active settings (merged defaults + settings file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logging(cli.log.as_deref(), &config.log.level, &config.log.format);

    match &cli.command {
        Commands::Init {
            root,
            paranoid,
            block_mac,
            block_size,
            global_names,
        } => cmd_init(&config, root, *paranoid, *block_mac, *block_size, *global_names),
        Commands::Info { root, json } => cmd_info(root, *json),
        Commands::Encode { root, path } => {
            let vol = unlock(&cli, root)?;
            println!("{}", vol.encode_path(path)?);
            Ok(())
        }
        Commands::Decode { root, encoded } => {
            let vol = unlock(&cli, root)?;
            println!("{}", vol.decode_path(encoded)?);
            Ok(())
        }
        Commands::Ls { root, path } => cmd_ls(&unlock(&cli, root)?, path),
        Commands::Cat { root, path } => cmd_cat(&unlock(&cli, root)?, path),
        Commands::Put { root, local, path } => cmd_put(&unlock(&cli, root)?, local, path),
        Commands::Verify { root } => cmd_verify(&unlock(&cli, root)?),
        Commands::RecoveryKey { root } => cmd_recovery_key(&unlock(&cli, root)?),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

/// `--log`/`SEALFS_LOG` wins over `RUST_LOG`, which wins over the settings file.
fn log_filter(explicit: Option<&str>, fallback: &str) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    match explicit {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
    }
}

fn init_logging(explicit: Option<&str>, fallback: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = log_filter(explicit, fallback);

    // stdout carries `cat` output, so logs go to stderr
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<SealfsConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(SealfsConfig::default())
    }
}

// ── Secrets ───────────────────────────────────────────────────────────────────

fn read_passphrase(root: &Path, confirm: bool) -> Result<SecretString> {
    if let Ok(pass) = std::env::var("SEALFS_PASSWORD") {
        return Ok(SecretString::from(pass));
    }
    let pass = rpassword::prompt_password(format!("Passphrase for {}: ", root.display()))
        .context("reading passphrase")?;
    if confirm {
        let again = rpassword::prompt_password("Repeat passphrase: ").context("reading passphrase")?;
        if again != pass {
            anyhow::bail!("passphrases do not match");
        }
    }
    if pass.is_empty() {
        anyhow::bail!("empty passphrase");
    }
    Ok(SecretString::from(pass))
}

fn read_recovery_phrase() -> Result<SecretString> {
    if let Ok(phrase) = std::env::var("SEALFS_RECOVERY_PHRASE") {
        return Ok(SecretString::from(phrase));
    }
    let phrase = rpassword::prompt_password("Recovery phrase: ").context("reading recovery phrase")?;
    Ok(SecretString::from(phrase))
}

/// Mount an existing volume with whichever secret the command line asked for.
fn unlock(cli: &Cli, root: &Path) -> Result<Volume> {
    let secret = if cli.recovery {
        let phrase = read_recovery_phrase()?;
        MountSecret::RawKey(phrase_to_volume_key(phrase.expose_secret())?)
    } else {
        MountSecret::Passphrase(read_passphrase(root, false)?)
    };
    Volume::mount(root, secret, &MountOptions::default())
        .with_context(|| format!("mounting {}", root.display()))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ── `sealfs init` ─────────────────────────────────────────────────────────────

fn cmd_init(
    config: &SealfsConfig,
    root: &Path,
    paranoid: bool,
    block_mac: bool,
    block_size: Option<u32>,
    global_names: bool,
) -> Result<()> {
    let profile = if paranoid { Profile::Paranoid } else { config.volume.profile };
    let mut opts = MountOptions::from_settings(config);
    if block_mac {
        opts.integrity = Some(IntegrityMode::BlockMac);
    }
    if let Some(size) = block_size {
        opts.block_size = size;
    }
    if global_names {
        opts.name_context = NameContextMode::Global;
    }

    let passphrase = read_passphrase(root, true)?;
    let vol = Volume::init(root, &passphrase, profile, &opts)
        .with_context(|| format!("initializing {}", root.display()))?;

    println!("Created {profile} volume at {}", root.display());
    print_record(vol.record());
    println!();
    println!("Record the recovery phrase now: sealfs recovery-key {}", root.display());
    vol.unmount();
    Ok(())
}

// ── `sealfs info` ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct VolumeInfo<'a> {
    root: String,
    version: u32,
    cipher: &'a str,
    profile: Profile,
    block_size: u32,
    integrity: IntegrityMode,
    iv_policy: sealfs_core::IvPolicy,
    name_context: NameContextMode,
    encrypt_symlinks: bool,
    allow_holes: bool,
    created: u64,
    kdf: sealfs_core::config::KdfConfig,
}

fn cmd_info(root: &Path, json: bool) -> Result<()> {
    let record = ControlRecord::load(root).with_context(|| format!("reading {}", root.display()))?;
    if json {
        let info = VolumeInfo {
            root: root.display().to_string(),
            version: record.version,
            cipher: &record.cipher,
            profile: record.profile,
            block_size: record.block_size,
            integrity: record.integrity,
            iv_policy: record.iv_policy,
            name_context: record.name_context,
            encrypt_symlinks: record.encrypt_symlinks,
            allow_holes: record.allow_holes,
            created: record.created,
            kdf: record.kdf,
        };
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Volume: {}", root.display());
        print_record(&record);
    }
    Ok(())
}

fn print_record(record: &ControlRecord) {
    println!("  format:        v{}", record.version);
    println!("  cipher:        {}", record.cipher);
    println!("  profile:       {}", record.profile);
    println!("  block size:    {}", fmt_bytes(record.block_size as u64));
    println!("  integrity:     {}", label(&record.integrity));
    println!("  iv policy:     {}", label(&record.iv_policy));
    println!("  names:         {}", label(&record.name_context));
    println!(
        "  symlinks:      {}",
        if record.encrypt_symlinks { "encrypted" } else { "plain" }
    );
    println!(
        "  holes:         {}",
        if record.holes_enabled() { "sparse" } else { "explicit zero blocks" }
    );
    println!(
        "  kdf:           argon2id m={} KiB t={} p={}",
        record.kdf.mem_cost_kib, record.kdf.time_cost, record.kdf.parallelism
    );
}

/// Settings-file spelling of an enum value
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "?".to_string(),
    }
}

// ── `sealfs ls` / `cat` / `put` ───────────────────────────────────────────────

fn cmd_ls(vol: &Volume, path: &str) -> Result<()> {
    let listing = vol.readdir(path)?;
    for entry in &listing.entries {
        let child = join_path(path, &entry.name);
        match entry.kind {
            FileKind::Directory => println!("d {:>10}  {}/", "-", entry.name),
            FileKind::Symlink => {
                let target = vol.readlink(&child).unwrap_or_else(|e| format!("<{e}>"));
                println!("l {:>10}  {} -> {target}", "-", entry.name);
            }
            FileKind::File => match vol.metadata(&child) {
                Ok(meta) => println!("- {:>10}  {}", fmt_bytes(meta.size), entry.name),
                Err(e) => println!("? {:>10}  {} ({e})", "-", entry.name),
            },
        }
    }
    if !listing.skipped.is_empty() {
        eprintln!("{} backing entries could not be decoded", listing.skipped.len());
    }
    vol.unmount();
    Ok(())
}

fn cmd_cat(vol: &Volume, path: &str) -> Result<()> {
    let file = vol.open(path)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut offset = 0u64;
    loop {
        let chunk = file.read_at(offset, IO_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    out.flush()?;
    drop(file);
    vol.unmount();
    Ok(())
}

fn cmd_put(vol: &Volume, local: &Path, path: &str) -> Result<()> {
    let data = std::fs::read(local).with_context(|| format!("reading {}", local.display()))?;
    let file = match vol.create(path, 0o644) {
        Ok(file) => file,
        Err(SealfsError::AlreadyExists(_)) => {
            let file = vol.open(path)?;
            file.truncate(0)?;
            file
        }
        Err(e) => return Err(e.into()),
    };

    let mut offset = 0usize;
    for chunk in data.chunks(IO_CHUNK) {
        file.write_at(offset as u64, chunk)?;
        offset += chunk.len();
    }
    file.sync()?;
    println!("{} -> {} ({})", local.display(), path, fmt_bytes(data.len() as u64));
    drop(file);
    vol.unmount();
    Ok(())
}

// ── `sealfs verify` ───────────────────────────────────────────────────────────

/// Everything reachable from the volume root
#[derive(Debug, Default)]
struct Inventory {
    files: Vec<String>,
    symlinks: Vec<String>,
    dirs: usize,
    /// Backing entries whose names did not decode
    skipped: Vec<String>,
}

fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{dir}/{name}")
}

fn collect(vol: &Volume, dir: &str, inv: &mut Inventory) -> SealfsResult<()> {
    let listing = vol.readdir(dir)?;
    inv.skipped
        .extend(listing.skipped.iter().map(|encoded| join_path(dir, encoded)));
    for entry in listing.entries {
        let path = join_path(dir, &entry.name);
        match entry.kind {
            FileKind::Directory => {
                inv.dirs += 1;
                collect(vol, &path, inv)?;
            }
            FileKind::File => inv.files.push(path),
            FileKind::Symlink => inv.symlinks.push(path),
        }
    }
    Ok(())
}

/// Read a whole file through the block engine, returning its logical size.
fn verify_file(vol: &Volume, path: &str) -> SealfsResult<u64> {
    let file = vol.open(path)?;
    let size = file.size()?;
    let mut offset = 0u64;
    while offset < size {
        let chunk = file.read_at(offset, IO_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
    }
    Ok(offset)
}

/// Paths that failed, with the reason
fn verify_all(vol: &Volume, inv: &Inventory, pb: &ProgressBar) -> (u64, Vec<(String, SealfsError)>) {
    let results: Vec<(String, SealfsResult<u64>)> = inv
        .files
        .par_iter()
        .map(|path| {
            let result = verify_file(vol, path);
            pb.inc(1);
            (path.clone(), result)
        })
        .collect();

    let mut bytes = 0;
    let mut failures = Vec::new();
    for (path, result) in results {
        match result {
            Ok(n) => bytes += n,
            Err(e) => failures.push((path, e)),
        }
    }
    for path in &inv.symlinks {
        if let Err(e) = vol.readlink(path) {
            failures.push((path.clone(), e));
        }
        pb.inc(1);
    }
    (bytes, failures)
}

fn cmd_verify(vol: &Volume) -> Result<()> {
    let mut inv = Inventory::default();
    collect(vol, "/", &mut inv).context("walking volume")?;

    let pb = make_progress_bar((inv.files.len() + inv.symlinks.len()) as u64, "verify");
    let (bytes, failures) = verify_all(vol, &inv, &pb);
    pb.finish_and_clear();
    vol.unmount();

    println!("Verified:");
    println!("  directories: {}", inv.dirs);
    println!("  files:       {} ({})", inv.files.len(), fmt_bytes(bytes));
    println!("  symlinks:    {}", inv.symlinks.len());
    for encoded in &inv.skipped {
        println!("  UNDECODABLE  {encoded}");
    }
    for (path, err) in &failures {
        println!("  FAILED       {path}: {err}");
    }

    let bad = failures.len() + inv.skipped.len();
    if bad > 0 {
        anyhow::bail!("{bad} entries failed verification");
    }
    println!("  status:      ok");
    Ok(())
}

// ── `sealfs recovery-key` ─────────────────────────────────────────────────────

fn cmd_recovery_key(vol: &Volume) -> Result<()> {
    let phrase = vol.recovery_phrase()?;
    vol.unmount();
    eprintln!("Anyone holding these words can decrypt the volume. Store them offline.");
    println!("{phrase}");
    Ok(())
}

// ── `sealfs config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &SealfsConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use sealfs_core::config::KdfConfig;
    use tempfile::TempDir;

    fn test_volume(dir: &TempDir) -> Volume {
        let opts = MountOptions {
            kdf: KdfConfig {
                mem_cost_kib: 1024,
                time_cost: 1,
                parallelism: 1,
            },
            ..MountOptions::default()
        };
        Volume::init(dir.path(), &SecretString::from("pw"), Profile::Paranoid, &opts).unwrap()
    }

    #[test]
    fn test_log_flag_overrides_rust_log() {
        use tracing_subscriber::filter::LevelFilter;

        std::env::set_var("RUST_LOG", "trace");
        let explicit = log_filter(Some("warn"), "info").max_level_hint();
        let from_env = log_filter(None, "info").max_level_hint();
        std::env::remove_var("RUST_LOG");

        assert_eq!(explicit, Some(LevelFilter::WARN));
        assert_eq!(from_env, Some(LevelFilter::TRACE));
        assert_eq!(log_filter(None, "error").max_level_hint(), Some(LevelFilter::ERROR));
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_init_flags() {
        let cli = Cli::try_parse_from([
            "sealfs",
            "init",
            "/tmp/vol",
            "--paranoid",
            "--block-size",
            "4096",
            "--global-names",
        ])
        .unwrap();
        match cli.command {
            Commands::Init {
                paranoid,
                block_mac,
                block_size,
                global_names,
                ..
            } => {
                assert!(paranoid);
                assert!(!block_mac);
                assert_eq!(block_size, Some(4096));
                assert!(global_names);
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn test_recovery_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["sealfs", "ls", "/tmp/vol", "--recovery"]).unwrap();
        assert!(cli.recovery);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(join_path("/a/", "b"), "/a/b");
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_label_uses_settings_spelling() {
        assert_eq!(label(&IntegrityMode::BlockMac), "block-mac");
        assert_eq!(label(&NameContextMode::PerDirectory), "per-directory");
    }

    #[test]
    fn test_missing_config_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_verify_walks_and_reads_everything() {
        let tmp = TempDir::new().unwrap();
        let vol = test_volume(&tmp);
        vol.mkdir("docs", 0o755).unwrap();
        vol.create("docs/a.txt", 0o644).unwrap().write_at(0, &[1u8; 5000]).unwrap();
        vol.create("b.bin", 0o644).unwrap().write_at(0, b"bee").unwrap();
        vol.symlink("docs/a.txt", "link").unwrap();

        let mut inv = Inventory::default();
        collect(&vol, "/", &mut inv).unwrap();
        assert_eq!(inv.dirs, 1);
        assert_eq!(inv.files.len(), 2);
        assert_eq!(inv.symlinks, vec!["/link".to_string()]);
        assert!(inv.skipped.is_empty());

        let pb = ProgressBar::hidden();
        let (bytes, failures) = verify_all(&vol, &inv, &pb);
        assert_eq!(bytes, 5003);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_verify_reports_tampered_file() {
        let tmp = TempDir::new().unwrap();
        let vol = test_volume(&tmp);
        vol.create("victim", 0o644).unwrap().write_at(0, &[9u8; 100]).unwrap();

        let backing = vol.root().join(vol.encode_path("victim").unwrap());
        let mut raw = std::fs::read(&backing).unwrap();
        raw[30] ^= 0x01;
        std::fs::write(&backing, &raw).unwrap();

        let mut inv = Inventory::default();
        collect(&vol, "/", &mut inv).unwrap();
        let (_, failures) = verify_all(&vol, &inv, &ProgressBar::hidden());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "/victim");
        assert!(matches!(failures[0].1, SealfsError::Integrity { block: 0 }));
    }
}
