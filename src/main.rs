#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use wvcrypto::context::CryptoContext;
use wvcrypto::crypto_session::{CryptoSession, DecryptionParams};
use wvcrypto::oemcrypto::{CipherMode, LicenseType, PatternDesc, SecurityLevel};
use wvcrypto::properties::Properties;
use wvcrypto::software::{LicenseBuilder, SoftwareEngine, SoftwareEngineConfig};

#[cfg(feature = "chrono")]
use chrono::Datelike;

use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "wvcrypto", version, disable_version_flag = true, about = "wvcrypto CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// Session layer properties (YAML).
    #[arg(short = 'p', long = "properties", global = true)]
    properties: Option<PathBuf>,

    /// Software engine configuration (YAML).
    #[arg(short = 'e', long = "engine", global = true)]
    engine: Option<PathBuf>,

    /// Request the L3 engine instead of the device default.
    #[arg(long = "l3", action = ArgAction::SetTrue, global = true)]
    l3: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Ctr,
    Cbc,
}

impl From<Mode> for CipherMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Ctr => CipherMode::Ctr,
            Mode::Cbc => CipherMode::Cbc,
        }
    }
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Open a session and print what the engine reports about the device.
    Info,
    /// Load a content key into a session and decrypt a file with it.
    ///
    /// The license is built locally for the software engine's device key, so
    /// this exercises the whole load/select/decrypt path without a server.
    Decrypt {
        /// Content key (hex, 16 bytes).
        #[arg(short = 'k', long = "key")]
        key: String,
        /// Key id (hex).
        #[arg(long = "key-id", default_value = "00000000000000000000000000000001")]
        kid: String,
        /// Initial IV (hex, 16 bytes).
        #[arg(long = "iv")]
        iv: String,
        #[arg(short = 'm', long = "mode", value_enum, default_value = "ctr")]
        mode: Mode,
        /// Encrypt:skip pattern in blocks, e.g. `1:9`.
        #[arg(long = "pattern")]
        pattern: Option<String>,
        /// Largest buffer the engine accepts in one call; larger inputs are
        /// decrypted in chunks.
        #[arg(long = "max-buffer")]
        max_buffer: Option<usize>,
        input: PathBuf,
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };

    tracing_subscriber::fmt().with_max_level(level).init();

    let version = env!("CARGO_PKG_VERSION");
    info!("wvcrypto version {} ({})", version, current_year());

    if cli.version {
        return Ok(());
    }

    let security_level = if cli.l3 {
        SecurityLevel::Level3
    } else {
        SecurityLevel::Default
    };
    let properties = match &cli.properties {
        Some(path) => Properties::from_path(path).context("Failed to load properties")?,
        None => Properties::default(),
    };
    let mut engine_config = match &cli.engine {
        Some(path) => SoftwareEngineConfig::from_path(path).context("Failed to load engine config")?,
        None => SoftwareEngineConfig::default(),
    };

    match cli.command {
        Some(Commands::Info) => run_info(properties, engine_config, security_level),
        Some(Commands::Decrypt {
            key,
            kid,
            iv,
            mode,
            pattern,
            max_buffer,
            input,
            output,
        }) => {
            if max_buffer.is_some() {
                engine_config.max_buffer_size = max_buffer;
            }
            run_decrypt(
                properties,
                engine_config,
                security_level,
                &DecryptArgs {
                    key: &key,
                    kid: &kid,
                    iv: &iv,
                    mode: mode.into(),
                    pattern: pattern.as_deref(),
                    input: &input,
                    output: &output,
                },
            )
        }
        None => Ok(()),
    }
}

fn current_year() -> i64 {
    #[cfg(feature = "chrono")]
    {
        chrono::Local::now().year().into()
    }
    #[cfg(not(feature = "chrono"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() / 31_536_000 + 1970)
            .unwrap_or(2024) as i64
    }
}

fn open_session(
    properties: Properties,
    engine_config: SoftwareEngineConfig,
    security_level: SecurityLevel,
) -> anyhow::Result<CryptoSession> {
    let engine = SoftwareEngine::from_config(engine_config)?;
    let context = CryptoContext::new(Arc::new(engine), properties);
    let mut session = CryptoSession::new(context);
    session.open(security_level).context("Failed to open crypto session")?;
    Ok(session)
}

fn run_info(
    properties: Properties,
    engine_config: SoftwareEngineConfig,
    security_level: SecurityLevel,
) -> anyhow::Result<()> {
    let buffer_type = properties.destination_buffer_type();
    let session = open_session(properties, engine_config, security_level)?;

    println!("security_level: {:?}", session.get_security_level());
    println!("api_version: {}", session.get_api_version()?);
    println!("token_type: {:?}", session.pre_provision_token_type());
    match session.system_id() {
        Some(system_id) => println!("system_id: {}", system_id),
        None => println!("system_id: none"),
    }
    println!("request_id: {}", session.request_id());
    match session.get_external_device_unique_id() {
        Ok(id) => println!("device_id: {}", hex::encode(id)),
        Err(err) => warn!("device id unavailable: {}", err),
    }
    match session.get_provisioning_id() {
        Ok(id) => println!("provisioning_id: {}", hex::encode(id)),
        Err(err) => warn!("provisioning id unavailable: {}", err),
    }
    match session.get_hdcp_capabilities() {
        Ok((current, max)) => println!("hdcp: {:?} (max {:?})", current, max),
        Err(err) => warn!("HDCP capability unavailable: {}", err),
    }
    println!(
        "sessions: {} open, {} max",
        session.get_number_of_open_sessions()?,
        session.get_max_number_of_sessions()?
    );
    match session.get_srm_version() {
        Ok(version) => println!("srm_version: {}", version),
        Err(_) => println!("srm_version: unsupported"),
    }
    println!("usage_support: {:?}", session.get_usage_support_type()?);
    match buffer_type {
        Some(buffer_type) => println!("buffer_type: {:?}", buffer_type),
        None => println!("buffer_type: none"),
    }
    println!("resource_rating_tier: {}", session.get_resource_rating_tier());
    if let Some(build) = session.get_build_information() {
        println!("build: {}", build);
    }
    Ok(())
}

struct DecryptArgs<'a> {
    key: &'a str,
    kid: &'a str,
    iv: &'a str,
    mode: CipherMode,
    pattern: Option<&'a str>,
    input: &'a Path,
    output: &'a Path,
}

fn parse_pattern(pattern: Option<&str>) -> anyhow::Result<PatternDesc> {
    let Some(pattern) = pattern else {
        return Ok(PatternDesc::default());
    };
    let (encrypt, skip) = pattern
        .split_once(':')
        .with_context(|| format!("Invalid pattern '{}', expected encrypt:skip", pattern))?;
    Ok(PatternDesc {
        encrypt: encrypt.trim().parse().context("Invalid pattern encrypt count")?,
        skip: skip.trim().parse().context("Invalid pattern skip count")?,
    })
}

fn run_decrypt(
    properties: Properties,
    engine_config: SoftwareEngineConfig,
    security_level: SecurityLevel,
    args: &DecryptArgs<'_>,
) -> anyhow::Result<()> {
    let key: [u8; 16] = hex::decode(args.key)
        .context("Invalid key hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("Key must be 16 bytes"))?;
    let iv: [u8; 16] = hex::decode(args.iv)
        .context("Invalid IV hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("IV must be 16 bytes"))?;
    let kid = hex::decode(args.kid).context("Invalid key id hex")?;
    let pattern = parse_pattern(args.pattern)?;

    let device_key = engine_config.device_key.clone();
    let session = open_session(properties, engine_config, security_level)?;

    let request = format!("wvcrypto-cli-request-{}", session.request_id()).into_bytes();
    session.generate_derived_keys(&request)?;
    let license = LicenseBuilder::new(&device_key, &request)?
        .content_key(&kid, key, args.mode)
        .build();
    session.load_keys(&license.license_keys(), LicenseType::Content)?;

    let input = std::fs::read(args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    if input.is_empty() {
        bail!("{} is empty", args.input.display());
    }
    let mut output = vec![0u8; input.len()];
    let mut params = DecryptionParams::new(&kid, &input, iv, &mut output);
    params.cipher_mode = args.mode;
    params.pattern = pattern;
    session.decrypt(&mut params)?;

    std::fs::write(args.output, &output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    info!("Decrypted {} bytes to {}", input.len(), args.output.display());
    Ok(())
}
