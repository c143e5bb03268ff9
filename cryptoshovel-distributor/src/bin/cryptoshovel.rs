//! Cryptoshovel CLI: key material, one-off sealing and the long-running roles
//!
//! Usage:
//!   cryptoshovel keygen --output <dir> [--name <name>] [--bits <bits>]
//!   cryptoshovel keygen --symmetric --output <file>
//!   cryptoshovel fingerprint <public or private pem>
//!   cryptoshovel seal (--registry <file> | --key <file>) [--routing-key <rk>]
//!                     [--input <file>] --output <file>
//!   cryptoshovel open (--registry <file> | --key <file>) [--input <file>] [--output <file>]
//!   cryptoshovel inspect <file>
//!   cryptoshovel distribute --config <file>
//!   cryptoshovel receive --config <file> [--once]

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use cryptoshovel_distributor::config::require;
use cryptoshovel_distributor::{
    drain_inbox, AuditSink, DecryptingEndpoint, DistributorService, FileAuditSink, FileWatcher,
    Inbound, KeyDirectory, KeyDistributor, OutboxTransport, ShovelConfig, SystemClock,
    TracingAuditSink, TransportError,
};
use cryptoshovel_envelope::{
    inspect, EnvelopeKind, Fingerprint, KeyId, KeyRegistry, KeySource, Message, RsaIdentity,
    SymmetricKey,
};

type CliResult = Result<(), Box<dyn std::error::Error>>;

const DEFAULT_RSA_BITS: usize = 2048;

fn main() -> ExitCode {
    init_tracing();
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        return ExitCode::from(1);
    }

    let result = match args[1].as_str() {
        "keygen" => cmd_keygen(&args[2..]),
        "fingerprint" => cmd_fingerprint(&args[2..]),
        "seal" => cmd_seal(&args[2..]),
        "open" => cmd_open(&args[2..]),
        "inspect" => cmd_inspect(&args[2..]),
        "distribute" => cmd_distribute(&args[2..]),
        "receive" => cmd_receive(&args[2..]),
        "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "--version" | "-V" => {
            println!("cryptoshovel {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        cmd => {
            eprintln!("error: unknown command '{}'", cmd);
            print_usage();
            Err("unknown command".into())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// `CRYPTOSHOVEL_LOG_FORMAT=json` for structured logs; `RUST_LOG` filters.
fn init_tracing() {
    let log_format = std::env::var("CRYPTOSHOVEL_LOG_FORMAT").unwrap_or_else(|_| "pretty".into());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            "cryptoshovel=info,cryptoshovel_distributor=info,cryptoshovel_envelope=info".into()
        });
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"Cryptoshovel: encrypted message shovels with rotating keys

USAGE:
    cryptoshovel <COMMAND> [OPTIONS]

COMMANDS:
    keygen        Generate an RSA identity or a pre-shared symmetric key
    fingerprint   Print the fingerprint of an RSA key
    seal          Encrypt a message body
    open          Decrypt a message body
    inspect       Show envelope metadata (no decryption)
    distribute    Run the key distributor
    receive       Install key envelopes from an inbox

EXAMPLES:
    # Identities for the distributor and a receiver
    cryptoshovel keygen --output ./keys --name distributor
    cryptoshovel keygen --output ./keys --name receiver1

    # Pre-shared key mode
    cryptoshovel keygen --symmetric --output shared.key
    cryptoshovel seal --key shared.key --routing-key orders.new --input body.json --output body.enc
    cryptoshovel open --key shared.key --input body.enc

    # Managed mode
    cryptoshovel distribute --config ./distributor.json
    cryptoshovel receive --config ./receiver1.json
    cryptoshovel open --registry ./receiver1-keys.json --input body.enc

OPTIONS:
    -h, --help       Print help
    -V, --version    Print version
"#
    );
}

fn next_value<'a>(args: &'a [String], i: &mut usize, what: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("missing {}", what))
}

fn read_input(path: &Option<PathBuf>) -> io::Result<Vec<u8>> {
    match path {
        Some(path) => fs::read(path),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

fn cmd_keygen(args: &[String]) -> CliResult {
    let mut output: Option<PathBuf> = None;
    let mut name = "identity".to_string();
    let mut bits = DEFAULT_RSA_BITS;
    let mut symmetric = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--output" | "-o" => {
                output = Some(PathBuf::from(next_value(args, &mut i, "output path")?))
            }
            "--name" | "-n" => name = next_value(args, &mut i, "name")?.to_string(),
            "--bits" => bits = next_value(args, &mut i, "bits")?.parse()?,
            "--symmetric" => symmetric = true,
            _ => return Err(format!("unknown option: {}", args[i]).into()),
        }
        i += 1;
    }
    let output = output.ok_or("missing --output")?;

    if symmetric {
        let key = SymmetricKey::generate(Utc::now()).with_id(KeyId::generate());
        write_secret(&output, key.export().as_bytes())?;
        let id = key.id().map(|id| id.to_base64()).unwrap_or_default();
        eprintln!("Generated symmetric key {}", id);
        eprintln!("  Key file: {} (mode 600)", output.display());
        return Ok(());
    }

    fs::create_dir_all(&output)?;
    let identity = RsaIdentity::generate(bits)?;
    let private_path = output.join(format!("{}.private.pem", name));
    let public_path = output.join(format!("{}.public.pem", name));

    write_secret(&private_path, identity.private_pem()?.as_bytes())?;
    fs::write(&public_path, identity.public_pem()?)?;

    eprintln!("Generated {}-bit RSA identity:", bits);
    eprintln!("  Public key:   {}", public_path.display());
    eprintln!("  Private key:  {} (mode 600)", private_path.display());
    eprintln!("  Fingerprint:  {}", identity.fingerprint());
    Ok(())
}

fn write_secret(path: &Path, data: &[u8]) -> io::Result<()> {
    fs::write(path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn cmd_fingerprint(args: &[String]) -> CliResult {
    let path = args.first().ok_or("missing key file")?;
    let pem = fs::read_to_string(path)?;
    let identity =
        RsaIdentity::from_public_pem(&pem).or_else(|_| RsaIdentity::from_private_pem(&pem))?;
    println!("{}", identity.fingerprint());
    Ok(())
}

// ---------------------------------------------------------------------------
// One-off sealing
// ---------------------------------------------------------------------------

enum KeyArg {
    Registry(KeyRegistry),
    Shared(SymmetricKey),
}

impl KeyArg {
    fn source(&self) -> KeySource<'_> {
        match self {
            Self::Registry(registry) => KeySource::Registry(registry),
            Self::Shared(key) => KeySource::Bare(key),
        }
    }
}

struct CodecArgs {
    keys: Option<KeyArg>,
    routing_key: Option<String>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
}

fn parse_codec_args(args: &[String]) -> Result<CodecArgs, Box<dyn std::error::Error>> {
    let mut parsed = CodecArgs {
        keys: None,
        routing_key: None,
        input: None,
        output: None,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--registry" | "-r" => {
                let registry = KeyRegistry::open(next_value(args, &mut i, "registry path")?)?;
                parsed.keys = Some(KeyArg::Registry(registry));
            }
            "--key" | "-k" => {
                let export = fs::read_to_string(next_value(args, &mut i, "key path")?)?;
                parsed.keys = Some(KeyArg::Shared(SymmetricKey::import(export.trim())?));
            }
            "--routing-key" => {
                parsed.routing_key = Some(next_value(args, &mut i, "routing key")?.to_string())
            }
            "--input" | "-i" => {
                parsed.input = Some(PathBuf::from(next_value(args, &mut i, "input path")?))
            }
            "--output" | "-o" => {
                parsed.output = Some(PathBuf::from(next_value(args, &mut i, "output path")?))
            }
            _ => return Err(format!("unknown option: {}", args[i]).into()),
        }
        i += 1;
    }
    Ok(parsed)
}

fn cmd_seal(args: &[String]) -> CliResult {
    let parsed = parse_codec_args(args)?;
    let keys = parsed.keys.as_ref().ok_or("missing --registry or --key")?;
    let output = parsed.output.as_ref().ok_or("missing --output")?;

    let mut message = Message::new(read_input(&parsed.input)?);
    if let Some(routing_key) = &parsed.routing_key {
        message = message.with_routing_key(routing_key.as_str());
    }
    let plaintext_len = message.content.len();
    message.encrypt(keys.source())?;
    fs::write(output, &message.content)?;

    eprintln!("Encrypted {} bytes -> {} bytes", plaintext_len, message.content.len());
    eprintln!("Output: {}", output.display());
    Ok(())
}

fn cmd_open(args: &[String]) -> CliResult {
    let parsed = parse_codec_args(args)?;
    let keys = parsed.keys.as_ref().ok_or("missing --registry or --key")?;

    let mut message = Message::new(read_input(&parsed.input)?);
    let envelope_len = message.content.len();
    let routing_key = message.decrypt(keys.source())?;

    if let Some(routing_key) = routing_key {
        eprintln!("Routing key: {}", routing_key);
    }
    match &parsed.output {
        Some(path) => {
            fs::write(path, &message.content)?;
            eprintln!("Decrypted {} bytes -> {} bytes", envelope_len, message.content.len());
            eprintln!("Output: {}", path.display());
        }
        None => io::stdout().write_all(&message.content)?,
    }
    Ok(())
}

fn cmd_inspect(args: &[String]) -> CliResult {
    let path = args.first().ok_or("missing file path")?;
    let data = fs::read(path)?;

    match inspect(&data) {
        EnvelopeKind::ManagedMessage { key_id, ciphertext_len } => {
            println!("Message Envelope (registry key)");
            println!("===============================");
            println!("Key Id:          {}", KeyId::from_bytes(key_id).to_base64());
            println!("Ciphertext:      {} bytes", ciphertext_len);
        }
        EnvelopeKind::Key { fingerprint, ciphertext_len, signature_len } => {
            println!("Key Envelope");
            println!("============");
            println!("Recipient:       {}", Fingerprint::from_bytes(fingerprint));
            println!("RSA Ciphertext:  {} bytes", ciphertext_len);
            println!("Signature:       {} bytes", signature_len);
        }
        EnvelopeKind::Unframed { len } => {
            println!("Unframed data (pre-shared key message, or not an envelope)");
            println!("Size:            {} bytes", len);
        }
    }
    println!("Total Size:      {} bytes", data.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Long-running roles
// ---------------------------------------------------------------------------

fn load_config(args: &[String]) -> Result<(ShovelConfig, bool), Box<dyn std::error::Error>> {
    let mut path: Option<PathBuf> = None;
    let mut once = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                path = Some(PathBuf::from(next_value(args, &mut i, "config path")?))
            }
            "--once" => once = true,
            _ => return Err(format!("unknown option: {}", args[i]).into()),
        }
        i += 1;
    }

    let mut config = match path {
        Some(path) => ShovelConfig::load(&path)?,
        None => ShovelConfig::default(),
    };
    config.apply_env()?;
    Ok((config, once))
}

fn open_registry(config: &ShovelConfig) -> Result<KeyRegistry, Box<dyn std::error::Error>> {
    Ok(match &config.persist_file {
        Some(path) => KeyRegistry::open(path)?,
        None => {
            tracing::warn!("no persistFile configured, keys are kept in memory only");
            KeyRegistry::new()
        }
    })
}

fn audit_sink(config: &ShovelConfig) -> Arc<dyn AuditSink> {
    match &config.audit_log {
        Some(path) => Arc::new(FileAuditSink::new(path.clone())),
        None => Arc::new(TracingAuditSink),
    }
}

fn cmd_distribute(args: &[String]) -> CliResult {
    let (config, _) = load_config(args)?;
    let identity = Arc::new(config.identity()?);
    let membership = require(&config.receiver_config_file, "receiverConfigFile")?;
    let key_folder = require(&config.receiver_rsa_key_folder, "receiverRsaKeyFolder")?;
    let outbox = require(&config.outbox, "outbox")?;

    let registry = Arc::new(RwLock::new(open_registry(&config)?));
    let audit = audit_sink(&config);
    let distributor = KeyDistributor::new(
        config.distribution,
        identity,
        Arc::new(KeyDirectory::new(key_folder)),
        registry,
        audit.clone(),
    )?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (changes, watcher) = FileWatcher::new(membership, config.poll_interval()).spawn();
        let transport = Arc::new(OutboxTransport::new(outbox));
        let service = DistributorService::new(distributor, transport, audit, SystemClock);
        let handle = service.spawn(changes);
        tracing::info!(
            membership = %membership.display(),
            outbox = %outbox.display(),
            "distributing keys, Ctrl-C to stop"
        );

        let stopped = tokio::signal::ctrl_c().await;
        handle.stop().await;
        watcher.abort();
        stopped?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn cmd_receive(args: &[String]) -> CliResult {
    let (config, once) = load_config(args)?;
    let identity = Arc::new(config.identity()?);
    let sender = Arc::new(config.sender_identity()?);
    let inbox = require(&config.inbox, "inbox")?;

    let registry = Arc::new(RwLock::new(open_registry(&config)?));
    let endpoint = Arc::new(DecryptingEndpoint::managed(
        identity,
        sender,
        registry,
        audit_sink(&config),
    )?);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut ticker = tokio::time::interval(config.poll_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => break,
            }

            let endpoint = endpoint.clone();
            let inbox = inbox.to_path_buf();
            tokio::task::spawn_blocking(move || receive_pending(&endpoint, &inbox)).await??;
            if once {
                break;
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Install every key envelope waiting in `inbox`.
fn receive_pending(endpoint: &DecryptingEndpoint, inbox: &Path) -> Result<(), TransportError> {
    for envelope in drain_inbox(inbox)? {
        match endpoint.handle(Utc::now(), envelope) {
            Ok(Inbound::KeyInstalled(_)) => {}
            Ok(Inbound::NotForMe) => tracing::debug!("key envelope for another receiver skipped"),
            Ok(Inbound::Message(_)) => tracing::warn!("message envelope in key inbox skipped"),
            Err(e) => tracing::warn!(error = %e, "could not process envelope"),
        }
    }
    Ok(())
}
