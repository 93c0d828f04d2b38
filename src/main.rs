//! Command line interface for negotiating reservations: key generation, time
//! conversion, proof-of-work mining, sending each of the four reservation
//! messages and reading the inbox.

use std::{fs, ops::ControlFlow, path::Path};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reswire::{
    cipher::ConversationCipher,
    config::{Settings, DEFAULT_POW_MAX_ITERATIONS},
    event::{unix_now, Keys, UnsignedEvent},
    negotiation::{build_threads, open_messages, ConversationThread},
    pow::{self, MineOptions, MineProgress},
    publisher::NegotiationPublisher,
    relay::{MemoryRelay, RelayPublisher},
    reservation::{
        BuildContext, ReservationPayload, ReservationRequest, ReservationResponse, ResponseStatus,
    },
    thread::EventRef,
    time_codec,
};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "reswire",
    author,
    version,
    about = "Private reservation negotiation over Nostr relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity.
    Keygen {
        /// Store the secret key as SECRET_KEY in the env file.
        #[arg(long)]
        save: bool,
    },
    /// Convert between ISO-8601 and (unix, tzid).
    Time {
        #[command(subcommand)]
        action: TimeAction,
    },
    /// Mine a record to a proof-of-work difficulty and print it.
    Mine {
        #[arg(long)]
        difficulty: u32,
        #[arg(long, default_value_t = DEFAULT_POW_MAX_ITERATIONS)]
        max_iterations: u64,
        #[arg(long, default_value_t = 1)]
        kind: u32,
        #[arg(long, default_value = "")]
        content: String,
    },
    /// Send a reservation request.
    Request(RequestArgs),
    /// Answer a reservation request.
    Respond(ResponseArgs),
    /// Ask to change an existing reservation.
    Modify {
        /// Inner id of the original request.
        #[arg(long)]
        root: String,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Answer a modification request.
    ModifyRespond(ResponseArgs),
    /// Fetch, open and print every negotiation addressed to us.
    Inbox {
        /// Only envelopes newer than this Unix time.
        #[arg(long)]
        since: Option<u64>,
    },
}

/// Operations available under `reswire time`.
#[derive(Subcommand)]
enum TimeAction {
    /// ISO-8601 with offset to `unix tzid`.
    Encode {
        iso: String,
        /// Zone to attach instead of inferring one from the offset.
        #[arg(long)]
        tzid: Option<String>,
    },
    /// `unix tzid` to ISO-8601 in that zone.
    Decode {
        #[arg(allow_hyphen_values = true)]
        unix: i64,
        tzid: String,
    },
}

#[derive(Args)]
struct RequestArgs {
    /// Recipient public key (hex).
    #[arg(long)]
    to: String,
    #[arg(long)]
    party_size: u8,
    /// ISO-8601 with offset, or Unix seconds together with --tzid.
    #[arg(long, allow_hyphen_values = true)]
    time: String,
    #[arg(long)]
    tzid: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// `tel:` URI.
    #[arg(long)]
    telephone: Option<String>,
    /// `mailto:` URI.
    #[arg(long)]
    email: Option<String>,
    /// Seconds.
    #[arg(long)]
    duration: Option<u64>,
    #[arg(long)]
    earliest: Option<String>,
    #[arg(long)]
    latest: Option<String>,
    #[arg(long)]
    message: Option<String>,
    /// Build and print the envelopes without contacting any relay.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ResponseArgs {
    /// Recipient public key (hex).
    #[arg(long)]
    to: String,
    /// Inner id of the original request.
    #[arg(long)]
    root: String,
    #[arg(long, value_enum)]
    status: StatusArg,
    #[arg(long, allow_hyphen_values = true)]
    time: Option<String>,
    #[arg(long)]
    tzid: Option<String>,
    #[arg(long)]
    duration: Option<u64>,
    #[arg(long)]
    message: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Confirmed,
    Declined,
    Cancelled,
}

impl From<StatusArg> for ResponseStatus {
    fn from(s: StatusArg) -> Self {
        match s {
            StatusArg::Confirmed => ResponseStatus::Confirmed,
            StatusArg::Declined => ResponseStatus::Declined,
            StatusArg::Cancelled => ResponseStatus::Cancelled,
        }
    }
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Keygen { save } => {
            let keys = Keys::generate();
            if save {
                write_env_var(&cli.env, "SECRET_KEY", &keys.secret_key_hex())?;
                tracing::info!(env = %cli.env, "secret key saved");
            } else {
                println!("secret {}", keys.secret_key_hex());
            }
            println!("public {}", keys.public_key_hex());
        }
        Commands::Time { action } => match action {
            TimeAction::Encode { iso, tzid } => {
                let encoded = match tzid {
                    Some(zone) => time_codec::encode_in_zone(&iso, &zone)?,
                    None => time_codec::encode(&iso)?,
                };
                if encoded.source.is_inferred() {
                    tracing::warn!(tzid = %encoded.tzid, source = ?encoded.source, "zone inferred from offset");
                }
                println!("{} {}", encoded.unix, encoded.tzid);
            }
            TimeAction::Decode { unix, tzid } => {
                println!("{}", time_codec::decode(unix, &tzid)?);
            }
        },
        Commands::Mine {
            difficulty,
            max_iterations,
            kind,
            content,
        } => {
            let keys = cfg.keys().unwrap_or_else(|_| Keys::generate());
            let draft = UnsignedEvent::new(keys.public_key_hex(), unix_now(), kind, vec![], content);
            let opts = MineOptions::new(difficulty, max_iterations);
            let mined = tokio::task::spawn_blocking(move || {
                let mut report = |p: MineProgress| {
                    tracing::info!(iterations = p.iterations, best = p.best_difficulty, "mining");
                    ControlFlow::Continue(())
                };
                pow::mine(draft, &opts, Some(&mut report))
            })
            .await??;
            tracing::info!(nonce = mined.nonce, difficulty = mined.difficulty, "mined");
            println!("{}", serde_json::to_string(&mined.event)?);
        }
        Commands::Request(args) => {
            let req = to_request(&args)?;
            send(&cfg, ReservationPayload::Request(req), &args.to, None, args.dry_run).await?;
        }
        Commands::Modify { root, request } => {
            let req = to_request(&request)?;
            let payload = ReservationPayload::ModificationRequest(req);
            send(&cfg, payload, &request.to, Some(root), request.dry_run).await?;
        }
        Commands::Respond(args) => {
            let payload = ReservationPayload::Response(to_response(&args)?);
            send(&cfg, payload, &args.to, Some(args.root.clone()), args.dry_run).await?;
        }
        Commands::ModifyRespond(args) => {
            let payload = ReservationPayload::ModificationResponse(to_response(&args)?);
            send(&cfg, payload, &args.to, Some(args.root.clone()), args.dry_run).await?;
        }
        Commands::Inbox { since } => {
            let keys = cfg.keys()?;
            for thread in load_threads(&cfg, &keys, since).await? {
                print_thread(&thread);
            }
        }
    }
    Ok(())
}

/// `value` as `(unix, tzid)`: ISO-8601 is encoded, bare Unix seconds need a
/// zone.
fn parse_when(value: &str, tzid: Option<&str>) -> Result<(i64, String)> {
    if let Ok(unix) = value.parse::<i64>() {
        let tzid = tzid.context("--tzid is required with a numeric time")?;
        time_codec::decode(unix, tzid)?;
        return Ok((unix, tzid.to_string()));
    }
    let encoded = match tzid {
        Some(zone) => time_codec::encode_in_zone(value, zone)?,
        None => time_codec::encode(value)?,
    };
    if encoded.source.is_inferred() {
        tracing::warn!(time = value, tzid = %encoded.tzid, "zone inferred from offset; pass --tzid to be exact");
    }
    Ok((encoded.unix, encoded.tzid))
}

fn to_request(args: &RequestArgs) -> Result<ReservationRequest> {
    let (time, tzid) = parse_when(&args.time, args.tzid.as_deref())?;
    let bound = |v: &Option<String>| -> Result<Option<i64>> {
        v.as_deref()
            .map(|t| parse_when(t, Some(&tzid)).map(|(unix, _)| unix))
            .transpose()
    };
    Ok(ReservationRequest {
        party_size: args.party_size,
        time,
        earliest_time: bound(&args.earliest)?,
        latest_time: bound(&args.latest)?,
        tzid: tzid.clone(),
        name: args.name.clone(),
        telephone: args.telephone.clone(),
        email: args.email.clone(),
        duration: args.duration,
        message: args.message.clone(),
    })
}

fn to_response(args: &ResponseArgs) -> Result<ReservationResponse> {
    let (time, tzid) = match &args.time {
        Some(t) => {
            let (unix, zone) = parse_when(t, args.tzid.as_deref())?;
            (Some(unix), Some(zone))
        }
        None => (None, args.tzid.clone()),
    };
    Ok(ReservationResponse {
        status: args.status.into(),
        time,
        tzid,
        duration: args.duration,
        message: args.message.clone(),
    })
}

/// Build, wrap and publish one message. Prints the inner id, which later
/// messages pass as `--root`.
async fn send(
    cfg: &Settings,
    payload: ReservationPayload,
    to: &str,
    root: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let keys = cfg.keys()?;
    let mut ctx = BuildContext::new();
    if let Some(root) = root {
        ctx = ctx.with_root(EventRef::new(root));
    }
    if let Some(opts) = cfg.mine_options() {
        ctx = ctx.with_pow(opts);
    }
    if dry_run {
        let publisher = NegotiationPublisher::new(MemoryRelay::new());
        let delivery = publisher
            .send_to_recipient_and_self(&payload, &keys, to, ctx)
            .await?;
        let out = serde_json::json!({
            "inner": delivery.inner,
            "to_recipient": delivery.recipient_envelope,
            "to_self": delivery.self_envelope,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    anyhow::ensure!(
        !cfg.relays.is_empty(),
        "no relays configured; set RELAYS or pass --dry-run"
    );
    deliver(NegotiationPublisher::new(cfg.relay_pool()), &payload, &keys, to, ctx).await
}

async fn deliver<R: RelayPublisher>(
    publisher: NegotiationPublisher<R>,
    payload: &ReservationPayload,
    keys: &Keys,
    to: &str,
    ctx: BuildContext,
) -> Result<()> {
    let delivery = publisher
        .send_to_recipient_and_self(payload, keys, to, ctx)
        .await?;
    println!("{}", delivery.inner_id);
    delivery
        .into_result()
        .context("message was not delivered to every target")?;
    Ok(())
}

async fn load_threads(
    cfg: &Settings,
    keys: &Keys,
    since: Option<u64>,
) -> Result<Vec<ConversationThread>> {
    let envelopes = cfg
        .relay_pool()
        .fetch_envelopes(&keys.public_key_hex(), since)
        .await?;
    tracing::info!(envelopes = envelopes.len(), "fetched inbox");
    Ok(build_threads(open_messages(
        &ConversationCipher,
        &envelopes,
        keys,
    )))
}

fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

fn describe(payload: &ReservationPayload) -> String {
    let when = |time: i64, tzid: &str| {
        time_codec::decode(time, tzid).unwrap_or_else(|_| format!("{time} {tzid}"))
    };
    match payload {
        ReservationPayload::Request(r) | ReservationPayload::ModificationRequest(r) => {
            format!("party of {} at {}", r.party_size, when(r.time, &r.tzid))
        }
        ReservationPayload::Response(r) | ReservationPayload::ModificationResponse(r) => {
            match (r.time, r.tzid.as_deref()) {
                (Some(t), Some(z)) => format!("{} for {}", r.status, when(t, z)),
                _ => r.status.to_string(),
            }
        }
    }
}

fn print_thread(thread: &ConversationThread) {
    println!("thread {} [{:?}]", thread.root, thread.state());
    for m in &thread.messages {
        println!(
            "  {} {} from {}: {}",
            m.inner.created_at,
            m.kind,
            short(&m.sender),
            describe(&m.payload)
        );
        if let Some(text) = m.payload.message() {
            println!("    {text}");
        }
    }
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("SECRET_KEY=\n");
    content.push_str("RELAYS=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("POW_DIFFICULTY=0\n");
    content.push_str(&format!("POW_MAX_ITERATIONS={DEFAULT_POW_MAX_ITERATIONS}\n"));
    content.push_str("PUBLISH_TIMEOUT_SECS=10\n");
    fs::write(env_path, content)?;
    Ok(())
}

/// Replace or append `KEY=value` in the env file.
fn write_env_var(env_path: &str, key: &str, value: &str) -> Result<()> {
    let content = fs::read_to_string(env_path)?;
    let prefix = format!("{key}=");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with(&prefix) {
            new_content.push_str(&format!("{key}={value}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("{key}={value}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var(key, value);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}
