use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use token_ledger::{
    auth::{
        account_for_key, generate_signing_key, parse_signing_key, parse_verifying_key,
        SignedRequest,
    },
    config::GenesisConfig,
    store::LedgerStore,
    types::{parse_amount, Account, Amount, ParseError},
    LedgerCommand, TracingSink,
};

#[derive(Parser)]
#[command(name = "token-ledger", version, about = "Fixed-supply token ledger")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an ed25519 keypair (sk.hex / pk.hex).
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Print the account bound to a key.
    Address {
        #[arg(long, conflicts_with = "pk_hex", required_unless_present = "pk_hex")]
        sk_hex: Option<String>,
        #[arg(long)]
        pk_hex: Option<String>,
    },
    /// Create a ledger, crediting the whole supply to the key's account.
    Init {
        dir: PathBuf,
        #[arg(long)]
        sk_hex: String,
        /// Genesis TOML; flags below override its values.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        decimals: Option<u8>,
        /// Initial supply in base units.
        #[arg(long, value_parser = parse_amount)]
        supply: Option<Amount>,
    },
    /// Token metadata, supply and store height.
    Info { dir: PathBuf },
    TotalSupply { dir: PathBuf },
    Balance {
        dir: PathBuf,
        #[arg(value_parser = parse_account)]
        account: Account,
    },
    Allowance {
        dir: PathBuf,
        #[arg(value_parser = parse_account)]
        owner: Account,
        #[arg(value_parser = parse_account)]
        spender: Account,
    },
    /// Sign with the next nonce and apply in one step.
    Exec {
        dir: PathBuf,
        #[arg(long)]
        sk_hex: String,
        #[command(subcommand)]
        action: Action,
    },
    /// Produce a signed request without touching any store.
    ///
    /// A request that is rejected on submit does not consume its nonce: the
    /// signed file stays valid until some request with that nonce commits.
    /// Discard a rejected request by committing a newer one with the same nonce.
    Sign {
        #[arg(long)]
        sk_hex: String,
        #[arg(long)]
        nonce: u64,
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(subcommand)]
        action: Action,
    },
    /// Apply a signed request file.
    Submit { dir: PathBuf, request: PathBuf },
    /// Print the event journal, one JSON object per line.
    Events { dir: PathBuf },
}

#[derive(Subcommand, Clone)]
enum Action {
    Transfer {
        #[arg(long, value_parser = parse_account)]
        to: Account,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
    },
    Approve {
        #[arg(long, value_parser = parse_account)]
        spender: Account,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
    },
    TransferFrom {
        #[arg(long, value_parser = parse_account)]
        owner: Account,
        #[arg(long, value_parser = parse_account)]
        to: Account,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
    },
}

impl From<Action> for LedgerCommand {
    fn from(action: Action) -> Self {
        match action {
            Action::Transfer { to, amount } => LedgerCommand::Transfer { to, amount },
            Action::Approve { spender, amount } => LedgerCommand::Approve { spender, amount },
            Action::TransferFrom { owner, to, amount } => {
                LedgerCommand::TransferFrom { owner, to, amount }
            }
        }
    }
}

fn parse_account(value: &str) -> Result<Account, ParseError> {
    value.parse()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn open_store(dir: &Path) -> Result<LedgerStore> {
    let store = LedgerStore::new(dir);
    if !store.is_initialized() {
        bail!("no ledger at {} (run `init` first)", dir.display());
    }
    Ok(store)
}

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    let sk = generate_signing_key();
    let pk = sk.verifying_key();
    write_file(&out_dir.join("sk.hex"), hex::encode(sk.to_bytes()).as_bytes())?;
    write_file(&out_dir.join("pk.hex"), hex::encode(pk.as_bytes()).as_bytes())?;
    println!("{}", account_for_key(&pk));
    tracing::info!(dir = %out_dir.display(), "keypair written");
    Ok(())
}

fn address_cmd(sk_hex: Option<String>, pk_hex: Option<String>) -> Result<()> {
    let key = match (sk_hex, pk_hex) {
        (Some(sk), _) => parse_signing_key(&sk)?.verifying_key(),
        (None, Some(pk)) => parse_verifying_key(&pk)?,
        (None, None) => bail!("one of --sk-hex or --pk-hex is required"),
    };
    println!("{}", account_for_key(&key));
    Ok(())
}

struct GenesisOverrides {
    name: Option<String>,
    symbol: Option<String>,
    decimals: Option<u8>,
    supply: Option<Amount>,
}

fn init_cmd(
    dir: &Path,
    sk_hex: &str,
    config: Option<&Path>,
    overrides: GenesisOverrides,
) -> Result<()> {
    let creator = account_for_key(&parse_signing_key(sk_hex)?.verifying_key());
    let mut genesis = match config {
        Some(path) => GenesisConfig::from_file(path)?,
        None => GenesisConfig::default(),
    };
    if let Some(name) = overrides.name {
        genesis.name = name;
    }
    if let Some(symbol) = overrides.symbol {
        genesis.symbol = symbol;
    }
    if let Some(decimals) = overrides.decimals {
        genesis.decimals = decimals;
    }
    if let Some(supply) = overrides.supply {
        genesis.initial_supply = supply;
    }

    let ledger = genesis.build(creator);
    LedgerStore::new(dir).init(&ledger, now_ms())?;
    println!(
        "{} ({}) supply {} → {}",
        genesis.name, genesis.symbol, genesis.initial_supply, creator
    );
    Ok(())
}

fn info_cmd(dir: &Path) -> Result<()> {
    let store = open_store(dir)?;
    let ledger = store.load()?;
    let meta = store.meta()?;
    let metadata = ledger.metadata();
    println!("name:         {}", metadata.name);
    println!("symbol:       {}", metadata.symbol);
    println!("decimals:     {}", metadata.decimals);
    println!("total supply: {}", ledger.total_supply());
    println!("holders:      {}", ledger.holders());
    println!("height:       {}", meta.height);
    println!("state root:   {}", hex::encode(ledger.state_root()));
    Ok(())
}

fn submit_and_print(store: &LedgerStore, request: &SignedRequest) -> Result<()> {
    let event = store.submit(request, now_ms(), &mut TracingSink)?;
    println!("{}", serde_json::to_string(&event)?);
    Ok(())
}

fn exec_cmd(dir: &Path, sk_hex: &str, action: Action) -> Result<()> {
    let store = open_store(dir)?;
    let sk = parse_signing_key(sk_hex)?;
    let nonce = store.next_nonce(&account_for_key(&sk.verifying_key()))?;
    let request = SignedRequest::sign(&sk, nonce, action.into());
    submit_and_print(&store, &request)
}

fn sign_cmd(sk_hex: &str, nonce: u64, out: Option<&Path>, action: Action) -> Result<()> {
    let sk = parse_signing_key(sk_hex)?;
    let request = SignedRequest::sign(&sk, nonce, action.into());
    let json = serde_json::to_vec_pretty(&request)?;
    match out {
        Some(path) => {
            write_file(path, &json)?;
            tracing::info!(path = %path.display(), nonce, "request signed");
        }
        None => println!("{}", String::from_utf8_lossy(&json)),
    }
    Ok(())
}

fn submit_cmd(dir: &Path, request_path: &Path) -> Result<()> {
    let store = open_store(dir)?;
    let bytes =
        fs::read(request_path).with_context(|| format!("reading {}", request_path.display()))?;
    let request: SignedRequest = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", request_path.display()))?;
    submit_and_print(&store, &request)
}

fn events_cmd(dir: &Path) -> Result<()> {
    let store = open_store(dir)?;
    for event in store.events()? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::Address { sk_hex, pk_hex } => address_cmd(sk_hex, pk_hex),
        Command::Init {
            dir,
            sk_hex,
            config,
            name,
            symbol,
            decimals,
            supply,
        } => init_cmd(
            &dir,
            &sk_hex,
            config.as_deref(),
            GenesisOverrides {
                name,
                symbol,
                decimals,
                supply,
            },
        ),
        Command::Info { dir } => info_cmd(&dir),
        Command::TotalSupply { dir } => {
            println!("{}", open_store(&dir)?.load()?.total_supply());
            Ok(())
        }
        Command::Balance { dir, account } => {
            println!("{}", open_store(&dir)?.load()?.balance_of(&account));
            Ok(())
        }
        Command::Allowance {
            dir,
            owner,
            spender,
        } => {
            println!("{}", open_store(&dir)?.load()?.allowance(&owner, &spender));
            Ok(())
        }
        Command::Exec {
            dir,
            sk_hex,
            action,
        } => exec_cmd(&dir, &sk_hex, action),
        Command::Sign {
            sk_hex,
            nonce,
            out,
            action,
        } => sign_cmd(&sk_hex, nonce, out.as_deref(), action),
        Command::Submit { dir, request } => submit_cmd(&dir, &request),
        Command::Events { dir } => events_cmd(&dir),
    }
}
