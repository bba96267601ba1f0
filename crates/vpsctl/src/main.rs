//! vpsctl: operator CLI for the VPS resource gate
//!
//! Each invocation opens the state directory, runs one command and prints
//! the result as JSON on stdout. Logs go to stderr.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vps_config::GateConfig;
use vps_proto::{AccountId, InstanceId, ResourceKind};
use vpsctl::{handle_command, CommandRequest, Host};

#[derive(Parser)]
#[command(name = "vpsctl")]
#[command(about = "Resource ledger and provisioning gate for VPS accounts")]
#[command(version)]
struct Cli {
    /// Path to config file (defaults apply when it does not exist)
    #[arg(short, long, global = true, default_value = "/etc/vps-gate/config.json")]
    config: PathBuf,

    /// Override the state directory from the config file
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample config file
    InitConfig {
        #[arg(short, long, default_value = "/etc/vps-gate/config.json")]
        output: PathBuf,
    },

    /// Account management
    #[command(subcommand)]
    Account(AccountCommands),

    /// List the resource offer catalog
    Offers,

    /// Show an account's resource balance
    Balance { account: AccountId },

    /// Add resources to an account
    Credit {
        account: AccountId,
        /// cpu, ram or storage (alias: disk)
        kind: ResourceKind,
        amount: u32,
    },

    /// Remove resources from an account
    Debit { account: AccountId, kind: ResourceKind, amount: u32 },

    /// Credit an account with an offer from the catalog
    Purchase { account: AccountId, offer: String },

    /// Administrator override of another account's balance
    ///
    /// Without --set the values are added (negative values remove).
    Adjust {
        /// Administrator issuing the change
        admin: AccountId,
        account: AccountId,
        /// Replace the balance instead of shifting it
        #[arg(long)]
        set: bool,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        cpu: i64,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        ram: i64,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        storage: i64,
    },

    /// Monthly price estimate for an allocation
    Quote {
        #[arg(long)]
        cpu: u32,
        #[arg(long)]
        ram: u32,
        #[arg(long)]
        storage: u32,
    },

    /// Create an instance, debiting its allocation from the balance
    Provision {
        account: AccountId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        cpu: u32,
        #[arg(long)]
        ram: u32,
        #[arg(long)]
        storage: u32,
        #[arg(long, default_value = "ubuntu-22.04")]
        os: String,
        #[arg(long, default_value = "us-east-1")]
        datacenter: String,
    },

    /// List an account's instances, newest first
    List { account: AccountId },

    Start { account: AccountId, instance: InstanceId },
    Stop { account: AccountId, instance: InstanceId },
    Restart { account: AccountId, instance: InstanceId },

    /// Delete an instance (resources are not refunded)
    Delete { account: AccountId, instance: InstanceId },

    /// Execute a named command with JSON params
    ///
    /// Examples:
    ///   vpsctl exec account.list
    ///   vpsctl exec ledger.credit --params '{"account":"…","kind":"ram","amount":4}'
    Exec {
        command: String,
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Register an account with a zero balance
    Create {
        display_name: String,
        #[arg(long)]
        auth_ref: String,
        #[arg(long)]
        admin: bool,
    },
    Show { account: AccountId },
    List,
    /// Balance, instance counts and allocated totals
    Summary { account: AccountId },
}

impl Commands {
    fn into_request(self) -> anyhow::Result<CommandRequest> {
        let request = match self {
            Self::InitConfig { .. } => anyhow::bail!("init-config is handled locally"),
            Self::Account(AccountCommands::Create { display_name, auth_ref, admin }) => CommandRequest::new(
                "account.create",
                json!({ "display_name": display_name, "auth_ref": auth_ref, "admin": admin }),
            ),
            Self::Account(AccountCommands::Show { account }) => {
                CommandRequest::new("account.show", json!({ "account": account }))
            }
            Self::Account(AccountCommands::List) => CommandRequest::new("account.list", json!({})),
            Self::Account(AccountCommands::Summary { account }) => {
                CommandRequest::new("account.summary", json!({ "account": account }))
            }
            Self::Offers => CommandRequest::new("offer.list", json!({})),
            Self::Balance { account } => CommandRequest::new("ledger.balance", json!({ "account": account })),
            Self::Credit { account, kind, amount } => CommandRequest::new(
                "ledger.credit",
                json!({ "account": account, "kind": kind, "amount": amount }),
            ),
            Self::Debit { account, kind, amount } => CommandRequest::new(
                "ledger.debit",
                json!({ "account": account, "kind": kind, "amount": amount }),
            ),
            Self::Purchase { account, offer } => {
                CommandRequest::new("ledger.purchase", json!({ "account": account, "offer": offer }))
            }
            Self::Adjust { admin, account, set, cpu, ram, storage } => {
                let mut params = json!({ "admin": admin, "account": account });
                if set {
                    params["mode"] = json!("set");
                    params["balance"] = json!({ "cpu_cores": cpu, "ram_gb": ram, "storage_gb": storage });
                } else {
                    params["mode"] = json!("delta");
                    params["cpu_cores"] = json!(cpu);
                    params["ram_gb"] = json!(ram);
                    params["storage_gb"] = json!(storage);
                }
                CommandRequest::new("ledger.adjust", params)
            }
            Self::Quote { cpu, ram, storage } => CommandRequest::new(
                "instance.quote",
                json!({ "cpu_cores": cpu, "ram_gb": ram, "storage_gb": storage }),
            ),
            Self::Provision { account, name, cpu, ram, storage, os, datacenter } => CommandRequest::new(
                "instance.provision",
                json!({
                    "account": account,
                    "name": name,
                    "cpu_cores": cpu,
                    "ram_gb": ram,
                    "storage_gb": storage,
                    "os": os,
                    "datacenter": datacenter,
                }),
            ),
            Self::List { account } => CommandRequest::new("instance.list", json!({ "account": account })),
            Self::Start { account, instance } => instance_request("instance.start", account, instance),
            Self::Stop { account, instance } => instance_request("instance.stop", account, instance),
            Self::Restart { account, instance } => instance_request("instance.restart", account, instance),
            Self::Delete { account, instance } => instance_request("instance.delete", account, instance),
            Self::Exec { command, params } => {
                let params: Value = serde_json::from_str(&params)
                    .map_err(|e| anyhow::anyhow!("invalid JSON params: {e}"))?;
                CommandRequest::new(command, params)
            }
        };
        Ok(request)
    }
}

fn instance_request(command: &str, account: AccountId, instance: InstanceId) -> CommandRequest {
    CommandRequest::new(command, json!({ "account": account, "instance": instance }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { output } = &cli.command {
        return init_config(output);
    }

    let mut config = load_config(&cli.config)?;
    if let Some(state_path) = cli.state_path {
        config.state_path = state_path;
    }

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let request = cli.command.into_request()?;
    let command = request.command.clone();
    let host = Host::open(config).await?;

    match handle_command(&host, request).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Err(e) => {
            let err = json!({
                "ok": false,
                "error": e.to_string(),
                "kind": e.kind(),
                "command": command,
            });
            println!("{}", serde_json::to_string_pretty(&err)?);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<GateConfig> {
    if path.exists() {
        Ok(GateConfig::load(path)?)
    } else {
        Ok(GateConfig::default())
    }
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    GateConfig::default().save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit state_path and the offer catalog as needed, then run:");
    println!("  vpsctl --config {} account create <name> --auth-ref <ref>", output.display());

    Ok(())
}
