//! Command dispatch
//!
//! Every operation is addressed by a dotted name and takes its arguments as a
//! JSON object, so the CLI subcommands and `vpsctl exec` share one path.

use crate::error::{CliError, CliResult};
use crate::Host;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};
use vps_ledger::BalanceAdjustment;
use vps_lifecycle::LifecycleAction;
use vps_proto::{Account, AccountId, InstanceId, InstanceSpec, ResourceBalance, ResourceKind};
use vps_provision::MonthlyEstimate;
use vps_store::AccountStore;

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub params: Value,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        Self { command: command.into(), params }
    }
}

pub const COMMANDS: &[&str] = &[
    "account.create",
    "account.show",
    "account.list",
    "account.summary",
    "offer.list",
    "ledger.balance",
    "ledger.credit",
    "ledger.debit",
    "ledger.purchase",
    "ledger.adjust",
    "instance.quote",
    "instance.provision",
    "instance.list",
    "instance.start",
    "instance.stop",
    "instance.restart",
    "instance.delete",
];

// ─── Params ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateAccountParams {
    display_name: String,
    auth_ref: String,
    #[serde(default)]
    admin: bool,
}

#[derive(Deserialize)]
struct AccountParams {
    account: AccountId,
}

#[derive(Deserialize)]
struct AmountParams {
    account: AccountId,
    kind: ResourceKind,
    amount: u32,
}

#[derive(Deserialize)]
struct PurchaseParams {
    account: AccountId,
    offer: String,
}

#[derive(Deserialize)]
struct AdjustParams {
    admin: AccountId,
    account: AccountId,
    #[serde(flatten)]
    adjustment: BalanceAdjustment,
}

#[derive(Deserialize)]
struct QuoteParams {
    cpu_cores: u32,
    ram_gb: u32,
    storage_gb: u32,
}

#[derive(Deserialize)]
struct ProvisionParams {
    account: AccountId,
    #[serde(flatten)]
    spec: InstanceSpec,
}

#[derive(Deserialize)]
struct InstanceParams {
    account: AccountId,
    instance: InstanceId,
}

fn parse<T: DeserializeOwned>(command: &str, params: Value) -> CliResult<T> {
    serde_json::from_value(params).map_err(|e| CliError::InvalidParams {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

// ─── Dispatch ─────────────────────────────────────────────────────────────────

pub async fn handle_command(host: &Host, request: CommandRequest) -> CliResult<Value> {
    debug!(command = %request.command, "handling command");
    let CommandRequest { command, params } = request;
    let name = command.as_str();

    match name {
        // ── Accounts ──────────────────────────────────────────────────────
        "account.create" => {
            let p: CreateAccountParams = parse(name, params)?;
            let account = Account::new(p.display_name, p.auth_ref, p.admin);
            host.store.create_account(account.clone()).await?;
            info!(account_id = %account.id, admin = account.is_admin, "account created");
            Ok(json!({ "ok": true, "account": account }))
        }
        "account.show" => {
            let p: AccountParams = parse(name, params)?;
            let account = host
                .store
                .account(p.account)
                .await?
                .ok_or(vps_ledger::LedgerError::AccountNotFound(p.account))?;
            Ok(json!({ "ok": true, "account": account }))
        }
        "account.list" => {
            let accounts = host.store.list_accounts().await?;
            Ok(json!({ "ok": true, "count": accounts.len(), "accounts": accounts }))
        }
        "account.summary" => {
            let p: AccountParams = parse(name, params)?;
            let summary = host.lifecycle.summary(p.account).await?;
            Ok(json!({ "ok": true, "summary": summary }))
        }

        // ── Ledger ────────────────────────────────────────────────────────
        "offer.list" => {
            let offers: Vec<Value> = host
                .ledger
                .offers()
                .iter()
                .map(|o| json!({ "offer": o, "price": o.price_display() }))
                .collect();
            Ok(json!({ "ok": true, "offers": offers }))
        }
        "ledger.balance" => {
            let p: AccountParams = parse(name, params)?;
            let balance = host.ledger.balance(p.account).await?;
            Ok(json!({ "ok": true, "account": p.account, "balance": balance }))
        }
        "ledger.credit" => {
            let p: AmountParams = parse(name, params)?;
            let balance = host.ledger.credit(p.account, p.kind, p.amount).await?;
            Ok(json!({ "ok": true, "account": p.account, "balance": balance }))
        }
        "ledger.debit" => {
            let p: AmountParams = parse(name, params)?;
            let balance = host.ledger.debit(p.account, p.kind, p.amount).await?;
            Ok(json!({ "ok": true, "account": p.account, "balance": balance }))
        }
        "ledger.purchase" => {
            let p: PurchaseParams = parse(name, params)?;
            let receipt = host.ledger.purchase(p.account, &p.offer).await?;
            Ok(json!({ "ok": true, "receipt": receipt }))
        }
        "ledger.adjust" => {
            let p: AdjustParams = parse(name, params)?;
            let balance = host.ledger.adjust(p.admin, p.account, &p.adjustment).await?;
            Ok(json!({ "ok": true, "account": p.account, "balance": balance }))
        }

        // ── Instances ─────────────────────────────────────────────────────
        "instance.quote" => {
            let p: QuoteParams = parse(name, params)?;
            let allocation = ResourceBalance::new(p.cpu_cores, p.ram_gb, p.storage_gb);
            let estimate = MonthlyEstimate::for_allocation(&allocation);
            Ok(json!({
                "ok": true,
                "allocation": allocation,
                "estimate": estimate,
                "total_cents": estimate.total_cents(),
            }))
        }
        "instance.provision" => {
            let p: ProvisionParams = parse(name, params)?;
            let instance = host.gate.provision(p.account, &p.spec).await?;
            Ok(json!({ "ok": true, "instance": instance }))
        }
        "instance.list" => {
            let p: AccountParams = parse(name, params)?;
            let instances = host.lifecycle.list(p.account).await?;
            Ok(json!({ "ok": true, "count": instances.len(), "instances": instances }))
        }
        "instance.start" | "instance.stop" | "instance.restart" => {
            let p: InstanceParams = parse(name, params)?;
            let action = match name {
                "instance.start" => LifecycleAction::Start,
                "instance.stop" => LifecycleAction::Stop,
                _ => LifecycleAction::Restart,
            };
            let instance = host.lifecycle.apply(p.account, p.instance, action).await?;
            Ok(json!({ "ok": true, "instance": instance }))
        }
        "instance.delete" => {
            let p: InstanceParams = parse(name, params)?;
            let removed = host.lifecycle.delete(p.account, p.instance).await?;
            Ok(json!({ "ok": true, "deleted": removed.id }))
        }

        unknown => Err(CliError::UnknownCommand(unknown.to_string())),
    }
}
