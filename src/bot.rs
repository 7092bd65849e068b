//! Bot runner: wires accounts, workers and the replication engine together.
//!
//! Handles:
//! - Opening one call gate and one worker per configured account
//! - Reconciling every ledger with its exchange before trading
//! - Replaying journaled signals left over from the previous session
//! - Periodic account status reports
//! - Optional master order and operator command intake from stdin
//! - Graceful shutdown on ctrl-c

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AccountConfig, EngineConfig};
use crate::db::{Database, StateStore};
use crate::exchange::{ApiCredentials, Exchange, HttpExchange, PaperExchange, PaperMarket, PriceFeed};
use crate::models::{AccountId, OrderRequest, PositionState, SizeType, TradeSide};
use crate::shutdown::Shutdown;
use crate::trading::{
    AccountGate, AccountWorker, FollowerHandle, FollowerRegistry, ReplicationEngine, RiskSizer,
    SignalBus, SignalStream, WorkerHandle,
};

/// A master order request read from stdin, one JSON object per line.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderLine {
    pub symbol: String,
    pub side: TradeSide,
    pub size: Decimal,

    #[serde(default = "default_size_type")]
    pub size_type: SizeType,

    /// Moves the simulated market before the order in dry-run mode
    #[serde(default)]
    pub price: Option<Decimal>,
}

fn default_size_type() -> SizeType {
    SizeType::Base
}

impl OrderLine {
    pub fn parse(line: &str) -> Result<Self> {
        let order: Self = serde_json::from_str(line).context("Invalid order line")?;
        if order.size <= Decimal::ZERO {
            bail!("order size must be positive");
        }
        Ok(order)
    }

    pub fn request(&self) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            side: self.side,
            size: self.size,
            size_type: self.size_type,
        }
    }
}

/// An operator action read from stdin, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Clear an unavailable account after its credentials were fixed
    ResetHealth { account: String },

    /// Close a position now, through the exit rules
    EmergencyClose { account: String, symbol: String },
}

/// One line of stdin input.
#[derive(Debug, Clone)]
pub enum Intake {
    Order(OrderLine),
    Operator(OperatorCommand),
}

impl Intake {
    pub fn parse(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line).context("Invalid input line")?;
        if value.get("action").is_some() {
            let command = serde_json::from_value(value).context("Invalid operator command")?;
            return Ok(Intake::Operator(command));
        }
        OrderLine::parse(line).map(Intake::Order)
    }
}

#[derive(Clone)]
struct Account {
    gate: Arc<AccountGate>,
    handle: WorkerHandle,
}

fn find_account<'a>(accounts: &'a [Account], id: &str) -> Result<&'a Account> {
    accounts
        .iter()
        .find(|a| a.gate.id().as_str() == id)
        .with_context(|| format!("Unknown account {}", id))
}

/// Carry out one operator command against the running accounts.
async fn operate(command: OperatorCommand, accounts: &[Account]) -> Result<()> {
    match command {
        OperatorCommand::ResetHealth { account } => {
            warn!(account = %account, "Operator health reset");
            find_account(accounts, &account)?.gate.reset_health().await;
        }
        OperatorCommand::EmergencyClose { account, symbol } => {
            let decision = find_account(accounts, &account)?
                .handle
                .emergency_close(&symbol)
                .await?;
            info!(account = %account, symbol = %symbol, decision = ?decision, "Emergency close handled");
        }
    }
    Ok(())
}

/// Main bot runner.
pub struct Bot {
    config: EngineConfig,
    db: Arc<Database>,
    shutdown: Shutdown,

    /// Shared price book in dry-run mode
    market: Option<Arc<PaperMarket>>,

    master: WorkerHandle,
    accounts: Vec<Account>,
    workers: Vec<AccountWorker>,
    engine: Arc<ReplicationEngine>,
    signals: SignalStream,
}

impl Bot {
    /// Open the database and build every account, without touching the exchanges yet.
    pub async fn new(config: EngineConfig, dry_run: bool) -> Result<Self> {
        let db = Arc::new(
            Database::new(&config.database_url)
                .await
                .with_context(|| format!("Failed to open database {}", config.database_url))?,
        );
        let store: Arc<dyn StateStore> = db.clone();
        let shutdown = Shutdown::new();

        let bus = SignalBus::new(config.replication.bus_capacity);
        // Subscribe before any worker can publish.
        let signals = bus.subscribe();

        let market = dry_run.then(PaperMarket::new);
        let registry = Arc::new(FollowerRegistry::new());

        let mut master = None;
        let mut accounts = Vec::with_capacity(config.accounts.len());
        let mut workers = Vec::with_capacity(config.accounts.len());

        for account in &config.accounts {
            let (exchange, prices) = connect(account, &config, market.as_ref())?;

            let gate = Arc::new(
                AccountGate::open(
                    AccountId::new(account.id.clone()),
                    account.role,
                    exchange,
                    store.clone(),
                    config.gate.clone(),
                    account.min_spacing(&config.gate),
                    shutdown.clone(),
                )
                .await
                .with_context(|| format!("Failed to open call gate for {}", account.id))?,
            );

            let (worker, handle) = AccountWorker::new(
                gate.clone(),
                store.clone(),
                prices,
                config.exit.clone(),
                config.trading.volatility_window,
                config.engine.intervals(),
                shutdown.clone(),
            )
            .await
            .with_context(|| format!("Failed to load positions for {}", account.id))?;

            if account.is_master() {
                workers.push(
                    worker
                        .with_bus(bus.clone())
                        .with_sizer(RiskSizer::new(config.trading.clone()), account.tier),
                );
                master = Some(handle.clone());
            } else {
                workers.push(worker);
                registry
                    .register(FollowerHandle {
                        gate: gate.clone(),
                        worker: handle.clone(),
                        tier_override: account.tier,
                        limits: config.limits_for(&account.exchange),
                    })
                    .await;
            }

            info!(
                account = %account.id,
                role = account.role.as_str(),
                exchange = %account.exchange,
                dry_run,
                "Account configured"
            );
            accounts.push(Account { gate, handle });
        }

        let master = master.context("No master account configured")?;

        let engine = Arc::new(ReplicationEngine::new(
            registry,
            store,
            RiskSizer::new(config.trading.clone()),
            config.replication.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            db,
            shutdown,
            market,
            master,
            accounts,
            workers,
            engine,
            signals,
        })
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn master(&self) -> &WorkerHandle {
        &self.master
    }

    pub fn market(&self) -> Option<&Arc<PaperMarket>> {
        self.market.as_ref()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run until ctrl-c (or another shutdown trigger), then wait for every task.
    pub async fn run(self, stdin_orders: bool) -> Result<()> {
        let Bot {
            config,
            db: _,
            shutdown,
            market,
            master,
            accounts,
            workers,
            engine,
            signals,
        } = self;

        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            ctrl_c.trigger();
        });

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for mut worker in workers {
            if let Err(e) = worker.prepare().await {
                // The worker keeps retrying on its cycle and refuses orders until then.
                warn!(error = %e, "Startup reconciliation failed");
            }
            tasks.push(tokio::spawn(worker.run()));
        }

        match engine.replay_pending().await {
            Ok(0) => debug!("No journaled signals to replay"),
            Ok(count) => info!(count, "Journaled signals replayed"),
            Err(e) => error!(error = %e, "Failed to read signal journal"),
        }

        let replication = engine.clone();
        tasks.push(tokio::spawn(async move { replication.run(signals).await }));

        tasks.push(tokio::spawn(report_status(
            accounts.clone(),
            config.engine.status_interval(),
            shutdown.clone(),
        )));

        info!(dry_run = market.is_some(), accounts = config.accounts.len(), "Bot running");
        if stdin_orders {
            tokio::spawn(read_input(master, accounts, market, shutdown.clone()));
        }

        shutdown.wait().await;

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Task ended abnormally");
            }
        }

        info!("Bot stopped");
        Ok(())
    }
}

/// Build the exchange adapter and price feed for one account.
fn connect(
    account: &AccountConfig,
    config: &EngineConfig,
    market: Option<&Arc<PaperMarket>>,
) -> Result<(Arc<dyn Exchange>, Arc<dyn PriceFeed>)> {
    if let Some(market) = market {
        let balance = account.paper_balance.unwrap_or(config.engine.paper_balance);
        let exchange: Arc<dyn Exchange> = Arc::new(PaperExchange::new(
            account.exchange.clone(),
            balance,
            market.clone(),
        ));
        let prices: Arc<dyn PriceFeed> = market.clone();
        return Ok((exchange, prices));
    }

    let base_url = config
        .exchanges
        .get(&account.exchange)
        .and_then(|e| e.base_url.clone())
        .with_context(|| format!("Exchange {} has no base_url configured", account.exchange))?;

    let key_var = account
        .api_key_env
        .clone()
        .unwrap_or_else(|| env_name(&account.id, "API_KEY"));
    let secret_var = account
        .api_secret_env
        .clone()
        .unwrap_or_else(|| env_name(&account.id, "API_SECRET"));
    let credentials = ApiCredentials::from_env(&key_var, &secret_var)
        .with_context(|| format!("Missing credentials for {}", account.id))?;

    let http = Arc::new(HttpExchange::new(
        account.exchange.clone(),
        base_url,
        credentials,
    )?);
    let exchange: Arc<dyn Exchange> = http.clone();
    let prices: Arc<dyn PriceFeed> = http;
    Ok((exchange, prices))
}

/// `copy-1` + `API_KEY` -> `COPY_1_API_KEY`
fn env_name(account: &str, suffix: &str) -> String {
    let prefix: String = account
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_{}", prefix, suffix)
}

async fn report_status(accounts: Vec<Account>, period: std::time::Duration, shutdown: Shutdown) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        for account in &accounts {
            let status = account.gate.status().await;
            let snapshot = account.handle.snapshot();
            let exit_failed = snapshot
                .positions
                .iter()
                .filter(|p| p.state == PositionState::ExitFailed)
                .count();

            info!(
                account = %status.id,
                role = status.role.as_str(),
                health = %status.health,
                errors = status.consecutive_errors,
                balance = ?status.last_good_balance,
                positions = snapshot.open_position_count(),
                exit_failed,
                streak = ?snapshot.streak,
                "Account status"
            );
            if exit_failed > 0 {
                error!(account = %status.id, exit_failed, "Positions need operator attention");
            }
        }
    }
}

/// Forward JSON lines from stdin until EOF or shutdown: orders go to the
/// master worker, operator commands to the account they name.
async fn read_input(
    master: WorkerHandle,
    accounts: Vec<Account>,
    market: Option<Arc<PaperMarket>>,
    shutdown: Shutdown,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Reading master orders and operator commands from stdin");

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Order input closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read order input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let order = match Intake::parse(&line) {
            Ok(Intake::Order(order)) => order,
            Ok(Intake::Operator(command)) => {
                if let Err(e) = operate(command, &accounts).await {
                    warn!(error = %e, "Operator command failed");
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Ignoring input line");
                continue;
            }
        };

        if let (Some(market), Some(price)) = (&market, order.price) {
            market.set_price(&order.symbol, price);
        }

        match master.place_order(order.request()).await {
            Ok(fill) => info!(
                order_id = %fill.order_id,
                status = fill.status.as_str(),
                quantity = %fill.filled_quantity,
                price = %fill.fill_price,
                "Master order placed"
            ),
            Err(e) => warn!(symbol = %order.symbol, error = %e, "Master order failed"),
        }
    }
}
