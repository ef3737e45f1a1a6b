use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use ethers::providers::Middleware;
use ethers::types::Address;
use eyre::{eyre, Result};
use log::info;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use dex_sync::configure::{self, AppConfig, SyncConfig};
use dex_sync::ledger::{EthersLedgerClient, EthersLedgerWriter, LedgerClient, LedgerWriter, OrderIntent};
use dex_sync::logger::setup_logger;
use dex_sync::models::Side;
use dex_sync::simple_kv_storage::SledDb;
use dex_sync::sync::{Action, CacheState, Reconciler, StateStore};

const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "dex-sync")]
#[command(about = "Live order book and trade history of an on-chain exchange")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the selected market and log every change
    Watch {
        /// Overrides the persisted ticker
        #[arg(long)]
        ticker: Option<String>,
        /// Account whose balances and transfers to follow
        #[arg(long)]
        account: Option<String>,
    },
    /// Persist the selected ticker
    Select { ticker: String },
    /// Submit an order or transfer, signed with DEX_PRIVATE_KEY
    Submit {
        #[command(subcommand)]
        intent: IntentArgs,
    },
}

#[derive(Subcommand)]
enum IntentArgs {
    Limit {
        ticker: String,
        amount: Decimal,
        price: u64,
        #[arg(value_enum)]
        side: SideArg,
    },
    Market {
        ticker: String,
        amount: Decimal,
        #[arg(value_enum)]
        side: SideArg,
    },
    Deposit { token: String, amount: Decimal },
    Withdraw { token: String, amount: Decimal },
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => Side::Buy,
            SideArg::Sell => Side::Sell,
        }
    }
}

impl From<IntentArgs> for OrderIntent {
    fn from(args: IntentArgs) -> Self {
        match args {
            IntentArgs::Limit { ticker, amount, price, side } => OrderIntent::Limit {
                ticker: ticker.to_uppercase(),
                amount,
                price,
                side: side.into(),
            },
            IntentArgs::Market { ticker, amount, side } => {
                OrderIntent::Market { ticker: ticker.to_uppercase(), amount, side: side.into() }
            }
            IntentArgs::Deposit { token, amount } => OrderIntent::Deposit { token: token.to_uppercase(), amount },
            IntentArgs::Withdraw { token, amount } => OrderIntent::Withdraw { token: token.to_uppercase(), amount },
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let app = configure::load_config()?;
    setup_logger(&app).map_err(|e| eyre!("failed to set up logger: {e}"))?;
    let config = SyncConfig::from_app(&app)?;

    match cli.command.unwrap_or(Commands::Watch { ticker: None, account: None }) {
        Commands::Watch { ticker, account } => watch(&app, config, ticker, account).await,
        Commands::Select { ticker } => {
            let ticker = ticker.to_uppercase();
            if config.token_address(&ticker).is_none() {
                return Err(eyre!("unknown ticker {ticker}"));
            }
            SledDb::new(&app.prefs_path)?.save_selected_ticker(&ticker)?;
            info!("selected ticker set to {ticker}");
            Ok(())
        }
        Commands::Submit { intent } => submit(&app, config, intent.into()).await,
    }
}

async fn watch(app: &AppConfig, config: SyncConfig, ticker: Option<String>, account: Option<String>) -> Result<()> {
    let client = EthersLedgerClient::new(&app.rpc_url, POLL_INTERVAL, config.dex_address, config.tokens.clone())?;
    let network_chain_id = client.provider().get_chainid().await?.as_u64();
    let ledger: Arc<dyn LedgerClient> = Arc::new(client);

    let store = Arc::new(StateStore::restore(SledDb::new(&app.prefs_path)?, &config.quote_symbol));
    let recent_limit = config.recent_trades_limit;
    let reconciler = Reconciler::new(config, ledger, None, store.clone());

    let (tx, mut rx) = mpsc::unbounded_channel::<CacheState>();
    let _listener = store.subscribe(move |state| {
        let _ = tx.send(state.clone());
    });

    reconciler.start().await;
    if let Some(ticker) = ticker {
        reconciler.select_ticker(&ticker).await?;
    }
    if let Some(account) = account {
        let account = Address::from_str(&account).map_err(|e| eyre!("bad account {account}: {e}"))?;
        reconciler.connect(account, network_chain_id).await;
    }

    let mut last_shown = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(state) = rx.recv() => {
                if let Some(notice) = &state.transfer_notice {
                    info!("{} of {} confirmed", notice.direction, notice.token);
                    store.dispatch(Action::ConsumeTransferNotice);
                }
                if let Some(status) = &state.status {
                    info!("[{:?}] {}", status.level, status.text);
                    store.dispatch(Action::ConsumeStatus);
                }
                let shown = (state.selected_ticker.clone(), state.trades.len(), state.orders.len(), state.history.clone());
                if last_shown.as_ref() != Some(&shown) {
                    log_market(&state, recent_limit);
                    last_shown = Some(shown);
                }
            }
        }
    }

    reconciler.shutdown().await;
    Ok(())
}

fn log_market(state: &CacheState, recent_limit: usize) {
    let book = state.order_book();
    info!(
        "{}/{} ({:?}): {} bids, {} asks, last price {:?}",
        state.selected_ticker,
        state.quote_symbol,
        state.history,
        book.buy_orders.len(),
        book.sell_orders.len(),
        state.last_price()
    );
    match serde_json::to_string(&book) {
        Ok(json) => log::debug!("order book {json}"),
        Err(e) => log::warn!("order book not serializable: {e}"),
    }
    for order in book.buy_orders.iter().take(recent_limit) {
        info!("  bid {} @ {} (id {})", order.remaining(), order.price, order.id);
    }
    for order in book.sell_orders.iter().take(recent_limit) {
        info!("  ask {} @ {} (id {})", order.remaining(), order.price, order.id);
    }
    for trade in state.recent_trades(recent_limit) {
        info!("  trade #{} {} @ {} at {}", trade.trade_id, trade.amount, trade.price, trade.timestamp);
    }
    if let Some(account) = state.account {
        for token in [&state.selected_ticker, &state.quote_symbol] {
            let balance = state.balance(account, token);
            info!("  {token}: wallet {} / exchange {}", balance.wallet_balance, balance.exchange_balance);
        }
    }
}

async fn submit(app: &AppConfig, config: SyncConfig, intent: OrderIntent) -> Result<()> {
    let private_key = env::var("DEX_PRIVATE_KEY").map_err(|_| eyre!("DEX_PRIVATE_KEY must be set"))?;
    let client = EthersLedgerClient::new(&app.rpc_url, POLL_INTERVAL, config.dex_address, config.tokens.clone())?;
    let writer = EthersLedgerWriter::new(
        (*client.provider()).clone(),
        &private_key,
        config.chain_id,
        config.dex_address,
        config.tokens.clone(),
    )?;
    info!("submitting {intent} from {:?}", writer.address());

    let writer: Arc<dyn LedgerWriter> = Arc::new(writer);
    let store = Arc::new(StateStore::new(CacheState::new(&config.quote_symbol, &config.quote_symbol)));
    let reconciler = Reconciler::new(config, Arc::new(client), Some(writer), store.clone());

    let hash = reconciler.submit(&intent).await?;
    if let Some(status) = store.read(|s| s.status.clone()) {
        info!("{}", status.text);
    }
    info!("transaction {hash:?}");
    Ok(())
}
