//! Self-contained example: a bank account entity backed by file storage,
//! stopped and recovered to show that state survives a restart.
//!
//! Run with: `cargo run --example bank_account`
//!
//! Set `RUST_LOG=eventfold_engine=debug` to watch snapshots and recovery.

use eventfold_engine::{
    CommandContext, Effect, EngineError, Entity, EntityId, EntityRegistry, SnapshotPolicy,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Account entity
// ---------------------------------------------------------------------------

/// A bank account that can receive deposits, pay withdrawals, and be closed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    balance: u64,
    closed: bool,
}

/// Commands accepted by the [`Account`] entity.
enum AccountCommand {
    Deposit(u64),
    Withdraw(u64),
    Close,
    Balance,
}

/// Domain events produced by the [`Account`] entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountEvent {
    Deposited { amount: u64 },
    Withdrew { amount: u64 },
    Closed,
}

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Account is closed")]
    Closed,
}

impl Entity for Account {
    const ENTITY_TYPE: &'static str = "account";
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Reply = u64;
    type Error = AccountError;

    fn handle(&self, cmd: AccountCommand) -> Effect<Self> {
        match cmd {
            AccountCommand::Balance => Effect::reply(self.balance),
            _ if self.closed => Effect::reject(AccountError::Closed),
            AccountCommand::Deposit(amount) => {
                Effect::persist_one(AccountEvent::Deposited { amount }, |a: &Self| a.balance)
            }
            AccountCommand::Withdraw(amount) if amount > self.balance => {
                Effect::reject(AccountError::InsufficientFunds)
            }
            AccountCommand::Withdraw(amount) => {
                Effect::persist_one(AccountEvent::Withdrew { amount }, |a: &Self| a.balance)
            }
            AccountCommand::Close => Effect::persist_one(AccountEvent::Closed, |a: &Self| a.balance),
        }
    }

    fn apply(mut self, event: &AccountEvent) -> Self {
        match event {
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrew { amount } => self.balance -= amount,
            AccountEvent::Closed => self.closed = true,
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let base_dir =
        std::env::temp_dir().join(format!("eventfold-engine-demo-{}", std::process::id()));
    let account_id: EntityId = "acct-42".parse()?;
    let policy = SnapshotPolicy::every(3).keep(2);

    {
        let registry = EntityRegistry::builder().base_dir(&base_dir).build();
        let account = registry
            .spawn_or_recover(account_id.clone(), Account::default(), policy)
            .await?;

        let ctx = CommandContext::default().with_actor("teller-7");
        account
            .submit_with(AccountCommand::Deposit(100), ctx.clone())
            .await?;
        account
            .submit_with(AccountCommand::Deposit(50), ctx.clone())
            .await?;
        let balance = account
            .submit_with(AccountCommand::Withdraw(30), ctx)
            .await?;
        println!("balance after three commands: {balance}");

        match account.submit(AccountCommand::Withdraw(200)).await {
            Err(EngineError::ValidationRejected(e)) => println!("withdraw 200 rejected: {e}"),
            other => println!("unexpected outcome: {other:?}"),
        }

        registry.stop_all().await;
    }

    // A fresh registry recovers from the snapshot at 3 plus the journal.
    let registry = EntityRegistry::builder().base_dir(&base_dir).build();
    let account = registry
        .spawn_or_recover(account_id, Account::default(), policy)
        .await?;
    println!(
        "recovered balance {} at sequence {}",
        account.submit(AccountCommand::Balance).await?,
        account.last_sequence().await?
    );

    account.submit(AccountCommand::Close).await?;
    if let Err(e) = account.submit(AccountCommand::Deposit(1)).await {
        println!("deposit after close: {e}");
    }

    registry.stop_all().await;
    tokio::fs::remove_dir_all(&base_dir).await?;
    Ok(())
}
