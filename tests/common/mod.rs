//! Shared entities and store doubles for the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eventfold_engine::{
    Effect, Entity, EntityId, EventStream, InMemoryJournal, InMemorySnapshotStore, Journal,
    JournalError, NewEvent, SequenceNumber, SnapshotError, SnapshotRecord, SnapshotStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};

pub fn id(s: &str) -> EntityId {
    EntityId::new(s).expect("valid entity id")
}

// ---------------------------------------------------------------------------
// Bank account
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BankAccount {
    pub balance: u64,
    pub closed: bool,
}

pub enum AccountCommand {
    Deposit(u64),
    Withdraw(u64),
    Close,
    GetBalance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    Deposited { amount: u64 },
    Withdrew { amount: u64 },
    Closed,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum AccountError {
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Account is closed")]
    Closed,
    #[error("Amount must be positive")]
    InvalidAmount,
}

impl Entity for BankAccount {
    const ENTITY_TYPE: &'static str = "account";

    type Command = AccountCommand;
    type Event = AccountEvent;
    type Reply = u64;
    type Error = AccountError;

    fn handle(&self, cmd: AccountCommand) -> Effect<Self> {
        match cmd {
            AccountCommand::GetBalance => Effect::reply(self.balance),
            _ if self.closed => Effect::reject(AccountError::Closed),
            AccountCommand::Deposit(0) | AccountCommand::Withdraw(0) => {
                Effect::reject(AccountError::InvalidAmount)
            }
            AccountCommand::Deposit(amount) => {
                Effect::persist_one(AccountEvent::Deposited { amount }, |s: &Self| s.balance)
            }
            AccountCommand::Withdraw(amount) if amount > self.balance => {
                Effect::reject(AccountError::InsufficientFunds)
            }
            AccountCommand::Withdraw(amount) => {
                Effect::persist_one(AccountEvent::Withdrew { amount }, |s: &Self| s.balance)
            }
            AccountCommand::Close => Effect::persist_one(AccountEvent::Closed, |s: &Self| s.balance),
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
// Shopping cart
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub quantity: u32,
    pub unit_price: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShoppingCart {
    pub items: BTreeMap<String, LineItem>,
    pub checked_out: bool,
}

impl ShoppingCart {
    pub fn total(&self) -> u64 {
        self.items
            .values()
            .map(|item| u64::from(item.quantity) * item.unit_price)
            .sum()
    }
}

pub enum CartCommand {
    AddItem {
        item_id: String,
        quantity: u32,
        unit_price: u64,
    },
    RemoveItem {
        item_id: String,
    },
    Checkout,
    View,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CartEvent {
    ItemAdded {
        item_id: String,
        quantity: u32,
        unit_price: u64,
    },
    ItemRemoved {
        item_id: String,
    },
    CheckedOut,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum CartError {
    #[error("Cart is already checked out")]
    AlreadyCheckedOut,
    #[error("Cart is empty")]
    Empty,
    #[error("Item not in cart")]
    UnknownItem,
}

impl Entity for ShoppingCart {
    const ENTITY_TYPE: &'static str = "cart";

    type Command = CartCommand;
    type Event = CartEvent;
    type Reply = ShoppingCart;
    type Error = CartError;

    fn handle(&self, cmd: CartCommand) -> Effect<Self> {
        match cmd {
            CartCommand::View => Effect::reply(self.clone()),
            _ if self.checked_out => Effect::reject(CartError::AlreadyCheckedOut),
            CartCommand::AddItem {
                item_id,
                quantity,
                unit_price,
            } => Effect::persist_one(
                CartEvent::ItemAdded {
                    item_id,
                    quantity,
                    unit_price,
                },
                |cart: &Self| cart.clone(),
            ),
            CartCommand::RemoveItem { item_id } => {
                if !self.items.contains_key(&item_id) {
                    return Effect::reject(CartError::UnknownItem);
                }
                Effect::persist_one(CartEvent::ItemRemoved { item_id }, |cart: &Self| cart.clone())
            }
            CartCommand::Checkout if self.items.is_empty() => Effect::reject(CartError::Empty),
            CartCommand::Checkout => Effect::persist_one(CartEvent::CheckedOut, |cart: &Self| cart.clone()),
        }
    }

    fn apply(mut self, event: &CartEvent) -> Self {
        match event {
            CartEvent::ItemAdded {
                item_id,
                quantity,
                unit_price,
            } => {
                self.items
                    .entry(item_id.clone())
                    .and_modify(|item| {
                        item.quantity += quantity;
                        item.unit_price = *unit_price;
                    })
                    .or_insert(LineItem {
                        quantity: *quantity,
                        unit_price: *unit_price,
                    });
            }
            CartEvent::ItemRemoved { item_id } => {
                self.items.remove(item_id);
            }
            CartEvent::CheckedOut => self.checked_out = true,
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Store doubles
// ---------------------------------------------------------------------------

/// Journal that fails exactly one append (1-based), otherwise delegates.
#[derive(Clone)]
pub struct FlakyJournal {
    inner: InMemoryJournal,
    fail_on: usize,
    appends: Arc<AtomicUsize>,
}

impl FlakyJournal {
    pub fn failing_on(fail_on: usize) -> Self {
        Self {
            inner: InMemoryJournal::new(),
            fail_on,
            appends: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &InMemoryJournal {
        &self.inner
    }
}

#[async_trait]
impl Journal for FlakyJournal {
    async fn append(
        &self,
        entity_id: &EntityId,
        expected_last_seq: SequenceNumber,
        events: Vec<NewEvent>,
    ) -> Result<SequenceNumber, JournalError> {
        let attempt = self.appends.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_on {
            return Err(JournalError::Unavailable("simulated write timeout".into()));
        }
        self.inner.append(entity_id, expected_last_seq, events).await
    }

    async fn read_from(
        &self,
        entity_id: &EntityId,
        after: SequenceNumber,
    ) -> Result<EventStream, JournalError> {
        self.inner.read_from(entity_id, after).await
    }

    async fn last_sequence(&self, entity_id: &EntityId) -> Result<SequenceNumber, JournalError> {
        self.inner.last_sequence(entity_id).await
    }
}

/// Journal whose appends block until the test releases them.
#[derive(Clone)]
pub struct GatedJournal {
    inner: InMemoryJournal,
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
}

impl GatedJournal {
    pub fn new() -> Self {
        Self {
            inner: InMemoryJournal::new(),
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Wait until an append is blocked on the gate.
    pub async fn wait_for_append(&self) {
        self.entered.notified().await;
    }

    /// Let every pending and future append through.
    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl Journal for GatedJournal {
    async fn append(
        &self,
        entity_id: &EntityId,
        expected_last_seq: SequenceNumber,
        events: Vec<NewEvent>,
    ) -> Result<SequenceNumber, JournalError> {
        self.entered.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| JournalError::Unavailable(e.to_string()))?;
        permit.forget();
        self.inner.append(entity_id, expected_last_seq, events).await
    }

    async fn read_from(
        &self,
        entity_id: &EntityId,
        after: SequenceNumber,
    ) -> Result<EventStream, JournalError> {
        self.inner.read_from(entity_id, after).await
    }

    async fn last_sequence(&self, entity_id: &EntityId) -> Result<SequenceNumber, JournalError> {
        self.inner.last_sequence(entity_id).await
    }
}

/// Snapshot store that records the sequence of every save.
#[derive(Clone, Default)]
pub struct CountingSnapshotStore {
    inner: InMemorySnapshotStore,
    saves: Arc<Mutex<Vec<SequenceNumber>>>,
}

impl CountingSnapshotStore {
    pub fn saved_sequences(&self) -> Vec<SequenceNumber> {
        self.saves.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl SnapshotStore for CountingSnapshotStore {
    async fn save(&self, snapshot: SnapshotRecord) -> Result<(), SnapshotError> {
        self.saves
            .lock()
            .expect("lock poisoned")
            .push(snapshot.sequence);
        self.inner.save(snapshot).await
    }

    async fn load_latest(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<SnapshotRecord>, SnapshotError> {
        self.inner.load_latest(entity_id).await
    }

    async fn list(&self, entity_id: &EntityId) -> Result<Vec<SequenceNumber>, SnapshotError> {
        self.inner.list(entity_id).await
    }

    async fn delete_older_than(
        &self,
        entity_id: &EntityId,
        sequence: SequenceNumber,
    ) -> Result<usize, SnapshotError> {
        self.inner.delete_older_than(entity_id, sequence).await
    }
}

/// Snapshot store whose saves always fail.
#[derive(Clone, Default)]
pub struct BrokenSnapshotStore {
    inner: InMemorySnapshotStore,
}

#[async_trait]
impl SnapshotStore for BrokenSnapshotStore {
    async fn save(&self, _snapshot: SnapshotRecord) -> Result<(), SnapshotError> {
        Err(SnapshotError::Unavailable("disk full".into()))
    }

    async fn load_latest(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<SnapshotRecord>, SnapshotError> {
        self.inner.load_latest(entity_id).await
    }

    async fn list(&self, entity_id: &EntityId) -> Result<Vec<SequenceNumber>, SnapshotError> {
        self.inner.list(entity_id).await
    }

    async fn delete_older_than(
        &self,
        entity_id: &EntityId,
        sequence: SequenceNumber,
    ) -> Result<usize, SnapshotError> {
        self.inner.delete_older_than(entity_id, sequence).await
    }
}
