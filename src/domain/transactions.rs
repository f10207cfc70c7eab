use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// A charging session as the gateway sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub transaction_id: String,
    pub charge_point_id: String,
    pub connector_id: Option<i32>,
    pub id_tag: Option<String>,
    pub meter_start: Option<i64>,
    pub meter_stop: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
}

impl Transaction {
    pub fn is_active(&self) -> bool {
        self.stopped_at.is_none()
    }
}

/// Details a charge point reports when a session begins.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub charge_point_id: String,
    pub connector_id: Option<i32>,
    pub id_tag: Option<String>,
    pub meter_start: Option<i64>,
    pub started_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionService: Send + Sync {
    /// Open a session and assign a gateway transaction id (1.6 flow).
    async fn start(&self, tx: NewTransaction) -> Result<Transaction>;

    /// Open or look up a session under a charge point assigned id (2.x flow).
    async fn track(&self, transaction_id: String, tx: NewTransaction) -> Result<Transaction>;

    async fn stop(
        &self,
        transaction_id: &str,
        meter_stop: Option<i64>,
        stopped_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<Transaction>;

    async fn get(&self, transaction_id: &str) -> Result<Option<Transaction>>;
}

/// Process-local transaction store. Ids handed out by `start` are increasing integers.
pub struct InMemoryTransactionStore {
    next_id: AtomicI64,
    transactions: RwLock<HashMap<String, Transaction>>,
}

impl Default for InMemoryTransactionStore {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            transactions: RwLock::new(HashMap::new()),
        }
    }
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.transactions.read().values().filter(|t| t.is_active()).count()
    }

    fn record(transaction_id: String, tx: NewTransaction) -> Transaction {
        Transaction {
            transaction_id,
            charge_point_id: tx.charge_point_id,
            connector_id: tx.connector_id,
            id_tag: tx.id_tag,
            meter_start: tx.meter_start,
            meter_stop: None,
            started_at: tx.started_at,
            stopped_at: None,
            stop_reason: None,
        }
    }
}

#[async_trait]
impl TransactionService for InMemoryTransactionStore {
    async fn start(&self, tx: NewTransaction) -> Result<Transaction> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let record = Self::record(id.clone(), tx);
        self.transactions.write().insert(id, record.clone());
        Ok(record)
    }

    async fn track(&self, transaction_id: String, tx: NewTransaction) -> Result<Transaction> {
        let mut transactions = self.transactions.write();
        let record = transactions
            .entry(transaction_id.clone())
            .or_insert_with(|| Self::record(transaction_id, tx));
        Ok(record.clone())
    }

    async fn stop(
        &self,
        transaction_id: &str,
        meter_stop: Option<i64>,
        stopped_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<Transaction> {
        let mut transactions = self.transactions.write();
        let Some(tx) = transactions.get_mut(transaction_id) else {
            bail!("unknown transaction {transaction_id}");
        };
        if tx.stopped_at.is_none() {
            tx.meter_stop = meter_stop;
            tx.stopped_at = Some(stopped_at);
            tx.stop_reason = reason;
        }
        Ok(tx.clone())
    }

    async fn get(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        Ok(self.transactions.read().get(transaction_id).cloned())
    }
}
