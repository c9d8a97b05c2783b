//! Side-effect collaborators: notification fan-out and funds transfer
//!
//! The engine only depends on the traits. HTTP-backed implementations talk
//! to the financial API; in-memory ones back the demo binary and tests.

use crate::error::EngineError;
use crate::models::NotificationPriority;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub mod http;
pub use http::{FinancialApiClient, HttpNotificationChannel, HttpTransferService};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub channels: Vec<String>,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
}

/// Best-effort fan-out delivery
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Completed,
    PendingConfirmation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRequest {
    pub from_account: String,
    pub to_account: String,
    pub amount: Decimal,
    pub memo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferReceipt {
    pub status: TransferStatus,
    pub reference: String,
}

/// Executes or queues a funds movement
#[async_trait]
pub trait TransferService: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt>;
}

/// Keeps every notification it is asked to deliver.
pub struct RecordingNotificationChannel {
    sent: Mutex<Vec<Notification>>,
    failures_remaining: AtomicU32,
}

impl RecordingNotificationChannel {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` sends with a transient error.
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

impl Default for RecordingNotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for RecordingNotificationChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if consume_failure(&self.failures_remaining) {
            return Err(EngineError::ServiceUnavailable(
                "notification channel unavailable".to_string(),
            ));
        }

        info!(
            channels = ?notification.channels,
            title = %notification.title,
            "Notification delivered"
        );
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub request: TransferRequest,
    pub reference: String,
    pub at: DateTime<Utc>,
}

/// In-memory ledger. Completes every transfer unless told to fail.
pub struct InMemoryTransferService {
    ledger: Mutex<Vec<LedgerEntry>>,
    failures_remaining: AtomicU32,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl InMemoryTransferService {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    /// Hold every call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_first(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub async fn ledger(&self) -> Vec<LedgerEntry> {
        self.ledger.lock().await.clone()
    }

    /// Number of transfer calls received, including failed ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryTransferService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferService for InMemoryTransferService {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if consume_failure(&self.failures_remaining) {
            return Err(EngineError::ServiceUnavailable(
                "transfer service unavailable".to_string(),
            ));
        }

        let reference = format!("TRF-{}", Uuid::new_v4().simple());
        info!(
            from = %request.from_account,
            to = %request.to_account,
            amount = %request.amount,
            reference = %reference,
            "Transfer completed"
        );

        self.ledger.lock().await.push(LedgerEntry {
            request: request.clone(),
            reference: reference.clone(),
            at: Utc::now(),
        });

        Ok(TransferReceipt {
            status: TransferStatus::Completed,
            reference,
        })
    }
}

fn consume_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
