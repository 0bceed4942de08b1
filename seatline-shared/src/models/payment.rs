use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "SUCCESS" => Ok(PaymentStatus::Success),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// One payment attempt against a booking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub transaction_id: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub payment_method: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn new(
        booking_id: Uuid,
        transaction_id: String,
        amount: i64,
        payment_method: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            transaction_id,
            amount,
            status: PaymentStatus::Pending,
            payment_method,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    /// Record the gateway outcome
    pub fn settle(&mut self, success: bool, now: DateTime<Utc>) {
        self.status = if success { PaymentStatus::Success } else { PaymentStatus::Failed };
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    /// Mark as refunded (never delete)
    pub fn mark_refunded(&mut self, now: DateTime<Utc>) {
        self.status = PaymentStatus::Refunded;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Processed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Processed => "PROCESSED",
            RefundStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RefundStatus::Pending),
            "PROCESSED" => Ok(RefundStatus::Processed),
            "FAILED" => Ok(RefundStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Reversal of one successful payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub payment_id: Uuid,
    pub refund_reference: String,
    pub amount: i64,
    pub status: RefundStatus,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Refund {
    pub fn new(
        booking_id: Uuid,
        payment_id: Uuid,
        refund_reference: String,
        amount: i64,
        reason: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            payment_id,
            refund_reference,
            amount,
            status: RefundStatus::Pending,
            reason,
            created_at: now,
            processed_at: None,
        }
    }

    pub fn mark_processed(&mut self, now: DateTime<Utc>) {
        self.status = RefundStatus::Processed;
        self.processed_at = Some(now);
    }
}
