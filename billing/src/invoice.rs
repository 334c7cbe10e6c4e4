//! Invoices and their status lifecycle.

use civicledger_common::{Currency, InvoiceId, ReceiptId, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Invoice status.
///
/// ```text
/// Pending -> Sent -> Viewed -> Processing -> Processed
///                                  |            |
///                                  +-> Disputed <+
///
/// payments:  -> Partial <-> Settled      past due: -> Overdue
/// terminal:  Cancelled, Refunded
/// ```
///
/// `Partial`, `Settled`, `Overdue` and `Refunded` are derived from the
/// money fields by the settlement engine; the rest are workflow steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Sent,
    Viewed,
    Processing,
    Processed,
    Partial,
    Overdue,
    Disputed,
    Settled,
    Cancelled,
    Refunded,
}

impl InvoiceStatus {
    /// Check if this is a terminal state.
    pub fn is_final(&self) -> bool {
        matches!(self, InvoiceStatus::Cancelled | InvoiceStatus::Refunded)
    }

    /// Whether payments may still be applied.
    pub fn accepts_payment(&self) -> bool {
        !matches!(
            self,
            InvoiceStatus::Settled | InvoiceStatus::Cancelled | InvoiceStatus::Refunded
        )
    }

    /// Get valid workflow steps from current state.
    pub fn valid_transitions(&self) -> &[InvoiceStatus] {
        use InvoiceStatus::*;
        match self {
            Pending => &[Sent, Cancelled],
            Sent => &[Viewed, Processing, Cancelled],
            Viewed => &[Processing, Cancelled],
            Processing => &[Processed, Disputed, Cancelled],
            Processed => &[Disputed, Cancelled],
            Partial | Overdue => &[Disputed, Cancelled],
            Disputed => &[Processed, Cancelled],
            Settled | Cancelled | Refunded => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A payable obligation issued to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub reference: String,
    /// Service the invoice bills for, e.g. `permit` or `registration`.
    pub category: String,
    pub user_id: UserId,
    pub payable: Decimal,
    pub discount: Decimal,
    pub paid: Decimal,
    /// Always `payable - discount - paid`.
    pub balance: Decimal,
    /// Percent, e.g. `16` for 16%.
    pub tax_rate: Decimal,
    pub total_with_tax: Decimal,
    pub currency: Currency,
    /// Rate to the base currency when the invoice was issued.
    pub exchange_rate: Decimal,
    pub status: InvoiceStatus,
    pub due_at: Option<Timestamp>,
    pub approved_by: Option<UserId>,
    pub approved_at: Option<Timestamp>,
    pub cancellation_reason: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Invoice {
    pub(crate) fn issue(new: NewInvoice, reference: String, at: Timestamp) -> Self {
        let net = new.payable - new.discount;
        let total_with_tax = new
            .currency
            .round(net * (Decimal::ONE + new.tax_rate / Decimal::ONE_HUNDRED));

        Self {
            id: InvoiceId::new(),
            reference,
            category: new.category,
            user_id: new.user_id,
            payable: new.payable,
            discount: new.discount,
            paid: Decimal::ZERO,
            balance: net,
            tax_rate: new.tax_rate,
            total_with_tax,
            currency: new.currency,
            exchange_rate: new.exchange_rate,
            status: InvoiceStatus::Pending,
            due_at: new.due_at,
            approved_by: None,
            approved_at: None,
            cancellation_reason: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// Amount owed before any payment.
    pub fn net_payable(&self) -> Decimal {
        self.payable - self.discount
    }

    pub fn is_settled(&self) -> bool {
        self.balance.is_zero() && self.paid > Decimal::ZERO
    }

    /// Whether the invoice is past due with money outstanding at `at`.
    pub fn is_past_due(&self, at: Timestamp) -> bool {
        self.balance > Decimal::ZERO && self.due_at.map_or(false, |due| at > due)
    }

    pub(crate) fn recompute_balance(&mut self) {
        self.balance = self.payable - self.discount - self.paid;
    }

    /// Status after a change in `paid` at `at`: settled, then overdue, then partial.
    pub(crate) fn payment_status(&self, at: Timestamp) -> InvoiceStatus {
        if self.is_settled() {
            InvoiceStatus::Settled
        } else if self.is_past_due(at) {
            InvoiceStatus::Overdue
        } else if self.paid > Decimal::ZERO {
            InvoiceStatus::Partial
        } else {
            self.status
        }
    }
}

/// Request to register an invoice.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub category: String,
    pub user_id: UserId,
    pub payable: Decimal,
    pub discount: Decimal,
    pub tax_rate: Decimal,
    pub currency: Currency,
    pub exchange_rate: Decimal,
    pub due_at: Option<Timestamp>,
}

impl NewInvoice {
    /// An undiscounted, untaxed invoice with no due date.
    pub fn new(category: impl Into<String>, user_id: UserId, payable: Decimal, currency: Currency) -> Self {
        Self {
            category: category.into(),
            user_id,
            payable,
            discount: Decimal::ZERO,
            tax_rate: Decimal::ZERO,
            currency,
            exchange_rate: Decimal::ONE,
            due_at: None,
        }
    }

    pub fn with_discount(mut self, discount: Decimal) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_tax_rate(mut self, tax_rate: Decimal) -> Self {
        self.tax_rate = tax_rate;
        self
    }

    pub fn with_exchange_rate(mut self, rate: Decimal) -> Self {
        self.exchange_rate = rate;
        self
    }

    pub fn due(mut self, due_at: Timestamp) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

/// A payment applied to an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPayment {
    pub receipt_ref: String,
    pub receipt_id: ReceiptId,
    pub amount: Decimal,
    pub applied_at: Timestamp,
    /// Invoice status before this payment.
    pub prior_status: InvoiceStatus,
}

/// Outcome of `apply_payment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub invoice_id: InvoiceId,
    pub receipt_id: ReceiptId,
    pub new_balance: Decimal,
    pub new_status: InvoiceStatus,
}
