//! Receipts: evidence of a payment, standalone or against an invoice.

use civicledger_common::{Currency, InvoiceId, ReceiptId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Paid,
    PartiallyPaid,
    Overdue,
    Cancelled,
    Refunded,
}

impl ReceiptStatus {
    /// Whether more money can be recorded against the receipt.
    pub fn accepts_payment(&self) -> bool {
        matches!(
            self,
            ReceiptStatus::Pending | ReceiptStatus::PartiallyPaid | ReceiptStatus::Overdue
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    MobileMoney,
    Card,
    BankTransfer,
    Cash,
    Wallet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: ReceiptId,
    pub reference: String,
    pub invoice_id: Option<InvoiceId>,
    pub category: String,
    pub payer: String,
    pub payable: Decimal,
    pub discount: Decimal,
    pub paid: Decimal,
    pub balance: Decimal,
    pub currency: Currency,
    pub payment_method: Option<PaymentMethod>,
    /// Gateway transaction reference, when the payment came through one.
    pub transaction_ref: Option<String>,
    pub status: ReceiptStatus,
    pub issued_at: Timestamp,
    pub paid_at: Option<Timestamp>,
    pub due_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl Receipt {
    pub(crate) fn register(new: NewReceipt, reference: String, at: Timestamp) -> Self {
        Self {
            id: ReceiptId::new(),
            reference,
            invoice_id: new.invoice_id,
            category: new.category,
            payer: new.payer,
            payable: new.payable,
            discount: new.discount,
            paid: Decimal::ZERO,
            balance: new.payable - new.discount,
            currency: new.currency,
            payment_method: new.payment_method,
            transaction_ref: new.transaction_ref,
            status: ReceiptStatus::Pending,
            issued_at: at,
            paid_at: None,
            due_at: new.due_at,
            updated_at: at,
        }
    }

    /// A receipt generated for a payment that arrived without one.
    pub(crate) fn for_payment(
        reference: String,
        invoice_id: InvoiceId,
        category: &str,
        payer: String,
        amount: Decimal,
        currency: Currency,
        at: Timestamp,
    ) -> Self {
        Self {
            id: ReceiptId::new(),
            reference,
            invoice_id: Some(invoice_id),
            category: category.to_string(),
            payer,
            payable: amount,
            discount: Decimal::ZERO,
            paid: amount,
            balance: Decimal::ZERO,
            currency,
            payment_method: None,
            transaction_ref: None,
            status: ReceiptStatus::Paid,
            issued_at: at,
            paid_at: Some(at),
            due_at: None,
            updated_at: at,
        }
    }

    pub(crate) fn record_payment(&mut self, amount: Decimal, at: Timestamp) {
        self.paid += amount;
        self.balance = self.payable - self.discount - self.paid;
        self.status = if self.balance.is_zero() {
            ReceiptStatus::Paid
        } else {
            ReceiptStatus::PartiallyPaid
        };
        self.paid_at = Some(at);
        self.updated_at = at;
    }

    pub(crate) fn record_refund(&mut self, amount: Decimal, at: Timestamp) {
        self.paid -= amount;
        self.balance = self.payable - self.discount - self.paid;
        self.status = if self.paid.is_zero() {
            ReceiptStatus::Refunded
        } else {
            ReceiptStatus::PartiallyPaid
        };
        self.updated_at = at;
    }
}

/// Request to register a receipt ahead of payment.
#[derive(Debug, Clone)]
pub struct NewReceipt {
    /// Generated when absent.
    pub reference: Option<String>,
    pub invoice_id: Option<InvoiceId>,
    pub category: String,
    pub payer: String,
    pub payable: Decimal,
    pub discount: Decimal,
    pub currency: Currency,
    pub payment_method: Option<PaymentMethod>,
    pub transaction_ref: Option<String>,
    pub due_at: Option<Timestamp>,
}

impl NewReceipt {
    pub fn new(category: impl Into<String>, payer: impl Into<String>, payable: Decimal, currency: Currency) -> Self {
        Self {
            reference: None,
            invoice_id: None,
            category: category.into(),
            payer: payer.into(),
            payable,
            discount: Decimal::ZERO,
            currency,
            payment_method: None,
            transaction_ref: None,
            due_at: None,
        }
    }

    pub fn for_invoice(mut self, invoice_id: InvoiceId) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn paid_by(mut self, method: PaymentMethod) -> Self {
        self.payment_method = Some(method);
        self
    }
}
