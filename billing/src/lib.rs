//! CivicLedger Billing
//!
//! Invoices and receipts registered by the billing workflow, and the
//! settlement engine that applies payments against them. Every mutation
//! keeps `balance == payable - discount - paid`.

pub mod engine;
pub mod invoice;
pub mod receipt;

pub use engine::SettlementEngine;
pub use invoice::{AppliedPayment, Invoice, InvoiceStatus, NewInvoice, PaymentOutcome};
pub use receipt::{NewReceipt, PaymentMethod, Receipt, ReceiptStatus};
