//! SiteScope Credit Ledger
//!
//! Reserves the cost of paid analyses before a task runs and settles or
//! discards those reservations once the task is terminal.
//!
//! # Lifecycle of a usage record
//!
//! ```text
//! create_usage_records ──► (unsettled) ──link_records_to_task──► (unsettled, linked)
//!                                                                   │
//!                        settle_task_credits ◄──────────────────────┤
//!                               │                                   │
//!                          (settled) ──refund_usage_record──►  delete_unsettled_records
//!                                         (refunded)              (deleted)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod error;
pub mod ledger;
pub mod retry;

pub use error::{LedgerError, Result};
pub use ledger::{CreditLedger, Reservation, Settlement};
pub use retry::retry_with_backoff;
