//! adpostd - escrow-backed settlement daemon for pinned-ad placements.
//!
//! Advertisers fund campaigns; channel hosts accept them. Funds sit in
//! escrow until an externally verified compliance check settles the campaign
//! by releasing payment to the channel host or refunding the advertiser.
//!
//! The crate is organised as:
//! - [`db`]: SQLite persistence (users, channels, campaigns, the ledger)
//! - [`services`]: campaign lifecycle, escrow coordination, posting and the
//!   background verification pipeline
//! - [`gateway`]: the messaging-platform boundary, behind a trait
//! - [`notify`]: fire-and-forget party notifications, behind a trait
//! - [`scheduler`]: keyed one-shot job scheduling over `tokio::time`

pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod scheduler;
pub mod services;
