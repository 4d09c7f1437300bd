//! Durable artifacts for sightline: the hash-chained evidence ledger,
//! per-class medoid files, and the offline KB promoter.
//!
//! Everything here is either append-only (ledger) or replaced atomically
//! (medoids); nothing mutates in place. The runtime only reads these
//! artifacts; writes happen from the verify worker (ledger) and the offline
//! promoter (medoids).

pub mod ledger;
pub mod medoid;
pub mod promote;

pub use ledger::{read_entries, EvidenceLedger, LedgerEntry, GENESIS_HASH};
pub use medoid::{read_class_medoids, write_class_medoids, MedoidRecord, MEDOID_CAP};
pub use promote::{PromotionRecord, Promoter, DEFAULT_LAMBDA};
