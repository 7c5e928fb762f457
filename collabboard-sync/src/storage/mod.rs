//! Durable storage backends.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            DocumentStore                │
//! │  ┌───────────┐  ┌──────────┐            │
//! │  │ documents │  │ previews │            │
//! │  │ (LZ4 JSON)│  │ (raw)    │            │
//! │  └───────────┘  └──────────┘            │
//! │  ┌────────────┐ ┌──────────┐            │
//! │  │ operations │ │ metadata │            │
//! │  │ (journal)  │ │ (bincode)│            │
//! │  └────────────┘ └──────────┘            │
//! │             RocksDB                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! [`MemoryStore`](crate::persistence::MemoryStore) covers the in-process case.

pub mod rocks;

pub use rocks::{DocumentStore, StoreConfig};
