//! Embedded, dual-scope knowledge store for coding-agent memory.
//!
//! A session's assistant extracts facts about a project (or about the user
//! globally) from transcript content; this crate resolves those extractions
//! against what's already on record, keeps a temporally-bounded, sourced
//! history of every fact, and answers recall queries over it. Two physical
//! `redb` databases back it — one per project, one global — coordinated by
//! [`store_manager::StoreManager`], never a single shared file.
//!
//! Call order for a typical embedding: open a [`config::Config`] and a
//! [`store_manager::StoreManager`], run extractions through
//! [`resolver::Resolver::apply`], and read them back through
//! [`recall::query_index`] / [`recall::query`] / [`recall::explain`].
//! [`sweeper::run_sweep`] is the maintenance entry point, run periodically
//! off the hot path.

pub mod config;
pub mod content_log;
pub mod embedding;
pub mod entities;
pub mod error;
pub mod facts;
pub mod ids;
pub mod lexical;
pub mod links;
pub mod metrics;
pub mod persistence;
pub mod predicate_policy;
pub mod progress;
pub mod provenance;
pub mod recall;
pub mod resolver;
pub mod store_manager;
pub mod sweeper;
pub mod vector;

pub use config::Config;
pub use error::{Error, Result};
pub use persistence::Store;
pub use resolver::Resolver;
pub use store_manager::StoreManager;
