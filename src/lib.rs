//! fleetpulse: the control-plane core of a telemetry fleet manager.
//!
//! Two halves share the [`model`]:
//!
//! - **Changes.** Resource mutations in a [`store::ResourceStore`] are
//!   published on an [`eventbus::Bus`], relayed by the [`resolver::Resolver`]
//!   and narrowed per subscriber by [`filter`].
//! - **Throughput.** Agents' counters enter through the
//!   [`measurements::MeasurementBatcher`], are stored as raw samples, turned
//!   into rates at query time and folded into node/edge totals by [`graph`].

pub mod cli;
pub mod config;
pub mod error;
pub mod eventbus;
pub mod filter;
pub mod graph;
pub mod measurements;
pub mod model;
pub mod resolver;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
