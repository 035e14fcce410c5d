//! Multi-tenant reporting over Microsoft Graph, Azure Resource Manager,
//! Log Analytics and VirusTotal, tolerant of per-tenant failures.

pub mod aggregator;
pub mod client;
pub mod collector;
pub mod config;
pub mod credential;
pub mod directory;
pub mod enrich;
pub mod error;
pub mod paging;
pub mod params;
pub mod ratelimit;
pub mod response;
pub mod scope;
pub mod usecases;

pub use aggregator::{Aggregator, UseCase};
pub use collector::{Collected, FailureRecord};
pub use config::{Config, Environment};
pub use error::{Error, Result};
pub use params::Request;
pub use response::WirePayload;
pub use scope::{Scope, ScopeKind};
pub use usecases::Services;
