//! OTA software update provider
//!
//! Answers QueryImage, ApplyUpdateRequest and NotifyUpdateApplied from
//! requestor nodes, tracks which requestors may update, and sets up the BDX
//! transfer for every image it offers.
//!
//! [`OtaProvider`] is the synchronous state machine. [`service::spawn`] runs it
//! on a tokio task and hands out a [`ProviderHandle`].

pub mod collaborators;
pub mod config;
pub mod identity;
pub mod provider;
pub mod registry;
pub mod service;
pub mod token;
pub mod uri;

pub use collaborators::{
    BdxCoordinator, BdxError, CandidateLookup, CandidateRequest, CandidateResult, FabricTable, LookupError,
    QueryReply, QueryResponder, TransferParams, TransferRole,
};
pub use config::{BdxConfig, ConfigError, ProviderConfig};
pub use identity::{RequestorId, RequestorMatcher};
pub use provider::{EnableOutcome, OtaProvider, TransactionState, DEFAULT_DELAYED_ACTION_TIME_SEC};
pub use registry::{RegistryError, RequestorEntry, RequestorRegistry};
pub use service::{CandidateSink, ProviderHandle, QueryExchange, ServiceError};
pub use token::UpdateToken;
