//! Boundaries to the services the provider drives but does not implement:
//! candidate lookup, BDX transfer setup, the fabric table and the held reply
//! channel of an asynchronous QueryImage.

use std::collections::BTreeMap;
use std::time::Duration;

use ota_proto::{CommandStatus, OtaQueryStatus, QueryImageResponse};
use tokio::sync::oneshot;

use crate::identity::{FabricIndex, NodeId};

/// What the requestor is running, as reported in QueryImage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateRequest {
    pub vendor_id: u16,
    pub product_id: u16,
    pub software_version: u32,
}

/// Answer of the candidate lookup service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateResult {
    pub status: OtaQueryStatus,
    pub image_url: Option<String>,
    pub image_size: u64,
    pub software_version: u32,
    pub software_version_string: Option<String>,
}

impl CandidateResult {
    pub fn not_available() -> Self {
        Self {
            status: OtaQueryStatus::NotAvailable,
            image_url: None,
            image_size: 0,
            software_version: 0,
            software_version_string: None,
        }
    }

    pub fn available(
        image_url: impl Into<String>,
        image_size: u64,
        software_version: u32,
        software_version_string: impl Into<String>,
    ) -> Self {
        Self {
            status: OtaQueryStatus::UpdateAvailable,
            image_url: Some(image_url.into()),
            image_size,
            software_version,
            software_version_string: Some(software_version_string.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("candidate lookup unavailable: {0}")]
    Unavailable(String),
}

/// Asynchronous "is there a newer image" service.
///
/// `fetch` only starts the lookup. The result is delivered exactly once,
/// later, to [`crate::OtaProvider::complete_query`] by whoever owns the
/// provider (see [`crate::service::CandidateSink`]).
pub trait CandidateLookup {
    fn fetch(&mut self, request: &CandidateRequest) -> Result<(), LookupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
}

/// Parameters of the BDX session the provider asks the coordinator to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub role: TransferRole,
    pub block_size: u16,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            role: TransferRole::Sender,
            block_size: 1024,
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BdxError {
    #[error("a BDX transfer is already active")]
    Busy,
    #[error("no BDX transfer has been initialized")]
    NotInitialized,
    #[error("BDX setup failed: {0}")]
    Setup(String),
}

/// Owner of the bulk transfer session. At most one transfer is active
/// system-wide; the byte pump behind it is not part of this crate.
pub trait BdxCoordinator {
    /// Register as the protocol handler for BDX sender sessions
    fn register_sender_handler(&mut self) -> Result<(), BdxError>;

    /// Claim the transfer slot for a requestor; `Busy` if it is taken
    fn initialize_transfer(&mut self, fabric_index: FabricIndex, node_id: NodeId) -> Result<(), BdxError>;

    /// Where the sender pulls image bytes from
    fn set_image_source_url(&mut self, url: &str, size: u64);

    fn prepare_for_transfer(&mut self, params: &TransferParams) -> Result<(), BdxError>;
}

/// The provider's own node identity on each fabric it belongs to
pub trait FabricTable {
    fn provider_node_id(&self, fabric_index: FabricIndex) -> Option<NodeId>;
}

impl FabricTable for BTreeMap<FabricIndex, NodeId> {
    fn provider_node_id(&self, fabric_index: FabricIndex) -> Option<NodeId> {
        self.get(&fabric_index).copied()
    }
}

/// Either a QueryImageResponse payload or a protocol-level status
pub type QueryReply = Result<QueryImageResponse, CommandStatus>;

/// Reply channel of a QueryImage command, held open while the candidate
/// lookup runs.
pub trait QueryResponder: Send {
    /// Acknowledge the command at the transport level right away so the peer
    /// does not time out while the lookup is pending
    fn flush_ack(&mut self) {}

    fn respond(self: Box<Self>, reply: QueryReply);
}

impl QueryResponder for oneshot::Sender<QueryReply> {
    fn respond(self: Box<Self>, reply: QueryReply) {
        if (*self).send(reply).is_err() {
            log::warn!("QueryImage reply dropped: requestor went away");
        }
    }
}
