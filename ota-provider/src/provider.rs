//! OTA provider state machine
//!
//! Handles the three requestor commands. QueryImage is answered
//! asynchronously: the provider starts a candidate lookup, keeps the reply
//! channel, and answers once the lookup reports back through
//! [`OtaProvider::complete_query`]. Only one QueryImage may await its lookup
//! at a time; others are told to come back later.

use log::{debug, error, info, warn};
use ota_proto::{
    ApplyUpdateAction, ApplyUpdateRequest, ApplyUpdateResponse, CommandStatus, NotifyUpdateApplied,
    OtaQueryStatus, QueryImage, QueryImageResponse,
};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::collaborators::{
    BdxCoordinator, BdxError, CandidateLookup, CandidateRequest, CandidateResult, FabricTable,
    QueryReply, QueryResponder, TransferParams,
};
use crate::config::ProviderConfig;
use crate::identity::{RequestorId, RequestorMatcher};
use crate::registry::{RegistryError, RequestorEntry, RequestorRegistry};
use crate::token::UpdateToken;
use crate::uri;

/// Busy retry hint when nothing else is configured
pub const DEFAULT_DELAYED_ACTION_TIME_SEC: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    AwaitingCandidateLookup,
}

struct PendingQuery {
    requestor: RequestorId,
    responder: Box<dyn QueryResponder>,
}

/// Provider-wide fields; not per requestor
struct SessionState {
    pending: Option<PendingQuery>,
    delayed_query_action_time_sec: u32,
    delayed_apply_action_time_sec: u32,
    update_action: ApplyUpdateAction,
}

impl SessionState {
    fn new(config: &ProviderConfig) -> Self {
        Self {
            pending: None,
            delayed_query_action_time_sec: config.delayed_query_action_time_sec,
            delayed_apply_action_time_sec: config.delayed_apply_action_time_sec,
            update_action: ApplyUpdateAction::Proceed,
        }
    }
}

/// Result of an EnableOtaForNode admin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableOutcome {
    pub matched: usize,
    /// Matched requestors that were refused an available update earlier and
    /// can now be told about it
    pub pending_updates: Vec<RequestorId>,
}

enum OfferOutcome {
    Ready(Offer),
    TransferBusy,
}

struct Offer {
    image_uri: String,
    software_version: u32,
    software_version_string: String,
    update_token: UpdateToken,
}

pub struct OtaProvider<L, B, F> {
    config: ProviderConfig,
    registry: RequestorRegistry,
    session: SessionState,
    transfer: TransferParams,
    lookup: L,
    bdx: B,
    fabrics: F,
    rng: Box<dyn RngCore + Send>,
}

impl<L: CandidateLookup, B: BdxCoordinator, F: FabricTable> OtaProvider<L, B, F> {
    pub fn new(config: &ProviderConfig, lookup: L, bdx: B, fabrics: F) -> Self {
        Self {
            config: config.clone(),
            registry: RequestorRegistry::new(config.max_requestors, config.default_allow),
            session: SessionState::new(config),
            transfer: config.bdx.transfer_params(),
            lookup,
            bdx,
            fabrics,
            rng: Box::new(OsRng),
        }
    }

    /// Replace the update token source
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Reset transient session state, set the allow flag for new requestors
    /// and register for BDX sender sessions
    pub fn initialize(&mut self, default_allow: bool) {
        if let Some(pending) = self.session.pending.take() {
            warn!("re-initializing with a QueryImage from {} pending", pending.requestor);
            pending.responder.respond(Err(CommandStatus::Failure));
        }
        self.session = SessionState::new(&self.config);
        self.registry.set_default_allow(default_allow);

        if let Err(e) = self.bdx.register_sender_handler() {
            error!("failed to register BDX sender handler: {e}");
        }
        info!("OTA provider initialized (default allow: {default_allow})");
    }

    pub fn transaction_state(&self) -> TransactionState {
        match self.session.pending {
            Some(_) => TransactionState::AwaitingCandidateLookup,
            None => TransactionState::Idle,
        }
    }

    pub fn is_query_pending(&self) -> bool {
        self.session.pending.is_some()
    }

    /// Handle QueryImage. Never blocks: the reply goes to `responder`, either
    /// right away or after the candidate lookup completes.
    pub fn handle_query_image(
        &mut self,
        requestor: RequestorId,
        query: &QueryImage,
        mut responder: Box<dyn QueryResponder>,
    ) {
        info!(
            "QueryImage from {requestor}: vendor=0x{:04X} product=0x{:04X} version={}",
            query.vendor_id, query.product_id, query.software_version
        );

        match self.registry.find_or_create(requestor) {
            Ok((_, true)) => info!("new requestor {requestor}"),
            Ok(_) => {}
            Err(e) => {
                error!("cannot track requestor {requestor}: {e}");
                responder.respond(Err(e.status()));
                return;
            }
        }

        if let Some(pending) = &self.session.pending {
            warn!("QueryImage from {requestor} while {} is pending: busy", pending.requestor);
            let response = QueryImageResponse {
                delayed_action_time: Some(self.busy_delay()),
                ..QueryImageResponse::with_status(OtaQueryStatus::Busy)
            };
            responder.respond(Ok(response));
            return;
        }

        responder.flush_ack();
        self.session.pending = Some(PendingQuery { requestor, responder });

        let request = CandidateRequest {
            vendor_id: query.vendor_id,
            product_id: query.product_id,
            software_version: query.software_version,
        };
        if let Err(e) = self.lookup.fetch(&request) {
            warn!("candidate lookup for {requestor} failed to start: {e}");
            self.finish_query(OtaQueryStatus::NotAvailable);
        }
    }

    /// Candidate lookup callback for the pending QueryImage
    pub fn complete_query(&mut self, result: CandidateResult) {
        let Some(requestor) = self.session.pending.as_ref().map(|p| p.requestor) else {
            error!("candidate lookup completed with no QueryImage pending");
            return;
        };
        debug!("candidate lookup for {requestor}: {}", result.status.as_str());

        let mut status = result.status;
        if status == OtaQueryStatus::UpdateAvailable {
            match (self.registry.find_mut(&requestor), result.image_url) {
                (Some(entry), Some(url)) => {
                    entry.ota_image_url = url;
                    entry.ota_image_size = result.image_size;
                    entry.software_version = result.software_version;
                    entry.software_version_string = result.software_version_string.unwrap_or_default();
                }
                (None, _) => {
                    warn!("requestor {requestor} removed during candidate lookup");
                    status = OtaQueryStatus::NotAvailable;
                }
                (Some(_), None) => {
                    warn!("candidate for {requestor} has no image URL");
                    status = OtaQueryStatus::NotAvailable;
                }
            }
        }

        self.finish_query(status);
    }

    fn finish_query(&mut self, status: OtaQueryStatus) {
        let Some(pending) = self.session.pending.take() else {
            error!("no pending QueryImage to respond to");
            return;
        };
        let reply = self.build_query_image_response(pending.requestor, status);
        match &reply {
            Ok(response) => info!("QueryImageResponse to {}: {}", pending.requestor, response.status.as_str()),
            Err(status) => info!("QueryImage from {} failed: {status}", pending.requestor),
        }
        pending.responder.respond(reply);
    }

    fn build_query_image_response(&mut self, requestor: RequestorId, mut status: OtaQueryStatus) -> QueryReply {
        let allowed = match self.registry.find_mut(&requestor) {
            Some(entry) if entry.is_allowed() => true,
            Some(entry) => {
                if status == OtaQueryStatus::UpdateAvailable {
                    info!("update for {requestor} withheld: OTA not allowed");
                    entry.has_new_version = true;
                }
                false
            }
            None => false,
        };
        if !allowed {
            status = OtaQueryStatus::NotAvailable;
        }

        let mut response = QueryImageResponse::with_status(status);
        if status == OtaQueryStatus::UpdateAvailable {
            match self.prepare_offer(requestor)? {
                OfferOutcome::Ready(offer) => {
                    response.image_uri = Some(offer.image_uri);
                    response.software_version = Some(offer.software_version);
                    response.software_version_string = Some(offer.software_version_string);
                    response.update_token = Some(offer.update_token.as_bytes().to_vec());
                }
                OfferOutcome::TransferBusy => status = OtaQueryStatus::Busy,
            }
        }

        if status == OtaQueryStatus::Busy {
            response.delayed_action_time = Some(self.busy_delay());
        }
        response.status = status;
        Ok(response)
    }

    fn prepare_offer(&mut self, requestor: RequestorId) -> Result<OfferOutcome, CommandStatus> {
        let Some(provider_node_id) = self.fabrics.provider_node_id(requestor.fabric_index) else {
            error!("provider has no node id on fabric {}", requestor.fabric_index);
            return Err(CommandStatus::Failure);
        };
        let Some(entry) = self.registry.find_mut(&requestor) else {
            return Err(CommandStatus::Failure);
        };

        let file_name = uri::file_name_from_url(&entry.ota_image_url);
        match uri::build_image_uri(provider_node_id, file_name) {
            Ok(image_uri) => entry.image_uri = image_uri,
            Err(e) => {
                error!("cannot build image URI for {requestor}: {e}");
                entry.image_uri.clear();
                return Err(CommandStatus::Failure);
            }
        }

        let update_token = match UpdateToken::generate_with(self.rng.as_mut()) {
            Ok(token) => token,
            Err(e) => {
                error!("cannot generate update token for {requestor}: {e}");
                return Err(CommandStatus::Failure);
            }
        };

        match self.bdx.initialize_transfer(requestor.fabric_index, requestor.node_id) {
            Ok(()) => {}
            Err(BdxError::Busy) => {
                info!("BDX transfer in progress, {requestor} must retry");
                return Ok(OfferOutcome::TransferBusy);
            }
            Err(e) => {
                error!("BDX initialization for {requestor} failed: {e}");
                return Err(CommandStatus::Failure);
            }
        }

        self.bdx.set_image_source_url(&entry.ota_image_url, entry.ota_image_size);
        if let Err(e) = self.bdx.prepare_for_transfer(&self.transfer) {
            error!("BDX prepare for {requestor} failed: {e}");
            return Err(CommandStatus::Failure);
        }

        entry.update_token = Some(update_token);
        entry.has_new_version = false;
        debug!("offered {} to {requestor}, token {update_token}", entry.image_uri);

        Ok(OfferOutcome::Ready(Offer {
            image_uri: entry.image_uri.clone(),
            software_version: entry.software_version,
            software_version_string: entry.software_version_string.clone(),
            update_token,
        }))
    }

    fn busy_delay(&self) -> u32 {
        if self.session.delayed_query_action_time_sec != 0 {
            self.session.delayed_query_action_time_sec
        } else if self.session.delayed_apply_action_time_sec == 0 {
            DEFAULT_DELAYED_ACTION_TIME_SEC
        } else {
            self.session.delayed_apply_action_time_sec
        }
    }

    pub fn handle_apply_update_request(
        &mut self,
        requestor: RequestorId,
        request: &ApplyUpdateRequest,
    ) -> Result<ApplyUpdateResponse, CommandStatus> {
        let offered = self
            .registry
            .find(&requestor)
            .is_some_and(|e| e.matches_offer(&request.update_token, request.new_version));
        if !offered {
            warn!("ApplyUpdateRequest from {requestor} for version {} matches no offer", request.new_version);
            return Err(CommandStatus::InvalidCommand);
        }

        let response = ApplyUpdateResponse {
            action: self.session.update_action,
            delayed_action_time: self.session.delayed_apply_action_time_sec,
        };
        self.session.delayed_apply_action_time_sec = 0;
        self.session.update_action = ApplyUpdateAction::Proceed;

        info!("ApplyUpdateResponse to {requestor}: {:?} after {}s", response.action, response.delayed_action_time);
        Ok(response)
    }

    pub fn handle_notify_update_applied(
        &mut self,
        requestor: RequestorId,
        request: &NotifyUpdateApplied,
    ) -> Result<(), CommandStatus> {
        match self.registry.find_mut(&requestor) {
            Some(entry) if entry.matches_offer(&request.update_token, request.software_version) => {
                entry.ota_allowed_once = false;
                info!("{requestor} now runs version {}", request.software_version);
                Ok(())
            }
            _ => {
                warn!("NotifyUpdateApplied from {requestor} matches no offer");
                Err(CommandStatus::InvalidCommand)
            }
        }
    }

    // =========================================================================
    // Administration
    // =========================================================================

    pub fn enable_ota_for_node(&mut self, matcher: RequestorMatcher, once: bool) -> Result<EnableOutcome, RegistryError> {
        let matched = self.registry.set_allowed(&matcher, !once)?;
        let pending_updates = self
            .registry
            .iter()
            .filter(|e| matcher.matches(&e.id()) && e.has_new_version)
            .map(|e| e.id())
            .collect();
        info!("OTA enabled for {matcher} ({matched} requestors, once: {once})");
        Ok(EnableOutcome { matched, pending_updates })
    }

    pub fn disable_ota_for_node(&mut self, matcher: RequestorMatcher) -> Result<usize, RegistryError> {
        let matched = self.registry.set_disallowed(&matcher)?;
        info!("OTA disabled for {matcher} ({matched} requestors)");
        Ok(matched)
    }

    pub fn remove_requestor(&mut self, requestor: RequestorId) -> Result<(), RegistryError> {
        if !self.registry.remove(&requestor) {
            return Err(RegistryError::NotFound(RequestorMatcher::requestor(requestor)));
        }
        info!("requestor {requestor} removed");
        Ok(())
    }

    pub fn set_delayed_query_action_time(&mut self, seconds: u32) {
        self.session.delayed_query_action_time_sec = seconds;
    }

    pub fn set_delayed_apply_action_time(&mut self, seconds: u32) {
        self.session.delayed_apply_action_time_sec = seconds;
    }

    /// Disposition for the next ApplyUpdateRequest
    pub fn set_update_action(&mut self, action: ApplyUpdateAction) {
        self.session.update_action = action;
    }

    pub fn requestor(&self, id: &RequestorId) -> Option<&RequestorEntry> {
        self.registry.find(id)
    }

    pub fn requestors(&self) -> impl Iterator<Item = &RequestorEntry> {
        self.registry.iter()
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    pub fn bdx(&self) -> &B {
        &self.bdx
    }
}
