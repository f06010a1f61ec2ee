//! Provider task: owns the [`OtaProvider`] and serializes every command,
//! admin action and candidate lookup result through one mailbox

use log::{debug, info};
use ota_proto::{
    ApplyUpdateAction, ApplyUpdateRequest, ApplyUpdateResponse, CommandStatus, NotifyUpdateApplied, QueryImage,
};
use tokio::sync::{mpsc, oneshot};

use crate::collaborators::{BdxCoordinator, CandidateLookup, CandidateResult, FabricTable, QueryReply, QueryResponder};
use crate::config::ProviderConfig;
use crate::identity::{RequestorId, RequestorMatcher};
use crate::provider::{EnableOutcome, OtaProvider};
use crate::registry::{RegistryError, RequestorEntry};

const MAILBOX_CAPACITY: usize = 64;

pub type ApplyReply = Result<ApplyUpdateResponse, CommandStatus>;
pub type NotifyReply = Result<(), CommandStatus>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("OTA provider task has stopped")]
    Stopped,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ServiceError {
    pub fn status(&self) -> CommandStatus {
        match self {
            Self::Stopped => CommandStatus::Failure,
            Self::Registry(e) => e.status(),
        }
    }
}

enum ProviderCommand {
    Initialize {
        default_allow: bool,
    },
    QueryImage {
        requestor: RequestorId,
        query: QueryImage,
        responder: ChannelResponder,
    },
    ApplyUpdate {
        requestor: RequestorId,
        request: ApplyUpdateRequest,
        reply: oneshot::Sender<ApplyReply>,
    },
    NotifyApplied {
        requestor: RequestorId,
        request: NotifyUpdateApplied,
        reply: oneshot::Sender<NotifyReply>,
    },
    CandidateReady(CandidateResult),
    EnableOta {
        matcher: RequestorMatcher,
        once: bool,
        reply: oneshot::Sender<Result<EnableOutcome, RegistryError>>,
    },
    DisableOta {
        matcher: RequestorMatcher,
        reply: oneshot::Sender<Result<usize, RegistryError>>,
    },
    RemoveRequestor {
        requestor: RequestorId,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    SetDelayedQueryActionTime(u32),
    SetDelayedApplyActionTime(u32),
    SetUpdateAction(ApplyUpdateAction),
    Requestors {
        reply: oneshot::Sender<Vec<RequestorEntry>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Transport side of a held QueryImage
struct ChannelResponder {
    ack: Option<oneshot::Sender<()>>,
    reply: oneshot::Sender<QueryReply>,
}

impl QueryResponder for ChannelResponder {
    fn flush_ack(&mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }

    fn respond(self: Box<Self>, reply: QueryReply) {
        Box::new(self.reply).respond(reply);
    }
}

/// Caller side of a QueryImage in flight
pub struct QueryExchange {
    ack: oneshot::Receiver<()>,
    reply: oneshot::Receiver<QueryReply>,
}

impl QueryExchange {
    /// Resolves once the provider has either accepted the query for a lookup
    /// (true) or answered it straight away (false)
    pub async fn acknowledged(&mut self) -> bool {
        (&mut self.ack).await.is_ok()
    }

    pub async fn reply(self) -> Result<QueryReply, ServiceError> {
        self.reply.await.map_err(|_| ServiceError::Stopped)
    }
}

/// Delivers candidate lookup results back to the provider task. Does not keep
/// the task alive.
#[derive(Clone)]
pub struct CandidateSink {
    tx: mpsc::WeakSender<ProviderCommand>,
}

impl CandidateSink {
    pub async fn deliver(&self, result: CandidateResult) -> Result<(), ServiceError> {
        let tx = self.tx.upgrade().ok_or(ServiceError::Stopped)?;
        tx.send(ProviderCommand::CandidateReady(result))
            .await
            .map_err(|_| ServiceError::Stopped)
    }
}

/// Cloneable handle to a running provider task
#[derive(Clone)]
pub struct ProviderHandle {
    tx: mpsc::Sender<ProviderCommand>,
}

impl ProviderHandle {
    async fn send(&self, command: ProviderCommand) -> Result<(), ServiceError> {
        self.tx.send(command).await.map_err(|_| ServiceError::Stopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ProviderCommand,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn initialize(&self, default_allow: bool) -> Result<(), ServiceError> {
        self.send(ProviderCommand::Initialize { default_allow }).await
    }

    pub async fn query_image(&self, requestor: RequestorId, query: QueryImage) -> Result<QueryExchange, ServiceError> {
        let (ack_tx, ack) = oneshot::channel();
        let (reply_tx, reply) = oneshot::channel();
        let responder = ChannelResponder { ack: Some(ack_tx), reply: reply_tx };
        self.send(ProviderCommand::QueryImage { requestor, query, responder }).await?;
        Ok(QueryExchange { ack, reply })
    }

    pub async fn apply_update(
        &self,
        requestor: RequestorId,
        request: ApplyUpdateRequest,
    ) -> Result<ApplyReply, ServiceError> {
        self.request(|reply| ProviderCommand::ApplyUpdate { requestor, request, reply }).await
    }

    pub async fn notify_update_applied(
        &self,
        requestor: RequestorId,
        request: NotifyUpdateApplied,
    ) -> Result<NotifyReply, ServiceError> {
        self.request(|reply| ProviderCommand::NotifyApplied { requestor, request, reply }).await
    }

    pub async fn enable_ota(&self, matcher: RequestorMatcher, once: bool) -> Result<EnableOutcome, ServiceError> {
        Ok(self.request(|reply| ProviderCommand::EnableOta { matcher, once, reply }).await??)
    }

    pub async fn disable_ota(&self, matcher: RequestorMatcher) -> Result<usize, ServiceError> {
        Ok(self.request(|reply| ProviderCommand::DisableOta { matcher, reply }).await??)
    }

    pub async fn remove_requestor(&self, requestor: RequestorId) -> Result<(), ServiceError> {
        Ok(self.request(|reply| ProviderCommand::RemoveRequestor { requestor, reply }).await??)
    }

    pub async fn set_delayed_query_action_time(&self, seconds: u32) -> Result<(), ServiceError> {
        self.send(ProviderCommand::SetDelayedQueryActionTime(seconds)).await
    }

    pub async fn set_delayed_apply_action_time(&self, seconds: u32) -> Result<(), ServiceError> {
        self.send(ProviderCommand::SetDelayedApplyActionTime(seconds)).await
    }

    pub async fn set_update_action(&self, action: ApplyUpdateAction) -> Result<(), ServiceError> {
        self.send(ProviderCommand::SetUpdateAction(action)).await
    }

    /// Snapshot of the registry
    pub async fn requestors(&self) -> Result<Vec<RequestorEntry>, ServiceError> {
        self.request(|reply| ProviderCommand::Requestors { reply }).await
    }

    /// Stop the task; returns once it has exited
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(|done| ProviderCommand::Shutdown { done }).await
    }
}

/// Start the provider task. `make_lookup` receives the sink through which the
/// lookup reports its results.
pub fn spawn<L, B, F>(
    config: &ProviderConfig,
    make_lookup: impl FnOnce(CandidateSink) -> L,
    bdx: B,
    fabrics: F,
) -> ProviderHandle
where
    L: CandidateLookup + Send + 'static,
    B: BdxCoordinator + Send + 'static,
    F: FabricTable + Send + 'static,
{
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let sink = CandidateSink { tx: tx.downgrade() };

    let mut provider = OtaProvider::new(config, make_lookup(sink), bdx, fabrics);
    provider.initialize(config.default_allow);

    tokio::spawn(run(provider, rx));
    ProviderHandle { tx }
}

async fn run<L, B, F>(mut provider: OtaProvider<L, B, F>, mut rx: mpsc::Receiver<ProviderCommand>)
where
    L: CandidateLookup,
    B: BdxCoordinator,
    F: FabricTable,
{
    let mut done = None;

    while let Some(command) = rx.recv().await {
        match command {
            ProviderCommand::Initialize { default_allow } => provider.initialize(default_allow),
            ProviderCommand::QueryImage { requestor, query, responder } => {
                provider.handle_query_image(requestor, &query, Box::new(responder));
            }
            ProviderCommand::ApplyUpdate { requestor, request, reply } => {
                let _ = reply.send(provider.handle_apply_update_request(requestor, &request));
            }
            ProviderCommand::NotifyApplied { requestor, request, reply } => {
                let _ = reply.send(provider.handle_notify_update_applied(requestor, &request));
            }
            ProviderCommand::CandidateReady(result) => provider.complete_query(result),
            ProviderCommand::EnableOta { matcher, once, reply } => {
                let outcome = provider.enable_ota_for_node(matcher, once);
                if let Ok(outcome) = &outcome {
                    for id in &outcome.pending_updates {
                        info!("{id} has an update waiting for its next query");
                    }
                }
                let _ = reply.send(outcome);
            }
            ProviderCommand::DisableOta { matcher, reply } => {
                let _ = reply.send(provider.disable_ota_for_node(matcher));
            }
            ProviderCommand::RemoveRequestor { requestor, reply } => {
                let _ = reply.send(provider.remove_requestor(requestor));
            }
            ProviderCommand::SetDelayedQueryActionTime(seconds) => provider.set_delayed_query_action_time(seconds),
            ProviderCommand::SetDelayedApplyActionTime(seconds) => provider.set_delayed_apply_action_time(seconds),
            ProviderCommand::SetUpdateAction(action) => provider.set_update_action(action),
            ProviderCommand::Requestors { reply } => {
                let _ = reply.send(provider.requestors().cloned().collect());
            }
            ProviderCommand::Shutdown { done: tx } => {
                debug!("provider shutdown requested");
                done = Some(tx);
                break;
            }
        }
    }

    drop(rx);
    drop(provider);
    info!("OTA provider stopped");
    if let Some(done) = done {
        let _ = done.send(());
    }
}
