//! `DomainPlugin` over the gRPC domain stream.
//!
//! A [`RemoteDomain`] wraps the outbound half of one plugin's
//! `ConnectDomain` stream. Every request is wrapped in a
//! [`pb::DomainMessage`] envelope with a fresh message ID; the stream
//! handler in the controller routes the correlated response back through a
//! oneshot registered here.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tonic::Status;
use uuid::Uuid;

use crate::api::DomainPlugin;
use crate::error::{PluginError, Result};
use crate::pb;
use crate::pb::domain_message::Payload;

/// Correlation table shared between a [`RemoteDomain`] and its stream
/// handler: message ID → waiting caller.
pub(crate) type Correlations = Arc<DashMap<String, oneshot::Sender<Payload>>>;

/// A connected out-of-process domain.
#[derive(Debug, Clone)]
pub struct RemoteDomain {
    plugin_name: String,
    sender: mpsc::Sender<std::result::Result<pb::DomainMessage, Status>>,
    correlations: Correlations,
}

impl RemoteDomain {
    pub(crate) fn new(
        plugin_name: String,
        sender: mpsc::Sender<std::result::Result<pb::DomainMessage, Status>>,
        correlations: Correlations,
    ) -> Self {
        Self {
            plugin_name,
            sender,
            correlations,
        }
    }

    /// The configured plugin name this domain registered as.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Send one request envelope and await its correlated response.
    async fn request(&self, payload: Payload) -> Result<Payload> {
        let message_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.correlations.insert(message_id.clone(), tx);

        let envelope = pb::DomainMessage {
            message_id: message_id.clone(),
            correlation_id: String::new(),
            payload: Some(payload),
        };
        if self.sender.send(Ok(envelope)).await.is_err() {
            self.correlations.remove(&message_id);
            return Err(PluginError::Transport(format!(
                "domain stream closed for plugin {}",
                self.plugin_name
            )));
        }

        match rx.await {
            Ok(Payload::ErrorRes(err)) => Err(PluginError::Domain(err.message)),
            Ok(payload) => Ok(payload),
            Err(_) => {
                self.correlations.remove(&message_id);
                Err(PluginError::Transport(format!(
                    "domain stream dropped awaiting response from plugin {}",
                    self.plugin_name
                )))
            }
        }
    }
}

/// Expand the whole `DomainPlugin` impl from request/response payload pairs.
macro_rules! domain_plugin_bridge {
    ($($method:ident: $req:ident / $res:ident, $req_ty:ty, $res_ty:ty;)+) => {
        #[async_trait::async_trait]
        impl DomainPlugin for RemoteDomain {
            $(
                async fn $method(&self, request: $req_ty) -> Result<$res_ty> {
                    match self.request(Payload::$req(request)).await? {
                        Payload::$res(response) => Ok(response),
                        _ => Err(PluginError::UnexpectedResponse(stringify!($method))),
                    }
                }
            )+
        }
    };
}

domain_plugin_bridge! {
    configure_domain: ConfigureDomain / ConfigureDomainRes,
        pb::ConfigureDomainRequest, pb::ConfigureDomainResponse;
    init_domain: InitDomain / InitDomainRes,
        pb::InitDomainRequest, pb::InitDomainResponse;
    init_deploy: InitDeploy / InitDeployRes,
        pb::InitDeployRequest, pb::InitDeployResponse;
    prepare_deploy: PrepareDeploy / PrepareDeployRes,
        pb::PrepareDeployRequest, pb::PrepareDeployResponse;
    init_transaction: InitTransaction / InitTransactionRes,
        pb::InitTransactionRequest, pb::InitTransactionResponse;
    assemble_transaction: AssembleTransaction / AssembleTransactionRes,
        pb::AssembleTransactionRequest, pb::AssembleTransactionResponse;
    endorse_transaction: EndorseTransaction / EndorseTransactionRes,
        pb::EndorseTransactionRequest, pb::EndorseTransactionResponse;
    prepare_transaction: PrepareTransaction / PrepareTransactionRes,
        pb::PrepareTransactionRequest, pb::PrepareTransactionResponse;
    handle_event_batch: HandleEventBatch / HandleEventBatchRes,
        pb::HandleEventBatchRequest, pb::HandleEventBatchResponse;
    get_verifier: GetVerifier / GetVerifierRes,
        pb::GetVerifierRequest, pb::GetVerifierResponse;
    sign: Sign / SignRes,
        pb::SignRequest, pb::SignResponse;
}
