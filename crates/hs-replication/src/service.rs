//! Serving replicas: answers dump and retrieve-transactions requests.

use std::sync::Arc;

use async_trait::async_trait;
use hs_core::{ErrorKind, HandleError, HandleResult, Timestamp};
use hs_net::{RequestContext, ResponseStream, StreamingHandler};
use hs_proto::{Body, Message, Opcode, ResponseCode, ValueReference};
use hs_store::{HandleStorage, TransactionQueueSet};
use tokio::io::AsyncWrite;
use tracing::{info, warn};

use crate::dump::write_dump;
use crate::error::ReplicationResult;
use crate::retrieve::{decide_all, write_transactions, RetrievePlan};
use crate::signed_stream::{RecordWriter, SignedWriter, StreamSigner};
use crate::state::DaemonPause;

/// Streams dumps and transactions to authorized replicas.
pub struct ReplicationService {
    storage: Arc<dyn HandleStorage>,
    queues: Arc<TransactionQueueSet>,
    pause: Arc<DaemonPause>,
    signer: Option<StreamSigner>,
    tls: bool,
    replicators: Vec<ValueReference>,
}

impl ReplicationService {
    /// Serves `storage` and `queues` to the identities in `replicators`.
    pub fn new(
        storage: Arc<dyn HandleStorage>,
        queues: Arc<TransactionQueueSet>,
        replicators: Vec<ValueReference>,
    ) -> Self {
        Self {
            storage,
            queues,
            pause: Arc::new(DaemonPause::new()),
            signer: None,
            tls: false,
            replicators,
        }
    }

    /// Signs stream blocks with `signer`.
    pub fn with_signer(mut self, signer: StreamSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Marks unsigned streams as protected by the connection.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Shares the pause with the local replication daemon.
    pub fn with_pause(mut self, pause: Arc<DaemonPause>) -> Self {
        self.pause = pause;
        self
    }

    /// The daemon pause held while dumps run.
    pub fn pause(&self) -> &Arc<DaemonPause> {
        &self.pause
    }

    async fn writer<W: AsyncWrite + Unpin>(&self, inner: W) -> ReplicationResult<RecordWriter<W>> {
        let out = match &self.signer {
            Some(signer) => SignedWriter::signed(inner, signer.clone()).await?,
            None => SignedWriter::unsigned(inner, self.tls).await?,
        };
        Ok(RecordWriter::new(out))
    }

    fn authorized(&self, ctx: &RequestContext) -> bool {
        ctx.identity
            .as_ref()
            .is_some_and(|id| self.replicators.contains(id))
    }
}

#[async_trait]
impl StreamingHandler for ReplicationService {
    async fn stream(
        &self,
        ctx: &RequestContext,
        request: &Message,
        out: &mut ResponseStream<'_>,
    ) -> HandleResult<()> {
        if !self.authorized(ctx) {
            warn!(peer = %ctx.peer, identity = ?ctx.identity, opcode = %request.opcode, "replication refused");
            let refused = Message::response_to(
                request,
                ResponseCode::InsufficientPermissions,
                Body::error("not a replicator of this site"),
            );
            return out.send(&refused).await;
        }
        match (&request.opcode, &request.body) {
            (Opcode::RetrieveTxnLog, Body::RetrieveTxn(req)) => {
                let plan = decide_all(&self.queues, &req.positions, Timestamp::now());
                let status = plan.status();
                out.send(&Message::response_to(request, ResponseCode::Success, Body::RetrieveTxnResponse { status }))
                    .await?;
                let RetrievePlan::Send(plan) = plan else {
                    return Ok(());
                };
                let mut records = self.writer(&mut *out).await?;
                let sent = write_transactions(&self.queues, &plan, &req.shard, &mut records).await?;
                info!(peer = %ctx.peer, sent, server_num = req.shard.server_num, "transactions sent");
                Ok(())
            }
            (Opcode::DumpHandles, Body::DumpHandles(req)) => {
                let _paused = self.pause.dump_guard().await;
                out.send(&Message::response_to(request, ResponseCode::Success, Body::Empty)).await?;
                let mut records = self.writer(&mut *out).await?;
                let summary = write_dump(&self.storage, &self.queues, req, &mut records).await?;
                info!(
                    peer = %ctx.peer,
                    handles = summary.handles,
                    nas = summary.nas,
                    blocks = records.into_inner().blocks(),
                    "dump sent"
                );
                Ok(())
            }
            (op, _) => Err(HandleError::new(
                ErrorKind::MessageFormatError,
                format!("{op} has no streamed answer"),
            )),
        }
    }
}
