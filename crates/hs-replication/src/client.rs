//! The replica side: follows a source server.
//!
//! Each round asks the source for the transactions after the replica's
//! positions. When the source answers that history is gone, the replica
//! redumps, resuming an interrupted dump where it stopped.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hs_core::{ErrorKind, HandleError};
use hs_net::session::{open, seal};
use hs_net::transport::tcp::{read_frame, write_frame};
use hs_net::{answer_challenge, AuthenticationInfo};
use hs_proto::message::{DumpHandlesRequest, ReplicaShard, RetrieveTxnRequest, RetrieveTxnStatus};
use hs_proto::{Body, Message, Opcode, ResponseCode};
use hs_store::HandleStorage;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dump::apply_dump;
use crate::error::{ReplicationError, ReplicationResult};
use crate::retrieve::apply_transactions;
use crate::signed_stream::{RecordReader, SignedReader, StreamVerifier};
use crate::state::{DaemonPause, DumpProgress, ReplicationState};

/// The server a replica follows.
#[derive(Debug, Clone)]
pub struct ReplicationSource {
    /// TCP address of the source.
    pub addr: SocketAddr,
    /// Expected stream signer; `None` accepts unsigned streams.
    pub verifier: Option<StreamVerifier>,
    /// Accept TLS-mode streams in place of signatures.
    pub trust_tls: bool,
}

/// What one replication round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A dump was applied.
    Dumped {
        /// Handle records received.
        handles: usize,
        /// Homed naming authorities received.
        nas: usize,
        /// The dump continued an interrupted one.
        resumed: bool,
    },
    /// Transactions were applied.
    Applied {
        /// Transactions applied.
        transactions: usize,
    },
}

/// Keeps a local storage in step with a source server.
pub struct ReplicationClient {
    source: ReplicationSource,
    shard: ReplicaShard,
    auth: AuthenticationInfo,
    storage: Arc<dyn HandleStorage>,
    state: Mutex<ReplicationState>,
    state_path: Option<PathBuf>,
    pause: Arc<DaemonPause>,
    timeout: Duration,
    next_request_id: AtomicU32,
}

impl ReplicationClient {
    /// Creates a client that authenticates to `source` with `auth`.
    pub fn new(
        source: ReplicationSource,
        shard: ReplicaShard,
        auth: AuthenticationInfo,
        storage: Arc<dyn HandleStorage>,
    ) -> Self {
        Self {
            source,
            shard,
            auth,
            storage,
            state: Mutex::new(ReplicationState::new()),
            state_path: None,
            pause: Arc::new(DaemonPause::new()),
            timeout: Duration::from_secs(30),
            next_request_id: AtomicU32::new(1),
        }
    }

    /// Persists state in `path`, loading what is already there.
    pub fn with_state_file(mut self, path: PathBuf) -> ReplicationResult<Self> {
        self.state = Mutex::new(ReplicationState::load(&path)?);
        self.state_path = Some(path);
        Ok(self)
    }

    /// Waits for dumps served by this process before each round.
    pub fn with_pause(mut self, pause: Arc<DaemonPause>) -> Self {
        self.pause = pause;
        self
    }

    /// Time allowed to connect and for each response header.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Copy of the current state.
    pub fn state(&self) -> ReplicationState {
        self.state.lock().clone()
    }

    /// Runs one replication round.
    pub async fn sync_once(&self) -> ReplicationResult<SyncOutcome> {
        let _daemon = self.pause.daemon_guard().await;
        let mut state = self.state.lock().clone();
        let result = self.sync_with(&mut state).await;
        *self.state.lock() = state.clone();
        if let Some(path) = &self.state_path {
            state.save(path)?;
        }
        result
    }

    async fn sync_with(&self, state: &mut ReplicationState) -> ReplicationResult<SyncOutcome> {
        if state.dump_progress().is_some() {
            return self.redump(state).await;
        }
        let request = RetrieveTxnRequest {
            shard: self.shard,
            positions: state.positions(),
        };
        let (response, stream) = self
            .open_stream(Opcode::RetrieveTxnLog, Body::RetrieveTxn(request))
            .await?;
        match response.body {
            Body::RetrieveTxnResponse {
                status: RetrieveTxnStatus::NeedToRedump,
            } => {
                info!(source = %self.source.addr, "source requires a redump");
                self.redump(state).await
            }
            Body::RetrieveTxnResponse {
                status: RetrieveTxnStatus::SendingTransactions,
            } => {
                let mut input = self.reader(stream).await?;
                let transactions = apply_transactions(&mut input, &self.storage, state).await?;
                debug!(source = %self.source.addr, transactions, "transactions applied");
                Ok(SyncOutcome::Applied { transactions })
            }
            other => Err(ReplicationError::Remote(HandleError::new(
                ErrorKind::MessageFormatError,
                format!("unexpected retrieve answer {other:?}"),
            ))),
        }
    }

    async fn redump(&self, state: &mut ReplicationState) -> ReplicationResult<SyncOutcome> {
        let resume = state.dump_progress().map(DumpProgress::to_resume);
        let resumed = resume.is_some();
        if !resumed {
            self.storage.delete_all_records().await?;
            state.clear_positions();
        }
        let request = DumpHandlesRequest {
            shard: self.shard,
            resume,
        };
        let (_, stream) = self
            .open_stream(Opcode::DumpHandles, Body::DumpHandles(request))
            .await?;
        let mut input = self.reader(stream).await?;
        let summary = apply_dump(&mut input, &self.storage, state).await?;
        info!(
            source = %self.source.addr,
            handles = summary.handles,
            nas = summary.nas,
            resumed,
            "redump complete"
        );
        Ok(SyncOutcome::Dumped {
            handles: summary.handles,
            nas: summary.nas,
            resumed,
        })
    }

    async fn reader(&self, stream: TcpStream) -> ReplicationResult<RecordReader<TcpStream>> {
        let input = SignedReader::open(stream, self.source.verifier.clone(), self.source.trust_tls).await?;
        Ok(RecordReader::new(input))
    }

    /// Sends `opcode` to the source, answering its challenge, and returns
    /// the response header with the connection positioned at the stream.
    async fn open_stream(&self, opcode: Opcode, body: Body) -> ReplicationResult<(Message, TcpStream)> {
        let addr = self.source.addr;
        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HandleError::new(ErrorKind::CannotConnectToServer, format!("{addr} timed out")))?
            .map_err(|e| HandleError::new(ErrorKind::CannotConnectToServer, format!("{addr}: {e}")))?;

        let mut request = Message::request(opcode, body);
        request.request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        write_frame(&mut stream, &seal(&request, None, false)?).await?;

        let mut answered = false;
        loop {
            let frame = timeout(self.timeout, read_frame(&mut stream))
                .await
                .map_err(|_| HandleError::new(ErrorKind::CannotConnectToServer, format!("{addr} did not answer")))??;
            let response = open(frame, None)?.into_result()?;
            if response.response_code != ResponseCode::AuthenticationNeeded {
                return Ok((response, stream));
            }
            if answered {
                return Err(HandleError::new(ErrorKind::UnableToAuthenticate, "challenged twice").into());
            }
            let answer = answer_challenge(&self.auth, &request, &response)?;
            write_frame(&mut stream, &seal(&answer, None, false)?).await?;
            answered = true;
            debug!(source = %addr, identity = %self.auth.identity(), "answered challenge");
        }
    }

    /// Runs rounds every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.sync_once().await {
                    Ok(outcome) => debug!(source = %self.source.addr, ?outcome, "replication round"),
                    Err(e) => warn!(source = %self.source.addr, error = %e, "replication round failed"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::whole_site;
    use crate::service::ReplicationService;
    use crate::signed_stream::StreamSigner;
    use hs_core::crypto::generate_rsa_key;
    use hs_core::{Handle, WireEncode};
    use hs_net::{HandleServer, ServerConfig, ServerHandle, StorageRequestProcessor};
    use hs_proto::{types, AdminPermissions, AdminRecord, HandleValue, TxnAction, ValueReference};
    use hs_store::{MemoryStorage, MemoryTransactionQueue, TransactionQueue, TransactionQueueSet};

    fn replicator() -> ValueReference {
        ValueReference::new(Handle::from("0.NA/10.1"), 300)
    }

    struct Primary {
        storage: Arc<dyn HandleStorage>,
        queue: Arc<MemoryTransactionQueue>,
        handle: ServerHandle,
    }

    async fn primary(signer: Option<StreamSigner>) -> Primary {
        let storage: Arc<dyn HandleStorage> = Arc::new(MemoryStorage::new());
        let record = AdminRecord::new(replicator(), AdminPermissions::ALL);
        storage
            .create_handle(
                &Handle::from("0.NA/10.1"),
                vec![
                    HandleValue::new(100, types::HS_ADMIN, record.to_bytes()),
                    HandleValue::new(300, types::HS_SECKEY, "pass").private(),
                ],
            )
            .await
            .unwrap();
        storage
            .create_handle(&Handle::from("10.1/x"), vec![HandleValue::new(1, "URL", "https://x")])
            .await
            .unwrap();
        storage.set_have_na(&Handle::from("0.NA/10.1"), true).await.unwrap();

        let queue = Arc::new(MemoryTransactionQueue::new(""));
        let queues = Arc::new(TransactionQueueSet::new(queue.clone()));
        let processor = Arc::new(StorageRequestProcessor::new(storage.clone(), queues.clone(), Vec::new()));
        let mut service = ReplicationService::new(storage.clone(), queues, vec![replicator()]);
        if let Some(signer) = signer {
            service = service.with_signer(signer);
        }
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = Arc::new(HandleServer::new(config, processor).with_streaming(Arc::new(service)));
        let handle = server.start().await.unwrap();
        Primary { storage, queue, handle }
    }

    fn client(addr: SocketAddr, verifier: Option<StreamVerifier>, secret: &str) -> ReplicationClient {
        ReplicationClient::new(
            ReplicationSource {
                addr,
                verifier,
                trust_tls: false,
            },
            whole_site(),
            AuthenticationInfo::secret_key(replicator(), secret.as_bytes().to_vec()),
            Arc::new(MemoryStorage::new()),
        )
        .with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_redump_then_follow() {
        let primary = primary(None).await;
        let replica = client(primary.handle.tcp_addr, None, "pass");

        let outcome = replica.sync_once().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Dumped {
                handles: 2,
                nas: 1,
                resumed: false
            }
        );
        assert!(replica.storage.get_raw_handle_values(&Handle::from("10.1/x")).await.unwrap().is_some());

        let y = Handle::from("10.1/y");
        let values = vec![HandleValue::new(1, "URL", "https://y")];
        primary.storage.create_handle(&y, values.clone()).await.unwrap();
        primary.queue.add_transaction(&y, TxnAction::AddHandle, values);

        let outcome = replica.sync_once().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied { transactions: 1 });
        assert!(replica.storage.get_raw_handle_values(&y).await.unwrap().is_some());
        assert_eq!(replica.state().position("").last_txn_id, 1);

        let outcome = replica.sync_once().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied { transactions: 0 });
        primary.handle.shutdown();
    }

    #[tokio::test]
    async fn test_signed_stream_verified() {
        let key = generate_rsa_key(1024).unwrap();
        let signer = StreamSigner {
            key: key.clone(),
            identity: replicator(),
        };
        let signed = primary(Some(signer)).await;
        let verifier = StreamVerifier {
            key: key.public_key(),
            identity: replicator(),
        };
        let replica = client(signed.handle.tcp_addr, Some(verifier), "pass");
        assert!(matches!(replica.sync_once().await.unwrap(), SyncOutcome::Dumped { .. }));

        let unsigned = primary(None).await;
        let strict = client(
            unsigned.handle.tcp_addr,
            Some(StreamVerifier {
                key: key.public_key(),
                identity: replicator(),
            }),
            "pass",
        );
        assert!(matches!(strict.sync_once().await, Err(ReplicationError::Compromised(_))));
        signed.handle.shutdown();
        unsigned.handle.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_round() {
        let primary = primary(None).await;
        let replica = client(primary.handle.tcp_addr, None, "wrong");
        let err: HandleError = replica.sync_once().await.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::UnableToAuthenticate);
        primary.handle.shutdown();
    }

    #[tokio::test]
    async fn test_state_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let primary = primary(None).await;
        let replica = client(primary.handle.tcp_addr, None, "pass")
            .with_state_file(path.clone())
            .unwrap();
        replica.sync_once().await.unwrap();
        let saved = ReplicationState::load(&path).unwrap();
        assert_eq!(saved.positions().len(), 1);
        primary.handle.shutdown();
    }
}
