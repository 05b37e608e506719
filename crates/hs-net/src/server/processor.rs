//! Request processing against a [`HandleStorage`].
//!
//! Reads return public values to anyone and admin-readable values to an
//! authenticated administrator. Every mutation is checked against the
//! `HS_ADMIN` values of the handle (or of its naming authority for creates)
//! and recorded as a [`Transaction`](hs_proto::Transaction) in the local
//! queue, so replicas can follow.

use std::sync::Arc;

use async_trait::async_trait;
use hs_core::time::epoch_secs;
use hs_core::{ErrorKind, Handle, HandleError, HandleResult, WireDecode};
use hs_proto::{
    types, AdminPermissions, AdminRecord, Body, HandleValue, Message, OpFlags, Opcode,
    ResponseCode, TxnAction, ValueReference, MAX_NAMESPACE_DEPTH,
};
use hs_store::{HandleStorage, TransactionQueueSet};
use tracing::{debug, info};

use super::RequestContext;
use crate::race::BoxFuture;

/// Answers the non-session, non-challenge part of the protocol.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Answers `request`. Errors become error responses.
    async fn process(&self, ctx: &RequestContext, request: &Message) -> HandleResult<Message>;

    /// True if `request` must be authenticated before [`process`](Self::process).
    async fn needs_authentication(&self, request: &Message) -> HandleResult<bool>;

    /// The `HS_SECKEY` or `HS_PUBKEY` value `identity` points at, if held here.
    async fn identity_value(&self, identity: &ValueReference) -> HandleResult<Option<HandleValue>>;
}

/// A [`RequestProcessor`] over a storage engine and a transaction queue.
pub struct StorageRequestProcessor {
    storage: Arc<dyn HandleStorage>,
    queues: Arc<TransactionQueueSet>,
    server_admins: Vec<ValueReference>,
}

impl StorageRequestProcessor {
    /// Creates a processor. `server_admins` may home naming authorities and
    /// act on any handle.
    pub fn new(
        storage: Arc<dyn HandleStorage>,
        queues: Arc<TransactionQueueSet>,
        server_admins: Vec<ValueReference>,
    ) -> Self {
        Self {
            storage,
            queues,
            server_admins,
        }
    }

    /// Storage engine.
    pub fn storage(&self) -> &Arc<dyn HandleStorage> {
        &self.storage
    }

    /// Transaction queues.
    pub fn queues(&self) -> &Arc<TransactionQueueSet> {
        &self.queues
    }

    fn record(&self, handle: &Handle, action: TxnAction, values: Vec<HandleValue>) {
        self.queues.local().add_transaction(handle, action, values);
    }

    async fn values(&self, handle: &Handle) -> HandleResult<Vec<HandleValue>> {
        self.storage
            .get_raw_handle_values(handle)
            .await?
            .ok_or_else(|| HandleError::new(ErrorKind::HandleDoesNotExist, format!("{handle} not found")))
    }

    fn is_server_admin(&self, identity: &ValueReference) -> bool {
        self.server_admins.contains(identity)
    }

    /// True if `identity` holds `perm` through an `HS_ADMIN` value of
    /// `holder`, directly or through an `HS_VLIST` group.
    async fn authorized(&self, ctx: &RequestContext, holder: &Handle, perm: u16) -> HandleResult<bool> {
        let Some(identity) = &ctx.identity else {
            return Ok(false);
        };
        if self.is_server_admin(identity) {
            return Ok(true);
        }
        let Some(values) = self.storage.get_raw_handle_values(holder).await? else {
            return Ok(false);
        };
        for value in values.iter().filter(|v| v.has_type(types::HS_ADMIN)) {
            let record = AdminRecord::from_bytes(&value.data)?;
            if record.permissions.has(perm) && self.admin_matches(&record.admin, identity, 0).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn admin_matches<'a>(
        &'a self,
        admin: &'a ValueReference,
        identity: &'a ValueReference,
        depth: usize,
    ) -> BoxFuture<'a, HandleResult<bool>> {
        Box::pin(async move {
            if admin == identity {
                return Ok(true);
            }
            if depth >= MAX_NAMESPACE_DEPTH {
                return Err(HandleError::depth_limit(MAX_NAMESPACE_DEPTH));
            }
            let Some(values) = self.storage.get_raw_handle_values(&admin.handle).await? else {
                return Ok(false);
            };
            let Some(group) = values
                .iter()
                .find(|v| v.index == admin.index && v.has_type(types::HS_VLIST))
            else {
                return Ok(false);
            };
            let members = Vec::<ValueReference>::from_bytes(&group.data)?;
            for member in &members {
                if self.admin_matches(member, identity, depth + 1).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    async fn resolve(
        &self,
        ctx: &RequestContext,
        request: &Message,
        handle: &Handle,
        indexes: &[u32],
        type_filter: &[bytes::Bytes],
    ) -> HandleResult<Message> {
        let values = self.values(handle).await?;
        let matching: Vec<HandleValue> = values
            .into_iter()
            .filter(|v| filter_matches(v, indexes, type_filter))
            .collect();
        if matching.is_empty() && !(indexes.is_empty() && type_filter.is_empty()) {
            return Ok(Message::response_to(
                request,
                ResponseCode::ValuesNotFound,
                Body::error("no matching values"),
            ));
        }

        let admin_read = !request.flags.has(OpFlags::PUBLIC_ONLY)
            && self
                .authorized(ctx, handle, AdminPermissions::READ_VALUE)
                .await?;
        let readable: Vec<HandleValue> = matching
            .iter()
            .filter(|v| v.public_read || (admin_read && v.admin_read))
            .cloned()
            .collect();
        if readable.is_empty() && !matching.is_empty() {
            return Ok(denied(request, "values are not publicly readable"));
        }
        Ok(Message::response_to(
            request,
            ResponseCode::Success,
            Body::Values {
                handle: handle.clone(),
                values: readable,
            },
        ))
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        request: &Message,
        handle: &Handle,
        values: &[HandleValue],
    ) -> HandleResult<Message> {
        if !self
            .authorized(ctx, &handle.na_handle(), AdminPermissions::ADD_HANDLE)
            .await?
        {
            return Ok(denied(request, "not allowed to create handles here"));
        }
        let values = stamped(values.to_vec());
        let exists = self.storage.get_raw_handle_values(handle).await?.is_some();
        if exists && request.flags.has(OpFlags::OVERWRITE) {
            self.storage.update_value(handle, values.clone()).await?;
            self.record(handle, TxnAction::UpdateHandle, values);
        } else {
            self.storage.create_handle(handle, values.clone()).await?;
            self.record(handle, TxnAction::AddHandle, values);
        }
        info!(handle = %handle, overwrite = exists, "handle created");
        Ok(Message::response_to(request, ResponseCode::Success, Body::Empty))
    }

    async fn delete(&self, ctx: &RequestContext, request: &Message, handle: &Handle) -> HandleResult<Message> {
        if !self
            .authorized(ctx, handle, AdminPermissions::DELETE_HANDLE)
            .await?
        {
            return Ok(denied(request, "not allowed to delete this handle"));
        }
        if !self.storage.delete_handle(handle).await? {
            return Err(HandleError::new(
                ErrorKind::HandleDoesNotExist,
                format!("{handle} not found"),
            ));
        }
        self.record(handle, TxnAction::DeleteHandle, Vec::new());
        info!(handle = %handle, "handle deleted");
        Ok(Message::response_to(request, ResponseCode::Success, Body::Empty))
    }

    async fn add_values(
        &self,
        ctx: &RequestContext,
        request: &Message,
        handle: &Handle,
        added: &[HandleValue],
    ) -> HandleResult<Message> {
        let mut values = self.values(handle).await?;
        if !self
            .permitted_for(ctx, handle, added, AdminPermissions::ADD_VALUE, AdminPermissions::ADD_ADMIN)
            .await?
        {
            return Ok(denied(request, "not allowed to add these values"));
        }
        if let Some(dup) = added.iter().find(|a| values.iter().any(|v| v.index == a.index)) {
            return Ok(Message::response_to(
                request,
                ResponseCode::ValueAlreadyExists,
                Body::error(format!("index {} already in use", dup.index)),
            ));
        }
        values.extend(stamped(added.to_vec()));
        self.commit(handle, values).await?;
        Ok(Message::response_to(request, ResponseCode::Success, Body::Empty))
    }

    async fn modify_values(
        &self,
        ctx: &RequestContext,
        request: &Message,
        handle: &Handle,
        changed: &[HandleValue],
    ) -> HandleResult<Message> {
        let mut values = self.values(handle).await?;
        if !self
            .permitted_for(ctx, handle, changed, AdminPermissions::MODIFY_VALUE, AdminPermissions::MODIFY_ADMIN)
            .await?
        {
            return Ok(denied(request, "not allowed to modify these values"));
        }
        for change in stamped(changed.to_vec()) {
            match values.iter_mut().find(|v| v.index == change.index) {
                Some(slot) => *slot = change,
                None => {
                    return Ok(Message::response_to(
                        request,
                        ResponseCode::ValuesNotFound,
                        Body::error(format!("no value at index {}", change.index)),
                    ))
                }
            }
        }
        self.commit(handle, values).await?;
        Ok(Message::response_to(request, ResponseCode::Success, Body::Empty))
    }

    async fn remove_values(
        &self,
        ctx: &RequestContext,
        request: &Message,
        handle: &Handle,
        indexes: &[u32],
    ) -> HandleResult<Message> {
        let values = self.values(handle).await?;
        let removed: Vec<HandleValue> = values
            .iter()
            .filter(|v| indexes.contains(&v.index))
            .cloned()
            .collect();
        if !self
            .permitted_for(ctx, handle, &removed, AdminPermissions::REMOVE_VALUE, AdminPermissions::REMOVE_ADMIN)
            .await?
        {
            return Ok(denied(request, "not allowed to remove these values"));
        }
        let kept = values
            .into_iter()
            .filter(|v| !indexes.contains(&v.index))
            .collect();
        self.commit(handle, kept).await?;
        Ok(Message::response_to(request, ResponseCode::Success, Body::Empty))
    }

    /// Checks `perm` for ordinary values and `admin_perm` when any of
    /// `touched` is an `HS_ADMIN` value.
    async fn permitted_for(
        &self,
        ctx: &RequestContext,
        handle: &Handle,
        touched: &[HandleValue],
        perm: u16,
        admin_perm: u16,
    ) -> HandleResult<bool> {
        let touches_admin = touched.iter().any(|v| v.has_type(types::HS_ADMIN));
        let touches_other = touched.iter().any(|v| !v.has_type(types::HS_ADMIN));
        if touches_admin && !self.authorized(ctx, handle, admin_perm).await? {
            return Ok(false);
        }
        if touches_other && !self.authorized(ctx, handle, perm).await? {
            return Ok(false);
        }
        Ok(true)
    }

    async fn commit(&self, handle: &Handle, values: Vec<HandleValue>) -> HandleResult<()> {
        self.storage.update_value(handle, values.clone()).await?;
        self.record(handle, TxnAction::UpdateHandle, values);
        debug!(handle = %handle, "values updated");
        Ok(())
    }

    async fn list_handles(&self, ctx: &RequestContext, request: &Message, na: &Handle) -> HandleResult<Message> {
        let na = na.na_handle();
        if !self
            .authorized(ctx, &na, AdminPermissions::LIST_HANDLES)
            .await?
        {
            return Ok(denied(request, "not allowed to list handles"));
        }
        let prefix = na_prefix(&na);
        let handles = self
            .storage
            .scan_handles()
            .await?
            .into_iter()
            .filter(|h| !h.is_na_handle() && h.prefix().eq_ignore_ascii_case(prefix))
            .collect();
        Ok(Message::response_to(
            request,
            ResponseCode::Success,
            Body::HandleList { handles },
        ))
    }

    async fn list_derived_nas(&self, ctx: &RequestContext, request: &Message, na: &Handle) -> HandleResult<Message> {
        let na = na.na_handle();
        if !self
            .authorized(ctx, &na, AdminPermissions::LIST_HANDLES)
            .await?
        {
            return Ok(denied(request, "not allowed to list prefixes"));
        }
        let mut parent = na.as_bytes().to_ascii_uppercase();
        parent.push(b'.');
        let handles = self
            .storage
            .scan_handles()
            .await?
            .into_iter()
            .filter(|h| h.is_na_handle() && h.as_bytes().to_ascii_uppercase().starts_with(&parent))
            .collect();
        Ok(Message::response_to(
            request,
            ResponseCode::Success,
            Body::HandleList { handles },
        ))
    }

    async fn home(&self, ctx: &RequestContext, request: &Message, na: &Handle, home: bool) -> HandleResult<Message> {
        if !ctx.identity.as_ref().is_some_and(|id| self.is_server_admin(id)) {
            return Ok(denied(request, "only server administrators may home prefixes"));
        }
        let na = na.na_handle();
        self.storage.set_have_na(&na, home).await?;
        let action = if home { TxnAction::HomeNa } else { TxnAction::UnhomeNa };
        self.record(&na, action, Vec::new());
        info!(na = %na, home, "prefix homing changed");
        Ok(Message::response_to(request, ResponseCode::Success, Body::Empty))
    }

    fn require_server_admin(&self, ctx: &RequestContext) -> bool {
        ctx.identity.as_ref().is_some_and(|id| self.is_server_admin(id))
    }
}

#[async_trait]
impl RequestProcessor for StorageRequestProcessor {
    async fn process(&self, ctx: &RequestContext, request: &Message) -> HandleResult<Message> {
        match (&request.opcode, &request.body) {
            (Opcode::Resolution, Body::Resolution { handle, indexes, types }) => {
                self.resolve(ctx, request, handle, indexes, types).await
            }
            (Opcode::Resolution, Body::Handle { handle }) => self.resolve(ctx, request, handle, &[], &[]).await,
            (Opcode::CreateHandle, Body::Values { handle, values }) => {
                self.create(ctx, request, handle, values).await
            }
            (Opcode::DeleteHandle, Body::Handle { handle }) => self.delete(ctx, request, handle).await,
            (Opcode::AddValue, Body::Values { handle, values }) => {
                self.add_values(ctx, request, handle, values).await
            }
            (Opcode::ModifyValue, Body::Values { handle, values }) => {
                self.modify_values(ctx, request, handle, values).await
            }
            (Opcode::RemoveValue, Body::RemoveValues { handle, indexes }) => {
                self.remove_values(ctx, request, handle, indexes).await
            }
            (Opcode::ListHandles, Body::Handle { handle }) => self.list_handles(ctx, request, handle).await,
            (Opcode::ListNas, Body::Handle { handle }) => self.list_derived_nas(ctx, request, handle).await,
            (Opcode::HomeNa, Body::Handle { handle }) => self.home(ctx, request, handle, true).await,
            (Opcode::UnhomeNa, Body::Handle { handle }) => self.home(ctx, request, handle, false).await,
            (Opcode::ListHomedNas, _) => {
                if !self.require_server_admin(ctx) {
                    return Ok(denied(request, "only server administrators may list homed prefixes"));
                }
                let handles = self.storage.scan_nas().await?;
                Ok(Message::response_to(
                    request,
                    ResponseCode::Success,
                    Body::HandleList { handles },
                ))
            }
            (Opcode::GetNextTxnId, _) => {
                if !self.require_server_admin(ctx) {
                    return Ok(denied(request, "only server administrators may replicate"));
                }
                let txn_id = self.queues.local().next_txn_id();
                Ok(Message::response_to(
                    request,
                    ResponseCode::Success,
                    Body::NextTxnId { txn_id },
                ))
            }
            (opcode, body) => {
                debug!(%opcode, ?body, "unsupported request");
                Ok(Message::response_to(
                    request,
                    ResponseCode::OperationNotSupported,
                    Body::error(format!("{opcode} is not supported")),
                ))
            }
        }
    }

    async fn needs_authentication(&self, request: &Message) -> HandleResult<bool> {
        if request.opcode.is_admin() {
            return Ok(true);
        }
        let Body::Resolution { handle, indexes, types } = &request.body else {
            return Ok(false);
        };
        if request.flags.has(OpFlags::PUBLIC_ONLY) || (indexes.is_empty() && types.is_empty()) {
            return Ok(false);
        }
        // A filtered read of nothing but private values.
        let Some(values) = self.storage.get_raw_handle_values(handle).await? else {
            return Ok(false);
        };
        let mut matching = values.iter().filter(|v| filter_matches(v, indexes, types)).peekable();
        Ok(matching.peek().is_some() && matching.all(|v| !v.public_read && v.admin_read))
    }

    async fn identity_value(&self, identity: &ValueReference) -> HandleResult<Option<HandleValue>> {
        let Some(values) = self.storage.get_raw_handle_values(&identity.handle).await? else {
            return Ok(None);
        };
        Ok(values.into_iter().find(|v| {
            v.index == identity.index && (v.has_type(types::HS_SECKEY) || v.has_type(types::HS_PUBKEY))
        }))
    }
}

fn filter_matches(value: &HandleValue, indexes: &[u32], type_filter: &[bytes::Bytes]) -> bool {
    (indexes.is_empty() && type_filter.is_empty())
        || indexes.contains(&value.index)
        || type_filter.iter().any(|t| value.has_type(t))
}

fn stamped(values: Vec<HandleValue>) -> Vec<HandleValue> {
    let now = epoch_secs();
    values.into_iter().map(|v| v.with_timestamp(now)).collect()
}

fn denied(request: &Message, reason: &str) -> Message {
    debug!(opcode = %request.opcode, reason, "request denied");
    Message::response_to(request, ResponseCode::InsufficientPermissions, Body::error(reason))
}

/// The prefix a `0.NA/<prefix>` handle names.
fn na_prefix(na: &Handle) -> &[u8] {
    let bytes = na.as_bytes();
    if na.is_na_handle() {
        &bytes[hs_core::handle::NA_HANDLE_PREFIX.len()..]
    } else {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_core::WireEncode;
    use hs_proto::Protocol;
    use hs_store::{MemoryStorage, MemoryTransactionQueue, TransactionQueue};

    fn admin_ref() -> ValueReference {
        ValueReference::new("0.NA/10.1", 300)
    }

    async fn processor() -> (StorageRequestProcessor, Arc<MemoryTransactionQueue>) {
        let storage = Arc::new(MemoryStorage::new());
        let admin = AdminRecord::new(admin_ref(), AdminPermissions::ALL);
        storage
            .create_handle(
                &Handle::from("0.NA/10.1"),
                vec![
                    HandleValue::new(100, types::HS_ADMIN, admin.to_bytes()),
                    HandleValue::new(300, types::HS_SECKEY, "secret").private(),
                ],
            )
            .await
            .unwrap();
        storage
            .create_handle(
                &Handle::from("10.1/doc"),
                vec![
                    HandleValue::new(1, "URL", "https://example.org"),
                    HandleValue::new(2, "EMAIL", "a@example.org").private(),
                    HandleValue::new(100, types::HS_ADMIN, admin.to_bytes()),
                ],
            )
            .await
            .unwrap();
        let queue = Arc::new(MemoryTransactionQueue::new(""));
        let queues = Arc::new(TransactionQueueSet::new(queue.clone()));
        let server_admin = ValueReference::new("0.NA/0.NA", 300);
        (
            StorageRequestProcessor::new(storage, queues, vec![server_admin]),
            queue,
        )
    }

    fn ctx(identity: Option<ValueReference>) -> RequestContext {
        RequestContext {
            peer: "127.0.0.1:9".parse().unwrap(),
            protocol: Protocol::Tcp,
            session_id: 0,
            identity,
        }
    }

    fn resolution(handle: &str, types: &[&'static str]) -> Message {
        Message::request(
            Opcode::Resolution,
            Body::Resolution {
                handle: Handle::from(handle),
                indexes: vec![],
                types: types.iter().map(|t| bytes::Bytes::from_static(t.as_bytes())).collect(),
            },
        )
    }

    #[tokio::test]
    async fn test_resolution_hides_private_values() {
        let (p, _) = processor().await;
        let response = p.process(&ctx(None), &resolution("10.1/doc", &[])).await.unwrap();
        let indexes: Vec<u32> = response.body.values().iter().map(|v| v.index).collect();
        assert_eq!(indexes, vec![1, 100]);

        let response = p
            .process(&ctx(Some(admin_ref())), &resolution("10.1/doc", &[]))
            .await
            .unwrap();
        assert_eq!(response.body.values().len(), 3);

        let missing = p.process(&ctx(None), &resolution("10.1/none", &[])).await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::HandleDoesNotExist);

        let no_match = p.process(&ctx(None), &resolution("10.1/doc", &["FOO"])).await.unwrap();
        assert_eq!(no_match.response_code, ResponseCode::ValuesNotFound);
    }

    #[tokio::test]
    async fn test_private_filtered_read_needs_authentication() {
        let (p, _) = processor().await;
        assert!(p.needs_authentication(&resolution("10.1/doc", &["EMAIL"])).await.unwrap());
        assert!(!p.needs_authentication(&resolution("10.1/doc", &["URL"])).await.unwrap());
        assert!(!p.needs_authentication(&resolution("10.1/doc", &[])).await.unwrap());
        let create = Message::request(
            Opcode::CreateHandle,
            Body::Values {
                handle: Handle::from("10.1/new"),
                values: vec![],
            },
        );
        assert!(p.needs_authentication(&create).await.unwrap());
    }

    #[tokio::test]
    async fn test_mutations_are_authorized_and_recorded() {
        let (p, queue) = processor().await;
        let create = Message::request(
            Opcode::CreateHandle,
            Body::Values {
                handle: Handle::from("10.1/new"),
                values: vec![HandleValue::new(1, "URL", "https://example.com")],
            },
        );
        let denied = p.process(&ctx(None), &create).await.unwrap();
        assert_eq!(denied.response_code, ResponseCode::InsufficientPermissions);
        assert!(queue.is_empty());

        let ok = p.process(&ctx(Some(admin_ref())), &create).await.unwrap();
        assert_eq!(ok.response_code, ResponseCode::Success);
        assert_eq!(queue.len(), 1);

        let again = p.process(&ctx(Some(admin_ref())), &create).await.unwrap_err();
        assert_eq!(again.kind(), ErrorKind::HandleAlreadyExists);

        let add = Message::request(
            Opcode::AddValue,
            Body::Values {
                handle: Handle::from("10.1/doc"),
                values: vec![HandleValue::new(1, "URL", "https://dup.example")],
            },
        );
        let dup = p.process(&ctx(Some(admin_ref())), &add).await.unwrap();
        assert_eq!(dup.response_code, ResponseCode::ValueAlreadyExists);

        let remove = Message::request(
            Opcode::RemoveValue,
            Body::RemoveValues {
                handle: Handle::from("10.1/doc"),
                indexes: vec![2],
            },
        );
        p.process(&ctx(Some(admin_ref())), &remove).await.unwrap();
        let txns = queue.transactions_after(0);
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[1].action, TxnAction::UpdateHandle);
        assert_eq!(txns[1].values.len(), 2);
    }

    #[tokio::test]
    async fn test_admin_group_membership() {
        let (p, _) = processor().await;
        let member = ValueReference::new("0.NA/10.1", 301);
        let group = vec![ValueReference::new("0.NA/10.2", 300), member.clone()];
        let na = Handle::from("0.NA/10.1");
        let mut values = p.storage().get_raw_handle_values(&na).await.unwrap().unwrap();
        values.push(HandleValue::new(200, types::HS_VLIST, group.to_bytes()));
        values.push(HandleValue::new(
            101,
            types::HS_ADMIN,
            AdminRecord::new(ValueReference::new("0.NA/10.1", 200), AdminPermissions(AdminPermissions::LIST_HANDLES)).to_bytes(),
        ));
        p.storage().update_value(&na, values).await.unwrap();

        let list = Message::request(Opcode::ListHandles, Body::Handle { handle: na.clone() });
        let response = p.process(&ctx(Some(member)), &list).await.unwrap();
        assert_eq!(
            response.body,
            Body::HandleList {
                handles: vec![Handle::from("10.1/doc")]
            }
        );
        let outsider = p
            .process(&ctx(Some(ValueReference::new("0.NA/10.3", 300))), &list)
            .await
            .unwrap();
        assert_eq!(outsider.response_code, ResponseCode::InsufficientPermissions);
    }

    #[tokio::test]
    async fn test_homing_is_for_server_admins() {
        let (p, queue) = processor().await;
        let home = Message::request(Opcode::HomeNa, Body::Handle { handle: Handle::from("0.NA/20") });
        let denied = p.process(&ctx(Some(admin_ref())), &home).await.unwrap();
        assert_eq!(denied.response_code, ResponseCode::InsufficientPermissions);

        let server_admin = ValueReference::new("0.NA/0.NA", 300);
        p.process(&ctx(Some(server_admin)), &home).await.unwrap();
        assert!(p.storage().have_na(&Handle::from("0.NA/20")).await.unwrap());
        assert_eq!(queue.transactions_after(0)[0].action, TxnAction::HomeNa);
    }

    #[tokio::test]
    async fn test_identity_value_lookup() {
        let (p, _) = processor().await;
        let value = p.identity_value(&admin_ref()).await.unwrap().unwrap();
        assert!(value.has_type(types::HS_SECKEY));
        assert!(p
            .identity_value(&ValueReference::new("10.1/doc", 1))
            .await
            .unwrap()
            .is_none());
    }
}
