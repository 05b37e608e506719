//! HS Proto - Message model and record formats for the Handle System protocol.
//!
//! This crate defines:
//! - Handle values, value references and admin records
//! - Site and server descriptions with server selection
//! - The message envelope, header, body variants and credentials
//! - Protocol version negotiation and per-version behavior
//! - Replication transactions
//! - Bootstrap handles and namespace chains

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod admin;
pub mod bootstrap;
pub mod message;
pub mod site;
pub mod transaction;
pub mod value;

pub use admin::{AdminPermissions, AdminRecord};
pub use bootstrap::{BootstrapHandles, NamespaceInfo, MAX_NAMESPACE_DEPTH};
pub use message::{
    Body, Credential, Envelope, Message, OpFlags, Opcode, ProtocolVersion, RequestState,
    ResponseCode,
};
pub use site::{AddressMap, Interface, InterfaceType, Protocol, ServerInfo, SiteInfo};
pub use transaction::{Transaction, TxnAction};
pub use value::{types, HandleValue, TtlType, ValueReference};
