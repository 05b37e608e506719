//! Property tests for the value, administrator and site encodings.

use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;
use hs_core::crypto::HashAlgorithm;
use hs_core::{Handle, HashOption, WireDecode, WireEncode, MAX_RECOGNIZED_TTL, VALUE_DIGEST_OFFSET};
use hs_proto::value::type_matches;
use hs_proto::{
    AdminPermissions, AdminRecord, HandleValue, Interface, InterfaceType, Protocol, ServerInfo,
    SiteInfo, TtlType, ValueReference,
};
use proptest::prelude::*;

fn handle_strategy() -> impl Strategy<Value = Handle> {
    "[0-9]{1,4}(\\.[0-9]{1,4}){0,2}/[A-Za-z0-9._-]{0,24}".prop_map(Handle::from)
}

fn reference_strategy() -> impl Strategy<Value = ValueReference> {
    (handle_strategy(), any::<u32>()).prop_map(|(handle, index)| ValueReference::new(handle, index))
}

fn value_strategy() -> impl Strategy<Value = HandleValue> {
    (
        any::<u32>(),
        "[A-Z_]{1,12}(\\.[A-Z]{1,8})?",
        proptest::collection::vec(any::<u8>(), 0..128),
        any::<bool>(),
        any::<u32>(),
        any::<u32>(),
        proptest::collection::vec(reference_strategy(), 0..3),
        any::<[bool; 4]>(),
    )
        .prop_map(|(index, ty, data, absolute, ttl, timestamp, references, perms)| {
            let ttl_type = if absolute { TtlType::Absolute } else { TtlType::Relative };
            let mut value = HandleValue::new(index, ty, data)
                .with_ttl(ttl_type, ttl)
                .with_timestamp(timestamp);
            value.references = references;
            value.admin_read = perms[0];
            value.admin_write = perms[1];
            value.public_read = perms[2];
            value.public_write = perms[3];
            value
        })
}

fn server_strategy() -> impl Strategy<Value = ServerInfo> {
    (
        any::<u32>(),
        any::<[u8; 4]>(),
        proptest::collection::vec(any::<u8>(), 0..64),
        proptest::collection::vec((0u8..4, 0u8..3, any::<u16>()), 0..4),
    )
        .prop_map(|(server_id, ip, key, ifaces)| ServerInfo {
            server_id,
            address: IpAddr::V4(Ipv4Addr::from(ip)),
            public_key: Bytes::from(key),
            interfaces: ifaces
                .into_iter()
                .map(|(kind, protocol, port)| {
                    let kind = match kind {
                        0 => InterfaceType::OutOfService,
                        1 => InterfaceType::Admin,
                        2 => InterfaceType::Query,
                        _ => InterfaceType::Both,
                    };
                    let protocol = match protocol {
                        0 => Protocol::Udp,
                        1 => Protocol::Tcp,
                        _ => Protocol::Http,
                    };
                    Interface::new(kind, protocol, port)
                })
                .collect(),
        })
}

proptest! {
    #[test]
    fn test_value_roundtrip(value in value_strategy()) {
        let decoded = HandleValue::from_bytes(&value.to_bytes()).unwrap();
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn test_digest_ignores_index_and_timestamp(
        value in value_strategy(),
        index in any::<u32>(),
        timestamp in any::<u32>(),
    ) {
        let mut moved = value.clone().with_timestamp(timestamp);
        moved.index = index;
        prop_assert_eq!(
            value.digest(HashAlgorithm::Sha256),
            moved.digest(HashAlgorithm::Sha256)
        );
        prop_assert_eq!(
            &value.to_bytes()[VALUE_DIGEST_OFFSET..],
            &moved.to_bytes()[VALUE_DIGEST_OFFSET..]
        );
    }

    #[test]
    fn test_digest_covers_data(value in value_strategy(), extra in any::<u8>()) {
        let mut changed = value.clone();
        let mut data = changed.data.to_vec();
        data.push(extra);
        changed.data = Bytes::from(data);
        prop_assert_ne!(
            value.digest(HashAlgorithm::Sha256),
            changed.digest(HashAlgorithm::Sha256)
        );
    }

    #[test]
    fn test_relative_ttl_expiry(ttl in 1u32..1_000_000, retrieved in 0u32..1_000_000_000, elapsed in 0u32..400_000) {
        let value = HandleValue::new(1, "URL", "x").with_ttl(TtlType::Relative, ttl);
        let limit = ttl.min(MAX_RECOGNIZED_TTL);
        let expired = value.is_expired(retrieved, retrieved + elapsed);
        prop_assert_eq!(expired, elapsed >= limit);
    }

    #[test]
    fn test_type_matches_dotted_subtypes(ty in "[A-Za-z]{1,10}", sub in "[A-Za-z]{1,6}") {
        let lower = ty.to_ascii_lowercase();
        let dotted = format!("{ty}.{sub}");
        let glued = format!("{ty}{sub}");
        prop_assert!(type_matches(ty.as_bytes(), lower.as_bytes()));
        prop_assert!(type_matches(dotted.as_bytes(), ty.as_bytes()));
        prop_assert!(!type_matches(glued.as_bytes(), ty.as_bytes()));
        prop_assert!(!type_matches(ty.as_bytes(), dotted.as_bytes()));
    }

    #[test]
    fn test_admin_record_roundtrip(admin in reference_strategy(), perms in 0u16..0x1000) {
        let record = AdminRecord::new(admin, AdminPermissions(perms));
        prop_assert_eq!(AdminRecord::from_bytes(&record.to_bytes()).unwrap(), record.clone());
        let legacy = record.to_legacy_bytes();
        prop_assert_eq!(legacy.len(), record.legacy_byte_length());
        prop_assert_eq!(AdminRecord::from_bytes(&legacy).unwrap(), record);
    }

    #[test]
    fn test_site_roundtrip(
        servers in proptest::collection::vec(server_strategy(), 1..4),
        primary in any::<bool>(),
        hash in 0u8..3,
        serial in any::<u16>(),
    ) {
        let mut site = SiteInfo::new(servers);
        site.is_primary = primary;
        site.serial = serial;
        site.hash_option = match hash {
            0 => HashOption::ByPrefix,
            1 => HashOption::BySuffix,
            _ => HashOption::ByAll,
        };
        site.attributes.push((Bytes::from_static(b"desc"), Bytes::from_static(b"props")));
        prop_assert_eq!(SiteInfo::from_value_data(&site.to_bytes()).unwrap(), site);
    }

    #[test]
    fn test_truncated_value_rejected(value in value_strategy(), cut in 1usize..16) {
        let bytes = value.to_bytes();
        let cut = cut.min(bytes.len());
        prop_assert!(HandleValue::from_bytes(&bytes[..bytes.len() - cut]).is_err());
    }
}
