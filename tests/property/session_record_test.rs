// tests/property/session_record_test.rs

//! Property-based tests for the `connection:node` session record.

use proptest::prelude::*;
use spinelgate::core::session::SessionRecord;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_record_parses_what_it_formats(
        connection_id in "[a-zA-Z0-9.:#\\[\\]]{1,64}",
        node_id in "[a-zA-Z0-9._-]{1,32}"
    ) {
        let record = SessionRecord::new(connection_id, node_id);
        prop_assert_eq!(SessionRecord::parse(&record.to_string()).unwrap(), record);
    }

    #[test]
    fn test_socket_address_connection_ids(
        a in any::<u8>(), b in any::<u8>(), c in any::<u8>(), d in any::<u8>(),
        port in 1u16..,
        suffix in prop::option::of(1u32..100),
        node_id in "[a-z0-9-]{1,16}"
    ) {
        let mut connection_id = format!("{a}.{b}.{c}.{d}:{port}");
        if let Some(n) = suffix {
            connection_id.push_str(&format!("#{n}"));
        }
        let parsed = SessionRecord::parse(&format!("{connection_id}:{node_id}")).unwrap();
        prop_assert_eq!(&parsed.connection_id, &connection_id);
        prop_assert!(parsed.is_owned_by(&node_id));
    }

    #[test]
    fn test_record_without_separator_is_rejected(value in "[a-zA-Z0-9._-]{0,64}") {
        prop_assert!(SessionRecord::parse(&value).is_err());
    }

    #[test]
    fn test_record_with_empty_half_is_rejected(part in "[a-zA-Z0-9._-]{1,32}") {
        let leading = format!(":{}", part);
        let trailing = format!("{}:", part);
        prop_assert!(SessionRecord::parse(&leading).is_err());
        prop_assert!(SessionRecord::parse(&trailing).is_err());
    }
}
