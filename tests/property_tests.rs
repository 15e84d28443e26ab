use std::collections::HashSet;

use proptest::prelude::*;
use replicon::membership::{Member, Membership};
use replicon::session::DeltaRequest;

fn member(port: i32, id: u8) -> Member {
    Member::new("127.0.0.1".parse().unwrap(), port, [id; 16])
}

proptest! {
    #[test]
    fn test_member_alive_idempotent_property(
        announcements in proptest::collection::vec((4001i32..4010, 1u8..4), 1..200)
    ) {
        let mut table = Membership::new(member(4000, 0));
        let mut distinct = HashSet::new();
        for (port, id) in announcements {
            let is_new = table.member_alive(member(port, id));
            prop_assert_eq!(is_new, distinct.insert((port, id)));
        }
        prop_assert_eq!(table.len(), distinct.len());
        prop_assert_eq!(table.members().len(), distinct.len());
    }

    #[test]
    fn test_coalescing_keeps_one_action_per_name_property(
        names in proptest::collection::vec("[a-e]", 1..100)
    ) {
        let mut delta = DeltaRequest::new("s", false, 8);
        for (i, name) in names.iter().enumerate() {
            delta.set_attribute(name, (i as i64).into());
        }
        let distinct: HashSet<&String> = names.iter().collect();
        prop_assert_eq!(delta.size(), distinct.len());
    }

    #[test]
    fn test_record_all_keeps_every_action_property(
        names in proptest::collection::vec("[a-e]", 1..100)
    ) {
        let mut delta = DeltaRequest::new("s", true, 8);
        for name in &names {
            delta.set_attribute(name, "x".into());
        }
        prop_assert_eq!(delta.size(), names.len());

        let decoded = DeltaRequest::deserialize(&delta.serialize().unwrap(), 8).unwrap();
        let replayed: Vec<&str> = decoded.actions().map(|a| a.name).collect();
        let recorded: Vec<&str> = names.iter().map(String::as_str).collect();
        prop_assert_eq!(replayed, recorded);
    }
}
