//! Integration tests for store snapshot/restore.

use tessera_store::prelude::*;

// -- test attribute types ---------------------------------------------------

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Health(u32);

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Name(String);

const ALICE: Holder = Holder(1);

fn open() -> (Store, Capability) {
    let (mut store, cap) = Store::open(StoreConfig::default()).unwrap();
    store.register_attribute::<Health>("health").unwrap();
    store.register_attribute::<Name>("name").unwrap();
    (store, cap)
}

/// A parent with two attributes, a nested child, a shared and a frozen
/// entity, plus one sequenced unit.
fn populate(store: &mut Store) -> (EntityId, EntityId) {
    let (parent, child) = store
        .execute(UnitContext::independent(ALICE, 10), |unit| {
            let parent = unit.create_entity("bag");
            unit.add(parent, "health", Health(3))?;
            unit.add(parent, "name", Name("satchel".into()))?;
            let child = unit.create_entity("coin");
            unit.add(child, 1u64, Health(1))?;
            unit.nest(child, parent)?;

            let shared = unit.create_entity("board");
            unit.add(shared, "name", Name("notice board".into()))?;
            unit.share(shared)?;
            let frozen = unit.create_entity("plaque");
            unit.freeze(frozen)?;
            Ok((parent, child))
        })
        .unwrap()
        .into_value();
    store
        .execute(UnitContext::sequenced(ALICE, 20), |_unit| Ok(()))
        .unwrap();
    (parent, child)
}

// -- tests ------------------------------------------------------------------

#[test]
fn restore_reproduces_state_hash() {
    let (mut source, _cap) = open();
    populate(&mut source);
    let snapshot = source.capture_snapshot().unwrap();

    let (mut target, cap) = open();
    target.restore_from_snapshot(&cap, &snapshot).unwrap();

    assert_eq!(target.state_hash().unwrap(), source.state_hash().unwrap());
    assert_eq!(target.capture_snapshot().unwrap(), snapshot);
}

#[test]
fn json_round_trip_preserves_hash() {
    let (mut source, _cap) = open();
    populate(&mut source);
    let snapshot = source.capture_snapshot().unwrap();

    let json = snapshot.to_json().unwrap();
    let parsed = StoreSnapshot::from_json(&json).unwrap();
    assert_eq!(parsed.hash().unwrap(), snapshot.hash().unwrap());
}

#[test]
fn restored_store_behaves_like_the_original() {
    let (mut source, _cap) = open();
    let (parent, child) = populate(&mut source);
    let snapshot = source.capture_snapshot().unwrap();

    let (mut target, cap) = open();
    target.restore_from_snapshot(&cap, &snapshot).unwrap();

    assert_eq!(target.peek::<Health>(parent, "health").unwrap(), &Health(3));
    assert_eq!(target.children_of(parent), vec![child]);
    assert_eq!(target.access_root(child).unwrap().root, parent);

    // New ids continue after the snapshot's.
    let fresh = target
        .execute(UnitContext::independent(ALICE, 30), |unit| {
            unit.borrow_mut::<Health>(child, 1u64)?.0 = 2;
            Ok(unit.create_entity("coin"))
        })
        .unwrap()
        .into_value();
    assert_eq!(fresh.to_raw(), snapshot.next_id);

    // Sequencing resumes too.
    let seq = target
        .execute(UnitContext::sequenced(ALICE, 40), |_unit| Ok(()))
        .unwrap()
        .receipt
        .sequence;
    assert_eq!(seq, Some(snapshot.next_sequence));
}

#[test]
fn unknown_type_tag_leaves_store_untouched() {
    let (mut source, _cap) = open();
    populate(&mut source);
    let snapshot = source.capture_snapshot().unwrap();

    let (mut target, cap) = Store::open(StoreConfig::default()).unwrap();
    target.register_attribute::<Health>("health").unwrap();
    let existing = target
        .execute(UnitContext::independent(ALICE, 0), |unit| {
            let e = unit.create_entity("local");
            unit.add(e, "health", Health(9))?;
            Ok(e)
        })
        .unwrap()
        .into_value();
    let before = target.state_hash().unwrap();

    let err = target.restore_from_snapshot(&cap, &snapshot).unwrap_err();
    assert!(matches!(err, StoreError::UnknownType { .. }));
    assert_eq!(target.state_hash().unwrap(), before);
    assert_eq!(target.peek::<Health>(existing, "health").unwrap(), &Health(9));
}

#[test]
fn orphaned_attribute_is_rejected() {
    let (mut source, _cap) = open();
    populate(&mut source);
    let mut snapshot = source.capture_snapshot().unwrap();
    snapshot.attributes[0].parent_id = EntityId::from_raw(500);

    let (mut target, target_cap) = open();
    let err = target.restore_from_snapshot(&target_cap, &snapshot).unwrap_err();
    assert_eq!(
        err,
        StoreError::EntityNotFound {
            entity: EntityId::from_raw(500)
        }
    );
    assert_eq!(target.entity_count(), 0);
}

#[test]
fn snapshot_from_later_schema_is_rejected() {
    let (mut source, cap) = open();
    populate(&mut source);
    source.upgrade_schema(&cap, 2).unwrap();
    let snapshot = source.capture_snapshot().unwrap();

    let (mut target, target_cap) = open();
    let err = target.restore_from_snapshot(&target_cap, &snapshot).unwrap_err();
    assert_eq!(
        err,
        StoreError::VersionMismatch {
            entity: None,
            expected: 1,
            found: 2
        }
    );
}

#[test]
fn restore_never_rewinds_the_allocator() {
    let (mut store, cap) = open();
    populate(&mut store);
    let snapshot = store.capture_snapshot().unwrap();

    let later = store
        .execute(UnitContext::independent(ALICE, 0), |unit| {
            Ok(unit.create_entity("later"))
        })
        .unwrap()
        .into_value();

    store.restore_from_snapshot(&cap, &snapshot).unwrap();
    assert!(store.entity(later).is_none());

    let fresh = store
        .execute(UnitContext::independent(ALICE, 0), |unit| {
            Ok(unit.create_entity("fresh"))
        })
        .unwrap()
        .into_value();
    assert!(fresh > later);
}
