//! Actualization Tests - native objects becoming managed objects
//!
//! These tests verify that:
//! - Deferred strings, tuples and lists materialize from their native fields
//! - A materialized object is created once and then returned as-is
//! - Unknown native types are rejected with a precise error
//! - Extension types are mapped through their registered actualizer
//!
//! ============================================================================
//! EACH TEST FINDS SPECIFIC ACTUALIZATION BUGS - DO NOT WEAKEN ASSERTIONS
//! ============================================================================

mod common;

use common::{assert_refcount, BridgeFixture};
use objbridge::object::header::OBJECT_SIZE;
use objbridge::{Actualized, BridgeError, BuiltinType, Object, ObjectKind};

/// ============================================================================
/// DEFERRED CONSTRUCTION TESTS
/// ============================================================================

/// Test that a native string materializes to its bytes
///
/// **Bug this finds:** Off-by-one string lengths, stale native contents
/// **Invariant verified:** Materialized string equals the native bytes
#[test]
fn test_deferred_string_materializes() {
    // Arrange
    let fixture = BridgeFixture::with_defaults();
    let address = fixture.bridge.new_string(b"native bytes").unwrap();

    // Act
    let first = fixture.bridge.retrieve(address).unwrap();
    let second = fixture.bridge.retrieve(address).unwrap();

    // Assert
    assert_eq!(first, Object::from("native bytes"));
    assert!(first.is(&second), "second retrieve built a new object");
    assert_refcount(&fixture.bridge, address, 1, "materialized string");
}

/// Test that a native tuple materializes with its items
///
/// **Bug this finds:** Items read from wrong slots, items materialized twice
/// **Invariant verified:** Tuple items equal the native items, in order
#[test]
fn test_deferred_tuple_materializes() {
    // Arrange
    let fixture = BridgeFixture::with_defaults();
    let tuple = fixture.bridge.new_tuple(3).unwrap();
    let stored = Object::opaque("Widget", ());
    let stored_address = fixture.bridge.store(&stored).unwrap();

    fixture
        .bridge
        .tuple_set_item(tuple, 0, fixture.bridge.new_string(b"zero").unwrap())
        .unwrap();
    fixture.bridge.tuple_set_item(tuple, 1, stored_address).unwrap();
    fixture.bridge.incref(fixture.bridge.none_address()).unwrap();
    fixture
        .bridge
        .tuple_set_item(tuple, 2, fixture.bridge.none_address())
        .unwrap();

    // Act
    let first = fixture.bridge.retrieve(tuple).unwrap();
    let second = fixture.bridge.retrieve(tuple).unwrap();

    // Assert
    assert_eq!(first.kind(), ObjectKind::Tuple);
    let items = first.items().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], Object::from("zero"));
    assert!(items[1].is(&stored), "stored item was copied");
    assert!(items[2].is_none());
    assert!(first.is(&second), "second retrieve built a new tuple");
}

/// Test that a native list materializes and stays in sync
///
/// **Bug this finds:** Managed list not reflecting later native writes
/// **Invariant verified:** List items equal the native items after set_item
#[test]
fn test_deferred_list_materializes() {
    // Arrange
    let fixture = BridgeFixture::with_defaults();
    let list = fixture.bridge.new_list(2).unwrap();
    for (index, text) in [b"a", b"b"].iter().enumerate() {
        let item = fixture.bridge.new_string(*text).unwrap();
        fixture.bridge.list_set_item(list, index, item).unwrap();
    }

    // Act
    let managed = fixture.bridge.retrieve(list).unwrap();

    // Assert
    assert_eq!(
        managed.items().unwrap(),
        vec![Object::from("a"), Object::from("b")]
    );
    assert!(managed.is(&fixture.bridge.retrieve(list).unwrap()));

    let replacement = fixture.bridge.new_string(b"c").unwrap();
    fixture.bridge.list_set_item(list, 1, replacement).unwrap();
    assert_eq!(
        managed.items().unwrap(),
        vec![Object::from("a"), Object::from("c")]
    );
}

/// Test that a tuple cannot be changed once managed code has seen it
///
/// **Bug this finds:** Immutable managed tuples changing underneath their users
/// **Invariant verified:** tuple_set_item after materialization fails
#[test]
fn test_tuple_frozen_after_materialize() {
    // Arrange
    let fixture = BridgeFixture::with_defaults();
    let tuple = fixture.bridge.new_tuple(1).unwrap();
    fixture
        .bridge
        .tuple_set_item(tuple, 0, fixture.bridge.new_string(b"x").unwrap())
        .unwrap();
    fixture.bridge.retrieve(tuple).unwrap();
    let late = fixture.bridge.new_string(b"late").unwrap();

    // Act
    let result = fixture.bridge.tuple_set_item(tuple, 0, late);

    // Assert
    assert!(matches!(result, Err(BridgeError::ArgumentKind(_))));
    fixture.bridge.decref(late).unwrap();
}

/// ============================================================================
/// TYPE-DISPATCHED MAPPING TESTS
/// ============================================================================

/// Test that extension instances map through their actualizer
///
/// **Bug this finds:** Type pointer not followed, actualizer not consulted
/// **Invariant verified:** Unmapped instance becomes mapped on first use
#[test]
fn test_extension_instance_actualized() {
    // Arrange
    let mut fixture = BridgeFixture::with_defaults();
    let ty = fixture.define_type("Extension");
    let address = fixture.new_instance(ty);
    assert!(!fixture.bridge.has_pointer(address));

    // Act
    let obj = fixture.bridge.retrieve(address).unwrap();

    // Assert
    assert!(fixture.bridge.has_pointer(address));
    assert_eq!(obj.payload::<usize>(), Some(&address));
    assert!(fixture.bridge.has_pointer(ty), "type object was not mapped");
    assert_eq!(
        format!("{:?}", fixture.bridge.retrieve(ty).unwrap()),
        "<type 'Extension'>"
    );
}

/// Test that instances of unknown types are rejected
///
/// **Bug this finds:** Guessing a layout for foreign types
/// **Invariant verified:** NotInterpretable names the type pointer
#[test]
fn test_unknown_type_not_interpretable() {
    // Arrange - a type that was never given an actualizer
    let fixture = BridgeFixture::with_defaults();
    let address = fixture
        .bridge
        .new_object(fixture.bridge.builtin_type(BuiltinType::Dict), OBJECT_SIZE)
        .unwrap();

    // Act
    let result = fixture.bridge.attempt_to_map(address);

    // Assert
    match result {
        Err(BridgeError::NotInterpretable { type_address, .. }) => {
            assert_eq!(
                type_address,
                Some(fixture.bridge.builtin_type(BuiltinType::Dict))
            );
        },
        other => panic!("expected NotInterpretable, got {:?}", other),
    }
}

/// ============================================================================
/// FAILED MATERIALIZATION TESTS
/// ============================================================================

/// Test that a list whose item cannot be mapped stays deferred
///
/// **Bug this finds:** A failed materialization leaving an empty list mapped
/// **Invariant verified:** Every retrieve fails until the item becomes
/// mappable, then the list materializes with all of its native items
#[test]
fn test_failed_list_item_keeps_list_deferred() {
    // Arrange - slot 1 holds an instance of a type with no actualizer
    let fixture = BridgeFixture::with_defaults();
    let dict_type = fixture.bridge.builtin_type(BuiltinType::Dict);
    let list = fixture.bridge.new_list(2).unwrap();
    let text = fixture.bridge.new_string(b"ok").unwrap();
    let foreign = fixture.bridge.new_object(dict_type, OBJECT_SIZE).unwrap();
    fixture.bridge.list_set_item(list, 0, text).unwrap();
    fixture.bridge.list_set_item(list, 1, foreign).unwrap();
    let deferred = fixture.bridge.stats().deferred_entries;

    // Act
    let first = fixture.bridge.retrieve(list);
    let second = fixture.bridge.retrieve(list);

    // Assert - both attempts fail; only the string item materialized
    for (attempt, result) in [("first", first), ("second", second)] {
        assert!(
            matches!(result, Err(BridgeError::NotInterpretable { .. })),
            "{} retrieve: expected NotInterpretable, got {:?}",
            attempt,
            result
        );
    }
    assert_eq!(fixture.bridge.stats().deferred_entries, deferred - 1);

    fixture
        .bridge
        .register_actualizer(dict_type, |_| Ok(Actualized::Owned(Object::opaque("dict", ()))))
        .unwrap();
    let managed = fixture.bridge.retrieve(list).unwrap();
    let items = managed.items().unwrap();
    assert_eq!(items.len(), 2, "list materialized without its native items");
    assert_eq!(items[0], Object::from("ok"));
    assert!(items[1].is(&fixture.bridge.retrieve(foreign).unwrap()));
    assert_refcount(&fixture.bridge, list, 1, "list after retry");
}

/// Test that a tuple whose item cannot be mapped stays deferred
///
/// **Bug this finds:** Partial tuples reaching managed code
/// **Invariant verified:** The tuple can still be filled in and materialized
#[test]
fn test_failed_tuple_item_keeps_tuple_deferred() {
    // Arrange
    let fixture = BridgeFixture::with_defaults();
    let dict_type = fixture.bridge.builtin_type(BuiltinType::Dict);
    let tuple = fixture.bridge.new_tuple(2).unwrap();
    let foreign = fixture.bridge.new_object(dict_type, OBJECT_SIZE).unwrap();
    fixture
        .bridge
        .tuple_set_item(tuple, 0, fixture.bridge.new_string(b"ok").unwrap())
        .unwrap();
    fixture.bridge.tuple_set_item(tuple, 1, foreign).unwrap();

    // Act
    let result = fixture.bridge.retrieve(tuple);

    // Assert
    assert!(
        matches!(result, Err(BridgeError::NotInterpretable { .. })),
        "expected NotInterpretable, got {:?}",
        result
    );

    fixture
        .bridge
        .register_actualizer(dict_type, |_| Ok(Actualized::Owned(Object::opaque("dict", ()))))
        .unwrap();
    let managed = fixture.bridge.retrieve(tuple).unwrap();
    assert_eq!(managed.kind(), ObjectKind::Tuple);
    assert_eq!(managed.items().unwrap().len(), 2);
}

/// Test that the none singleton retrieves as the none object
///
/// **Bug this finds:** A second none object appearing on the managed side
/// **Invariant verified:** retrieve(none_address) is Object::none()
#[test]
fn test_none_singleton_identity() {
    let fixture = BridgeFixture::with_defaults();

    let none = fixture.bridge.retrieve(fixture.bridge.none_address()).unwrap();

    assert!(none.is(&Object::none()));
    assert_eq!(
        fixture.bridge.store(&Object::bool(true)).unwrap(),
        fixture.bridge.bool_address(true)
    );
}

/// Test that interned strings share one address
///
/// **Bug this finds:** Duplicate intern entries, missing references
/// **Invariant verified:** Equal contents map to one address
#[test]
fn test_interned_strings_shared() {
    let fixture = BridgeFixture::with_defaults();

    let first = fixture.bridge.intern(b"attribute").unwrap();
    let second = fixture.bridge.intern(b"attribute").unwrap();

    assert_eq!(first, second);
    assert_eq!(
        fixture.bridge.retrieve(first).unwrap(),
        Object::from("attribute")
    );
}
