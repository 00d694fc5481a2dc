//! Query identity: canonical strings, equality and refinement validation.

use rtdb_bridge::{
    App, AppOptions, BridgeError, Database, DatabaseRegistry, MemoryConnector, OrderBy, Query,
};
use std::collections::HashSet;
use std::sync::Arc;

fn database(registry: &DatabaseRegistry, url: &str) -> Arc<Database> {
    let app = App::new(
        "queries",
        AppOptions {
            database_url: Some(url.to_string()),
        },
    );
    registry.get_instance(&app, Some(url)).unwrap()
}

fn registry() -> DatabaseRegistry {
    DatabaseRegistry::new(Arc::new(MemoryConnector::default()))
}

fn top_scores(db: &Arc<Database>) -> Query {
    db.reference("games")
        .unwrap()
        .order_by_child("score")
        .unwrap()
        .start_at(10)
        .unwrap()
        .limit_to_first(5)
        .unwrap()
}

#[test]
fn test_independently_built_queries_are_equal() {
    let registry = registry();
    let db = database(&registry, "https://one.example.com");

    let a = top_scores(&db);
    let b = top_scores(&db);
    assert_eq!(a, b);
    assert_eq!(a.spec().canonical(), b.spec().canonical());

    let set: HashSet<Query> = [a.clone(), b].into_iter().collect();
    assert_eq!(set.len(), 1);
    assert!(set.contains(&a));
}

#[test]
fn test_any_difference_breaks_equality() {
    let registry = registry();
    let one = database(&registry, "https://one.example.com");
    let two = database(&registry, "https://two.example.com");
    let base = top_scores(&one);

    // Other database
    assert_ne!(base, top_scores(&two));
    // Other path
    let other_path = one
        .reference("matches")
        .unwrap()
        .order_by_child("score")
        .unwrap()
        .start_at(10)
        .unwrap()
        .limit_to_first(5)
        .unwrap();
    assert_ne!(base, other_path);
    // Other limit
    let other_limit = one
        .reference("games")
        .unwrap()
        .order_by_child("score")
        .unwrap()
        .start_at(10)
        .unwrap()
        .limit_to_last(5)
        .unwrap();
    assert_ne!(base, other_limit);
    // Bound type matters
    let string_bound = one
        .reference("games")
        .unwrap()
        .order_by_child("score")
        .unwrap()
        .start_at("10")
        .unwrap()
        .limit_to_first(5)
        .unwrap();
    assert_ne!(base, string_bound);
}

#[test]
fn test_reference_navigation_round_trips() {
    let registry = registry();
    let db = database(&registry, "https://one.example.com");
    let games = db.reference("games").unwrap();

    let game = games.child("g1/players").unwrap();
    assert_eq!(game.key(), Some("players"));
    assert_eq!(game.parent().unwrap().parent().unwrap(), games);
    assert_eq!(games.root(), db.root_reference().unwrap());
    assert!(db.root_reference().unwrap().parent().is_none());

    assert_eq!(games, db.reference("/games/").unwrap());
    assert_eq!(games, games.as_query().reference());
    assert_eq!(games.spec().canonical(), "https://one.example.com/games");
}

#[test]
fn test_refinement_does_not_touch_the_original() {
    let registry = registry();
    let db = database(&registry, "https://one.example.com");
    let games = db.reference("games").unwrap();

    let ordered = games.order_by_key().unwrap();
    assert!(games.params().is_default());
    assert_eq!(ordered.params().order_by, Some(OrderBy::Key));
    assert_ne!(*games.as_query(), ordered);
}

#[test]
fn test_invalid_refinements_fail_synchronously() {
    let registry = registry();
    let db = database(&registry, "https://one.example.com");
    let games = db.reference("games").unwrap();

    let invalid = |result: rtdb_bridge::Result<Query>| {
        matches!(result, Err(BridgeError::InvalidQuery(_)))
    };

    assert!(invalid(games.order_by_key().unwrap().start_at(5)));
    assert!(invalid(games.order_by_key().unwrap().order_by_value()));
    assert!(invalid(games.order_by_priority().unwrap().equal_to(true)));
    assert!(invalid(games.start_at(1).unwrap().equal_to(1)));
    assert!(invalid(games.limit_to_first(0)));
    assert!(invalid(games.limit_to_first(3).unwrap().limit_to_last(3)));
    assert!(invalid(games.order_by_child("$priority")));

    assert!(matches!(
        db.reference("games.old"),
        Err(BridgeError::InvalidPath(_))
    ));
}
