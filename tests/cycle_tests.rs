mod common;

use common::{Fixture, entity, text};
use relmap::prelude::*;

fn friends() -> ConfigurationCatalog {
    ConfigurationCatalog::new().with(
        entity("Person")
            .property(text("name"))
            .one_to_one(OneToOneRelation::new("friend", "Person")),
    )
}

fn befriended() -> (EntityRef, EntityRef) {
    let ada = Instance::new("Person").with("id", 1).with("name", "ada").into_ref();
    let grace = Instance::new("Person")
        .with("id", 2)
        .with("name", "grace")
        .with_reference("friend", Some(ada.clone()))
        .into_ref();
    ada.set_reference("friend", Some(grace.clone()));
    (ada, grace)
}

#[test]
fn test_cyclic_graph_is_inserted_once_per_entity() -> Result<()> {
    let mut fixture = Fixture::lenient();
    let persister = fixture.build(&friends(), "Person")?;

    let (ada, grace) = befriended();
    persister.insert(&[ada.clone()])?;

    // grace is reached through ada and inserted first, ada is not inserted twice
    assert_eq!(fixture.count_on("person", StatementKind::Insert), 2);
    assert_eq!(fixture.database.column_values("person", "id")?, vec![Value::from(2), Value::from(1)]);
    assert_eq!(fixture.database.column_values("person", "friend_id")?, vec![Value::from(1), Value::from(2)]);
    assert!(ada.is_persisted() && grace.is_persisted());
    Ok(())
}

#[test]
fn test_cycle_is_loaded_in_two_selects() -> Result<()> {
    let mut fixture = Fixture::lenient();
    let persister = fixture.build(&friends(), "Person")?;
    let (ada, _) = befriended();
    persister.insert(&[ada])?;

    // 1. The first select captures the friend key, the second loads the friend
    fixture.database.clear_log();
    let ada = persister.select_one(Value::from(1))?.expect("person 1");
    assert_eq!(fixture.database.count(StatementKind::Select), 2);

    // 2. The friend of the friend is the instance already loaded
    let grace = ada.reference("friend").expect("friend of ada");
    assert_eq!(grace.get("name"), Value::from("grace"));
    let back = grace.reference("friend").expect("friend of grace");
    assert!(back.ptr_eq(&ada));
    Ok(())
}

#[test]
fn test_cycle_members_already_loaded_cost_no_select() -> Result<()> {
    let mut fixture = Fixture::lenient();
    let persister = fixture.build(&friends(), "Person")?;
    let (ada, _) = befriended();
    persister.insert(&[ada])?;

    fixture.database.clear_log();
    let loaded = persister.select(&[Value::from(1), Value::from(2)])?;
    assert_eq!(fixture.database.count(StatementKind::Select), 1);
    assert_eq!(loaded.len(), 2);
    let (first, second) = (&loaded[0], &loaded[1]);
    assert!(first.reference("friend").is_some_and(|f| f.ptr_eq(second)));
    assert!(second.reference("friend").is_some_and(|f| f.ptr_eq(first)));
    Ok(())
}

fn tree() -> ConfigurationCatalog {
    ConfigurationCatalog::new().with(
        entity("Node")
            .property(text("label"))
            .one_to_many(OneToManyRelation::new("children", "Node").mapped_by("parent").list()),
    )
}

#[test]
fn test_self_referencing_collection() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&tree(), "Node")?;

    let leaf = |id: i64, label: &str| Instance::new("Node").with("id", id).with("label", label).into_ref();
    let root = Instance::new("Node")
        .with("id", 1)
        .with("label", "root")
        .with_collection("children", vec![leaf(2, "left"), leaf(3, "right")])
        .into_ref();
    persister.insert(&[root])?;
    assert_eq!(
        fixture.database.column_values("node", "parent_id")?,
        vec![Value::Null, Value::from(1), Value::from(1)]
    );

    fixture.database.clear_log();
    let root = persister.select_one(Value::from(1))?.expect("node 1");
    assert_eq!(fixture.database.count(StatementKind::Select), 2);
    let children = root.collection("children");
    let labels: Vec<Value> = children.iter().map(|c| c.get("label")).collect();
    assert_eq!(labels, vec![Value::from("left"), Value::from("right")]);
    assert!(children[0].reference("parent").is_some_and(|p| p.ptr_eq(&root)));
    assert!(children[1].collection("children").is_empty());
    Ok(())
}

#[test]
fn test_each_level_of_a_cycle_costs_one_select() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&tree(), "Node")?;

    // 1. A chain four nodes deep
    let node = |id: i64, children: Vec<EntityRef>| {
        Instance::new("Node")
            .with("id", id)
            .with("label", format!("n{}", id))
            .with_collection("children", children)
            .into_ref()
    };
    let root = node(1, vec![node(2, vec![node(3, vec![node(4, vec![])])])]);
    persister.insert(&[root])?;

    // 2. The root select, then one round per level below it
    fixture.database.clear_log();
    let root = persister.select_one(Value::from(1))?.expect("node 1");
    assert_eq!(fixture.database.count(StatementKind::Select), 4);

    // 3. The whole chain is loaded
    let mut current = root;
    for id in 2..=4 {
        let children = current.collection("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].get("id"), Value::from(id));
        assert!(children[0].reference("parent").is_some_and(|p| p.ptr_eq(&current)));
        current = children[0].clone();
    }
    assert!(current.collection("children").is_empty());
    Ok(())
}

#[test]
fn test_tearing_down_a_tree() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&tree(), "Node")?;

    let child = Instance::new("Node").with("id", 2).with("label", "child").into_ref();
    let root = Instance::new("Node")
        .with("id", 1)
        .with("label", "root")
        .with_collection("children", vec![child.clone()])
        .into_ref();
    persister.insert(&[root.clone()])?;

    // the child is detached before its parent row goes away
    persister.delete(&[root])?;
    assert_eq!(fixture.database.column_values("node", "id")?, vec![Value::from(2)]);
    assert_eq!(fixture.database.column_values("node", "parent_id")?, vec![Value::Null]);
    Ok(())
}
