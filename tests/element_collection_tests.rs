mod common;

use common::{Fixture, entity, sorted, text};
use relmap::prelude::*;

fn people() -> ConfigurationCatalog {
    ConfigurationCatalog::new().with(
        entity("Person")
            .property(text("name"))
            .element_collection(ElementCollectionRelation::new("nicknames", DataType::Text))
            .element_collection(ElementCollectionRelation::new("scores", DataType::Integer).list().table("person_scores")),
    )
}

fn person(nicknames: &[&str], scores: &[i64]) -> EntityRef {
    Instance::new("Person")
        .with("id", 1)
        .with("name", "robert")
        .with_elements("nicknames", nicknames.iter().map(|n| Value::from(*n)).collect())
        .with_elements("scores", scores.iter().map(|s| Value::from(*s)).collect())
        .into_ref()
}

#[test]
fn test_elements_are_stored_and_loaded() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&people(), "Person")?;

    persister.insert(&[person(&["bob", "rob"], &[3, 1, 2])])?;
    assert_eq!(fixture.database.row_count("person_nicknames")?, 2);
    assert_eq!(
        fixture.database.column_values("person_scores", "idx")?,
        vec![Value::from(0), Value::from(1), Value::from(2)]
    );

    let loaded = persister.select_one(Value::from(1))?.expect("person 1");
    assert_eq!(sorted(loaded.elements("nicknames")), vec![Value::from("bob"), Value::from("rob")]);
    assert_eq!(loaded.elements("scores"), vec![Value::from(3), Value::from(1), Value::from(2)]);
    Ok(())
}

#[test]
fn test_changed_elements_are_deleted_and_inserted_never_updated() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&people(), "Person")?;

    let person = person(&["bob", "rob"], &[1]);
    persister.insert(&[person.clone()])?;
    fixture.database.clear_log();

    person.set_elements("nicknames", vec![Value::from("rob"), Value::from("bobby")]);
    persister.update(&[person])?;

    assert_eq!(fixture.count_on("person_nicknames", StatementKind::Update), 0);
    assert_eq!(fixture.count_on("person_nicknames", StatementKind::Delete), 1);
    assert_eq!(fixture.count_on("person_nicknames", StatementKind::Insert), 1);
    // the untouched collection and the owner row are left alone
    assert_eq!(fixture.tables_written(), vec!["person_nicknames".to_string(), "person_nicknames".to_string()]);
    assert_eq!(
        sorted(fixture.database.column_values("person_nicknames", "element")?),
        vec![Value::from("bobby"), Value::from("rob")]
    );
    Ok(())
}

#[test]
fn test_reordered_list_elements_are_rewritten() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&people(), "Person")?;

    let person = person(&[], &[1, 2]);
    persister.insert(&[person.clone()])?;

    person.set_elements("scores", vec![Value::from(2), Value::from(1)]);
    persister.update(&[person])?;

    let loaded = persister.select_one(Value::from(1))?.expect("person 1");
    assert_eq!(loaded.elements("scores"), vec![Value::from(2), Value::from(1)]);
    assert!(loaded.elements("nicknames").is_empty());
    Ok(())
}

#[test]
fn test_deleting_owner_deletes_its_elements() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&people(), "Person")?;

    let person = person(&["bob"], &[1, 2]);
    persister.insert(&[person.clone()])?;
    persister.delete(&[person])?;

    assert_eq!(fixture.database.row_count("person_nicknames")?, 0);
    assert_eq!(fixture.database.row_count("person_scores")?, 0);
    assert_eq!(fixture.database.row_count("person")?, 0);
    Ok(())
}
