mod common;

use common::{Fixture, entity, integer, sorted, text};
use relmap::persister::Duo;
use relmap::prelude::*;

fn circle() -> SubEntityConfiguration {
    SubEntityConfiguration::new("Circle").property(integer("radius"))
}

fn square() -> SubEntityConfiguration {
    SubEntityConfiguration::new("Square").property(integer("side"))
}

fn single_table() -> PolymorphismPolicy {
    PolymorphismPolicy::single_table()
        .discriminator_column("kind", DataType::Text)
        .add_discriminated_subtype("C", circle())
        .add_discriminated_subtype("S", square())
}

fn joined_tables() -> PolymorphismPolicy {
    PolymorphismPolicy::joined_tables().add_subtype(circle()).add_subtype(square())
}

fn table_per_class() -> PolymorphismPolicy {
    PolymorphismPolicy::table_per_class().add_subtype(circle()).add_subtype(square())
}

fn shapes(policy: PolymorphismPolicy) -> ConfigurationCatalog {
    ConfigurationCatalog::new().with(entity("Shape").property(text("name")).polymorphism(policy))
}

fn wheel() -> EntityRef {
    Instance::new("Circle")
        .with("id", 1)
        .with("name", "wheel")
        .with("radius", 3)
        .into_ref()
}

fn tile() -> EntityRef {
    Instance::new("Square").with("id", 2).with("name", "tile").with("side", 4).into_ref()
}

/// Inserts, reads back, updates and deletes a circle and a square through `persister`.
fn round_trip(persister: &dyn EntityPersister) -> Result<()> {
    let (wheel, tile) = (wheel(), tile());
    persister.insert(&[wheel.clone(), tile.clone()])?;

    let loaded = persister.select(&[Value::from(1), Value::from(2)])?;
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].class(), ClassName::new("Circle"));
    assert_eq!(loaded[0].get("name"), Value::from("wheel"));
    assert_eq!(loaded[0].get("radius"), Value::from(3));
    assert_eq!(loaded[1].class(), ClassName::new("Square"));
    assert_eq!(loaded[1].get("side"), Value::from(4));

    tile.set("side", 5);
    persister.update(&[tile])?;
    let reloaded = persister.select_one(Value::from(2))?.expect("square 2");
    assert_eq!(reloaded.get("side"), Value::from(5));

    persister.delete(&[wheel])?;
    assert!(persister.select_one(Value::from(1))?.is_none());
    assert_eq!(persister.select_all()?.len(), 1);
    Ok(())
}

#[test]
fn test_single_table_round_trip() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(single_table()), "Shape")?;

    persister.insert(&[wheel(), tile()])?;
    assert_eq!(fixture.database.column_values("shape", "kind")?, vec![Value::from("C"), Value::from("S")]);
    assert_eq!(fixture.database.column_values("shape", "side")?, vec![Value::Null, Value::from(4)]);

    // 1. One statement reads both subtypes
    fixture.database.clear_log();
    let loaded = persister.select(&[Value::from(1), Value::from(2)])?;
    assert_eq!(fixture.database.count(StatementKind::Select), 1);
    assert_eq!(loaded[0].class(), ClassName::new("Circle"));
    assert_eq!(loaded[1].class(), ClassName::new("Square"));
    Ok(())
}

#[test]
fn test_single_table_full_cycle() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(single_table()), "Shape")?;
    round_trip(persister.as_ref())?;
    assert_eq!(fixture.database.row_count("shape")?, 1);
    Ok(())
}

#[test]
fn test_joined_tables_full_cycle() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(joined_tables()), "Shape")?;

    // 1. Base row first, subtype row after
    persister.insert(&[wheel()])?;
    assert_eq!(fixture.tables_written(), vec!["shape".to_string(), "circle".to_string()]);
    persister.delete(&[persister.select_one(Value::from(1))?.expect("circle 1")])?;
    assert_eq!(fixture.database.row_count("shape")?, 0);
    assert_eq!(fixture.database.row_count("circle")?, 0);

    // 2. Full cycle
    round_trip(persister.as_ref())?;
    assert_eq!(fixture.database.row_count("square")?, 1);
    assert_eq!(fixture.database.row_count("circle")?, 0);
    Ok(())
}

#[test]
fn test_table_per_class_full_cycle() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(table_per_class()), "Shape")?;

    persister.insert(&[wheel(), tile()])?;
    assert!(!fixture.database.table_exists("shape"));
    assert_eq!(fixture.database.column_values("circle", "name")?, vec![Value::from("wheel")]);
    assert_eq!(fixture.database.column_values("square", "name")?, vec![Value::from("tile")]);

    // every subtype table is read
    fixture.database.clear_log();
    let loaded = persister.select(&[Value::from(2), Value::from(1)])?;
    assert_eq!(fixture.database.count(StatementKind::Select), 2);
    assert_eq!(loaded.len(), 2);

    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(table_per_class()), "Shape")?;
    round_trip(persister.as_ref())?;
    Ok(())
}

#[test]
fn test_criteria_reach_subtype_properties() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(single_table()), "Shape")?;
    persister.insert(&[wheel(), tile()])?;

    let found = persister.select_where(&EntityCriteria::eq("name", "tile"))?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].class(), ClassName::new("Square"));

    let found = persister.select_where(&EntityCriteria::like("name", "%ee%").or(EntityCriteria::eq("side", 9)))?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("radius"), Value::from(3));
    Ok(())
}

#[test]
fn test_unknown_subtype_is_rejected_before_any_statement() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(joined_tables()), "Shape")?;

    let triangle = Instance::new("Triangle").with("id", 3).into_ref();
    let err = persister.insert(&[wheel(), triangle]).unwrap_err();
    assert!(matches!(err, MappingError::UnknownSubtype(_)));
    assert_eq!(fixture.database.statement_count(), 0);
    Ok(())
}

#[test]
fn test_changing_class_on_update_is_rejected() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(single_table()), "Shape")?;

    let as_square = Instance::new("Square").with("id", 1).with("name", "wheel").with("side", 3).into_ref();
    let err = persister.update_pairs(&[Duo::new(as_square, wheel())], false).unwrap_err();
    assert!(matches!(err, MappingError::InvalidConfiguration(_)));
    assert_eq!(fixture.database.statement_count(), 0);
    Ok(())
}

#[test]
fn test_subtype_relations_apply_to_their_rows_only() -> Result<()> {
    let policy = PolymorphismPolicy::joined_tables()
        .add_subtype(circle().element_collection(ElementCollectionRelation::new("tags", DataType::Text)))
        .add_subtype(square());
    let mut fixture = Fixture::new();
    let persister = fixture.build(&shapes(policy), "Shape")?;

    let wheel = wheel();
    wheel.set_elements("tags", vec![Value::from("round"), Value::from("rolling")]);
    persister.insert(&[wheel, tile()])?;
    assert_eq!(fixture.database.row_count("shape_tags")?, 2);

    let loaded = persister.select(&[Value::from(1), Value::from(2)])?;
    assert_eq!(loaded.len(), 2);
    assert_eq!(sorted(loaded[0].elements("tags")), vec![Value::from("rolling"), Value::from("round")]);
    assert!(loaded[1].elements("tags").is_empty());
    Ok(())
}

#[test]
fn test_concrete_subtypes_are_registered() -> Result<()> {
    let mut fixture = Fixture::new();
    fixture.build(&shapes(single_table()), "Shape")?;

    let circles = fixture.persister("Circle")?;
    assert_eq!(circles.main_table(), "shape");
    circles.insert(&[wheel()])?;
    assert_eq!(fixture.database.column_values("shape", "kind")?, vec![Value::from("C")]);
    Ok(())
}

#[test]
fn test_incompatible_nesting_leaves_registry_unchanged() -> Result<()> {
    let policy = PolymorphismPolicy::joined_tables()
        .add_subtype(circle().polymorphism(PolymorphismPolicy::table_per_class().add_subtype(SubEntityConfiguration::new("Ring"))))
        .add_subtype(square());
    let mut fixture = Fixture::new();

    let err = fixture.build(&shapes(policy), "Shape").unwrap_err();
    assert!(matches!(err, MappingError::IncompatiblePolymorphism(_)));
    assert!(fixture.registry.is_empty());
    assert!(fixture.registry.schema().table_names().is_empty());
    Ok(())
}

#[test]
fn test_relation_to_table_per_class_base_is_rejected() {
    let catalog = shapes(table_per_class()).with(
        entity("Drawing").one_to_many(OneToManyRelation::new("shapes", "Shape").mapped_by("drawing")),
    );
    let mut fixture = Fixture::new();

    let err = fixture.build(&catalog, "Drawing").unwrap_err();
    assert!(matches!(err, MappingError::UnsupportedRelation(_)));
    assert!(fixture.registry.is_empty());
}

fn owned(policy: PolymorphismPolicy) -> ConfigurationCatalog {
    ConfigurationCatalog::new().with(entity("Person").property(text("name"))).with(
        entity("Shape")
            .property(text("name"))
            .one_to_one(OneToOneRelation::new("owner", "Person").mandatory())
            .polymorphism(policy),
    )
}

fn person(id: i64, name: &str) -> EntityRef {
    Instance::new("Person").with("id", id).with("name", name).into_ref()
}

#[test]
fn test_subtype_writes_run_base_relations() -> Result<()> {
    let mut fixture = Fixture::new();
    fixture.build(&owned(single_table()), "Shape")?;
    let circles = fixture.persister("Circle")?;

    // 1. The owner is mandatory on every shape
    let err = circles.insert(&[wheel()]).unwrap_err();
    assert!(matches!(
        err,
        MappingError::RelationMandatoryViolation { ref property, .. } if property == "owner"
    ));
    assert_eq!(fixture.database.statement_count(), 0);

    // 2. A new owner is inserted first
    let wheel = wheel();
    wheel.set_reference("owner", Some(person(1, "ada")));
    circles.insert(&[wheel])?;
    assert_eq!(fixture.database.row_count("person")?, 1);
    assert_eq!(fixture.tables_written(), vec!["person".to_string(), "shape".to_string()]);
    assert_eq!(fixture.database.column_values("shape", "owner_id")?, vec![Value::from(1)]);

    // 3. Another subtype is not written through the circles
    let tile = tile();
    tile.set_reference("owner", Some(person(2, "grace")));
    let err = circles.insert(&[tile]).unwrap_err();
    assert!(matches!(err, MappingError::TypeMismatch(_)));
    Ok(())
}

#[test]
fn test_relation_to_subtype_builds_its_hierarchy() -> Result<()> {
    let catalog = shapes(joined_tables()).with(
        entity("Wheelbarrow")
            .property(text("model"))
            .one_to_one(OneToOneRelation::new("wheel", "Circle")),
    );
    let mut fixture = Fixture::new();

    // 1. Shape is built on the way
    let persister = fixture.build(&catalog, "Wheelbarrow")?;
    assert!(fixture.registry.contains(&ClassName::new("Shape")));
    assert!(fixture.registry.contains(&ClassName::new("Circle")));

    // 2. The wheel is written through the hierarchy and read back
    let barrow = Instance::new("Wheelbarrow")
        .with("id", 1)
        .with("model", "garden")
        .with_reference("wheel", Some(wheel()))
        .into_ref();
    persister.insert(&[barrow])?;
    assert_eq!(fixture.database.row_count("shape")?, 1);
    assert_eq!(fixture.database.row_count("circle")?, 1);

    let loaded = persister.select_one(Value::from(1))?.expect("wheelbarrow 1");
    let wheel = loaded.reference("wheel").expect("wheel of the barrow");
    assert_eq!(wheel.class(), ClassName::new("Circle"));
    assert_eq!(wheel.get("name"), Value::from("wheel"));
    assert_eq!(wheel.get("radius"), Value::from(3));
    Ok(())
}

fn furnished(policy: PolymorphismPolicy) -> ConfigurationCatalog {
    ConfigurationCatalog::new()
        .with(entity("Person").property(text("name")))
        .with(entity("Part").property(text("label")))
        .with(
            entity("Shape")
                .property(text("name"))
                .one_to_one(OneToOneRelation::new("owner", "Person"))
                .one_to_many(OneToManyRelation::new("parts", "Part").list())
                .polymorphism(policy),
        )
}

fn part(id: i64, label: &str) -> EntityRef {
    Instance::new("Part").with("id", id).with("label", label).into_ref()
}

fn labels(entity: &EntityRef) -> Vec<Value> {
    entity.collection("parts").iter().map(|p| p.get("label")).collect()
}

/// Round trip of shapes holding an owner and a list of parts.
fn furnished_round_trip(fixture: &Fixture, persister: &dyn EntityPersister) -> Result<()> {
    let ada = person(1, "ada");
    let (rim, spoke) = (part(1, "rim"), part(2, "spoke"));
    let (wheel, tile) = (wheel(), tile());
    wheel.set_reference("owner", Some(ada.clone()));
    wheel.set_collection("parts", vec![rim.clone(), spoke.clone()]);
    tile.set_collection("parts", vec![part(3, "glaze")]);

    // 1. Insert cascades to owners and parts
    persister.insert(&[wheel.clone(), tile.clone()])?;
    assert_eq!(fixture.database.row_count("person")?, 1);
    assert_eq!(fixture.database.row_count("part")?, 3);

    // 2. Both relations are read back per subtype
    let loaded = persister.select(&[Value::from(1), Value::from(2)])?;
    assert_eq!(loaded.len(), 2);
    let owner = loaded[0].reference("owner").expect("owner of the wheel");
    assert_eq!(owner.get("name"), Value::from("ada"));
    assert_eq!(labels(&loaded[0]), vec![Value::from("rim"), Value::from("spoke")]);
    assert!(loaded[1].reference("owner").is_none());
    assert_eq!(labels(&loaded[1]), vec![Value::from("glaze")]);

    // 3. Reordered parts and a new owner are written on update
    wheel.set_collection("parts", vec![spoke, rim]);
    tile.set_reference("owner", Some(ada));
    persister.update(&[wheel.clone(), tile])?;
    let wheel_again = persister.select_one(Value::from(1))?.expect("circle 1");
    assert_eq!(labels(&wheel_again), vec![Value::from("spoke"), Value::from("rim")]);
    let tile_again = persister.select_one(Value::from(2))?.expect("square 2");
    assert!(tile_again.reference("owner").is_some_and(|o| o.get("name") == Value::from("ada")));

    // 4. Deleting a shape keeps the other one whole
    persister.delete(&[wheel])?;
    assert!(persister.select_one(Value::from(1))?.is_none());
    let remaining = persister.select_all()?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(labels(&remaining[0]), vec![Value::from("glaze")]);
    assert_eq!(fixture.database.row_count("person")?, 1);
    Ok(())
}

#[test]
fn test_base_relations_round_trip_on_every_strategy() -> Result<()> {
    for policy in [single_table(), joined_tables(), table_per_class()] {
        let mut fixture = Fixture::new();
        let persister = fixture.build(&furnished(policy), "Shape")?;
        furnished_round_trip(&fixture, persister.as_ref())?;
    }
    Ok(())
}

#[test]
fn test_shared_relation_table_on_table_per_class_is_rejected() {
    let catalog = ConfigurationCatalog::new().with(entity("Part").property(text("label"))).with(
        entity("Shape")
            .property(text("name"))
            .one_to_many(OneToManyRelation::new("parts", "Part").association_table("shape_parts"))
            .polymorphism(table_per_class()),
    );
    let mut fixture = Fixture::new();

    let err = fixture.build(&catalog, "Shape").unwrap_err();
    assert!(matches!(err, MappingError::InvalidConfiguration(_)));
    assert!(fixture.registry.is_empty());
    assert!(fixture.registry.schema().table_names().is_empty());
}
