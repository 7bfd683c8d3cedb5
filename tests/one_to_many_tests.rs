mod common;

use common::{Fixture, entity, text};
use relmap::prelude::advanced::OperationContext;
use relmap::prelude::*;

fn playlists(mode: RelationMode) -> ConfigurationCatalog {
    ConfigurationCatalog::new()
        .with(entity("Track").property(text("title")))
        .with(
            entity("Playlist")
                .property(text("name"))
                .one_to_many(OneToManyRelation::new("tracks", "Track").mapped_by("playlist").list().mode(mode)),
        )
}

fn track(id: i64, title: &str) -> EntityRef {
    Instance::new("Track").with("id", id).with("title", title).into_ref()
}

fn playlist(tracks: Vec<EntityRef>) -> EntityRef {
    Instance::new("Playlist")
        .with("id", 1)
        .with("name", "morning")
        .with_collection("tracks", tracks)
        .into_ref()
}

fn titles(entity: &EntityRef) -> Vec<Value> {
    entity.collection("tracks").iter().map(|t| t.get("title")).collect()
}

#[test]
fn test_members_receive_owner_key_and_position() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::All), "Playlist")?;

    persister.insert(&[playlist(vec![track(1, "intro"), track(2, "outro")])])?;

    assert_eq!(fixture.tables_written(), vec!["playlist".to_string(), "track".to_string()]);
    assert_eq!(
        fixture.database.column_values("track", "playlist_id")?,
        vec![Value::from(1), Value::from(1)]
    );
    assert_eq!(fixture.database.column_values("track", "idx")?, vec![Value::from(0), Value::from(1)]);

    let loaded = persister.select_one(Value::from(1))?.expect("playlist 1");
    assert_eq!(titles(&loaded), vec![Value::from("intro"), Value::from("outro")]);
    let first = &loaded.collection("tracks")[0];
    assert!(first.reference("playlist").is_some_and(|p| p.ptr_eq(&loaded)));
    Ok(())
}

#[test]
fn test_reordered_list_is_read_back_in_new_order() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::All), "Playlist")?;

    let (intro, outro) = (track(1, "intro"), track(2, "outro"));
    let playlist = playlist(vec![intro.clone(), outro.clone()]);
    persister.insert(&[playlist.clone()])?;

    // 1. Swap the two tracks
    playlist.set_collection("tracks", vec![outro, intro]);
    persister.update(&[playlist])?;

    // 2. Positions were rewritten, nothing was inserted or deleted
    assert_eq!(fixture.count_on("track", StatementKind::Insert), 1);
    assert_eq!(fixture.count_on("track", StatementKind::Delete), 0);
    let loaded = persister.select_one(Value::from(1))?.expect("playlist 1");
    assert_eq!(titles(&loaded), vec![Value::from("outro"), Value::from("intro")]);
    Ok(())
}

#[test]
fn test_removed_member_is_detached_without_orphan_removal() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::All), "Playlist")?;

    let (intro, outro) = (track(1, "intro"), track(2, "outro"));
    let playlist = playlist(vec![intro, outro.clone()]);
    persister.insert(&[playlist.clone()])?;

    playlist.set_collection("tracks", vec![outro]);
    persister.update(&[playlist])?;

    assert_eq!(fixture.database.row_count("track")?, 2);
    assert_eq!(
        fixture.database.column_values("track", "playlist_id")?,
        vec![Value::Null, Value::from(1)]
    );
    let loaded = persister.select_one(Value::from(1))?.expect("playlist 1");
    assert_eq!(titles(&loaded), vec![Value::from("outro")]);
    Ok(())
}

#[test]
fn test_removed_member_is_deleted_with_orphan_removal() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::AllOrphanRemoval), "Playlist")?;

    let (intro, outro) = (track(1, "intro"), track(2, "outro"));
    let playlist = playlist(vec![intro, outro.clone()]);
    persister.insert(&[playlist.clone()])?;

    playlist.set_collection("tracks", vec![outro]);
    persister.update(&[playlist])?;

    assert_eq!(fixture.database.column_values("track", "id")?, vec![Value::from(2)]);
    Ok(())
}

#[test]
fn test_member_moved_between_owners_survives_orphan_removal() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::AllOrphanRemoval), "Playlist")?;

    // 1. Two playlists, the second one a single track
    let (intro, outro) = (track(1, "intro"), track(2, "outro"));
    let morning = playlist(vec![intro.clone(), outro.clone()]);
    let evening = Instance::new("Playlist")
        .with("id", 2)
        .with("name", "evening")
        .with_collection("tracks", vec![track(3, "bonus")])
        .into_ref();
    persister.insert(&[morning.clone(), evening.clone()])?;

    // 2. The intro moves to the evening in the same batch
    morning.set_collection("tracks", vec![outro]);
    let mut evening_tracks = evening.collection("tracks");
    evening_tracks.push(intro);
    evening.set_collection("tracks", evening_tracks);
    persister.update(&[morning, evening])?;

    // 3. No track is deleted, the intro now belongs to the evening
    assert_eq!(
        common::sorted(fixture.database.column_values("track", "id")?),
        vec![Value::from(1), Value::from(2), Value::from(3)]
    );
    let evening = persister.select_one(Value::from(2))?.expect("playlist 2");
    assert_eq!(titles(&evening), vec![Value::from("bonus"), Value::from("intro")]);
    let morning = persister.select_one(Value::from(1))?.expect("playlist 1");
    assert_eq!(titles(&morning), vec![Value::from("outro")]);
    Ok(())
}

#[test]
fn test_new_member_is_inserted_on_update() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::All), "Playlist")?;

    let intro = track(1, "intro");
    let playlist = playlist(vec![intro.clone()]);
    persister.insert(&[playlist.clone()])?;

    playlist.set_collection("tracks", vec![intro, track(3, "bonus")]);
    persister.update(&[playlist])?;

    assert_eq!(fixture.database.column_values("track", "idx")?, vec![Value::from(0), Value::from(1)]);
    assert_eq!(
        fixture.database.column_values("track", "playlist_id")?,
        vec![Value::from(1), Value::from(1)]
    );
    Ok(())
}

#[test]
fn test_deleting_owner_detaches_or_deletes_members() -> Result<()> {
    // 1. Without orphan removal the tracks stay, unowned
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::All), "Playlist")?;
    let playlist1 = playlist(vec![track(1, "intro"), track(2, "outro")]);
    persister.insert(&[playlist1.clone()])?;
    persister.delete(&[playlist1])?;
    assert_eq!(fixture.database.row_count("playlist")?, 0);
    assert_eq!(fixture.database.column_values("track", "playlist_id")?, vec![Value::Null, Value::Null]);

    // 2. With orphan removal they go away with their playlist
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::AllOrphanRemoval), "Playlist")?;
    let playlist2 = playlist(vec![track(1, "intro"), track(2, "outro")]);
    persister.insert(&[playlist2.clone()])?;
    persister.delete(&[playlist2])?;
    assert_eq!(fixture.database.row_count("track")?, 0);
    Ok(())
}

#[test]
fn test_mandatory_collection_must_be_set() -> Result<()> {
    let catalog = ConfigurationCatalog::new().with(entity("Track")).with(
        entity("Album").one_to_many(OneToManyRelation::new("tracks", "Track").mapped_by("album").mandatory()),
    );
    let mut fixture = Fixture::new();
    let persister = fixture.build(&catalog, "Album")?;

    let err = persister.insert(&[Instance::new("Album").with("id", 1).into_ref()]).unwrap_err();
    assert!(matches!(err, MappingError::RelationMandatoryViolation { .. }));
    assert_eq!(fixture.database.statement_count(), 0);

    // an empty collection is set
    persister.insert(&[Instance::new("Album").with("id", 1).with_collection("tracks", vec![]).into_ref()])?;
    assert_eq!(fixture.database.row_count("album")?, 1);
    Ok(())
}

fn authors(mode: RelationMode) -> ConfigurationCatalog {
    ConfigurationCatalog::new()
        .with(entity("Book").property(text("title")))
        .with(
            entity("Author")
                .property(text("name"))
                .one_to_many(OneToManyRelation::new("books", "Book").mode(mode)),
        )
}

fn book(id: i64, title: &str) -> EntityRef {
    Instance::new("Book").with("id", id).with("title", title).into_ref()
}

fn author(books: Vec<EntityRef>) -> EntityRef {
    Instance::new("Author")
        .with("id", 1)
        .with("name", "ursula")
        .with_collection("books", books)
        .into_ref()
}

#[test]
fn test_association_rows_link_owner_and_members() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&authors(RelationMode::All), "Author")?;

    persister.insert(&[author(vec![book(1, "earthsea"), book(2, "dispossessed")])])?;

    assert_eq!(
        fixture.tables_written(),
        vec!["author".to_string(), "book".to_string(), "author_books".to_string()]
    );
    assert_eq!(fixture.database.row_count("author_books")?, 2);
    assert_eq!(
        common::sorted(fixture.database.column_values("author_books", "book_id")?),
        vec![Value::from(1), Value::from(2)]
    );

    let loaded = persister.select_one(Value::from(1))?.expect("author 1");
    let mut titles: Vec<Value> = loaded.collection("books").iter().map(|b| b.get("title")).collect();
    titles = common::sorted(titles);
    assert_eq!(titles, vec![Value::from("dispossessed"), Value::from("earthsea")]);
    Ok(())
}

#[test]
fn test_association_only_mode_never_writes_members() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&authors(RelationMode::AssociationOnly), "Author")?;
    let books = fixture.persister("Book")?;

    let (earthsea, dispossessed) = (book(1, "earthsea"), book(2, "dispossessed"));
    books.insert(&[earthsea.clone(), dispossessed.clone()])?;
    fixture.database.clear_log();

    // 1. Insert links the existing books
    let author = author(vec![earthsea.clone(), dispossessed.clone()]);
    persister.insert(&[author.clone()])?;
    assert_eq!(fixture.count_on("author_books", StatementKind::Insert), 1);

    // 2. Update relinks but never touches the book rows
    earthsea.set("title", "a wizard of earthsea");
    author.set_collection("books", vec![earthsea]);
    persister.update(&[author.clone()])?;
    assert_eq!(fixture.database.row_count("author_books")?, 1);

    // 3. Delete removes the links only
    persister.delete(&[author])?;
    assert_eq!(fixture.database.row_count("author_books")?, 0);
    assert_eq!(fixture.database.row_count("book")?, 2);
    assert!(!fixture.tables_written().iter().any(|table| table == "book"));
    assert_eq!(
        common::sorted(fixture.database.column_values("book", "title")?),
        vec![Value::from("dispossessed"), Value::from("earthsea")]
    );
    Ok(())
}

#[test]
fn test_deleting_association_owner() -> Result<()> {
    // 1. Without orphan removal the books survive their author
    let mut fixture = Fixture::new();
    let persister = fixture.build(&authors(RelationMode::All), "Author")?;
    let author1 = author(vec![book(1, "earthsea"), book(2, "dispossessed")]);
    persister.insert(&[author1.clone()])?;
    persister.delete(&[author1])?;
    assert_eq!(fixture.database.row_count("author_books")?, 0);
    assert_eq!(fixture.database.row_count("book")?, 2);

    // 2. With orphan removal they are deleted after their links
    let mut fixture = Fixture::new();
    let persister = fixture.build(&authors(RelationMode::AllOrphanRemoval), "Author")?;
    let author2 = author(vec![book(1, "earthsea"), book(2, "dispossessed")]);
    persister.insert(&[author2.clone()])?;
    persister.delete(&[author2])?;
    assert_eq!(fixture.database.row_count("author_books")?, 0);
    assert_eq!(fixture.database.row_count("book")?, 0);
    Ok(())
}

#[test]
fn test_association_list_keeps_positions() -> Result<()> {
    let catalog = ConfigurationCatalog::new()
        .with(entity("Book").property(text("title")))
        .with(entity("Shelf").one_to_many(OneToManyRelation::new("books", "Book").list().association_table("shelf_slots")));
    let mut fixture = Fixture::new();
    let persister = fixture.build(&catalog, "Shelf")?;

    let (a, b) = (book(1, "a"), book(2, "b"));
    let shelf = Instance::new("Shelf")
        .with("id", 1)
        .with_collection("books", vec![a.clone(), b.clone()])
        .into_ref();
    persister.insert(&[shelf.clone()])?;

    shelf.set_collection("books", vec![b, a]);
    persister.update(&[shelf])?;

    let loaded = persister.select_one(Value::from(1))?.expect("shelf 1");
    let titles: Vec<Value> = loaded.collection("books").iter().map(|b| b.get("title")).collect();
    assert_eq!(titles, vec![Value::from("b"), Value::from("a")]);
    assert_eq!(fixture.database.row_count("shelf_slots")?, 2);
    Ok(())
}

#[test]
fn test_failed_cascade_leaves_no_provided_keys() -> Result<()> {
    let mut fixture = Fixture::new();
    let persister = fixture.build(&playlists(RelationMode::All), "Playlist")?;
    fixture.persister("Track")?.insert(&[track(5, "taken")])?;

    // the member insert hits the key of the stored track
    let mut ctx = OperationContext::new();
    let err = persister
        .insert_with(&[playlist(vec![track(5, "again")])], &mut ctx)
        .unwrap_err();
    assert!(matches!(err, MappingError::ConstraintViolation(_)));
    assert_eq!(ctx.provided_count(), 0);
    Ok(())
}
