use std::time::Duration;

use futures::TryStreamExt;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use crate::{
    bson::{doc, Bson, Document},
    options::FindOptions,
    sdam::ServerType,
    test::util::{address, client_options, mock_client, MockReply, MockServer},
    Client,
    Namespace,
};

const PRIMARY: &str = "a:27017";

fn setup() -> (MockServer, Client) {
    let mock = MockServer::new();
    let client = mock_client(
        &mock,
        client_options(&[PRIMARY]),
        &[(PRIMARY, ServerType::RsPrimary)],
    );
    (mock, client)
}

fn ns() -> Namespace {
    Namespace::new("db", "coll")
}

fn batch(range: std::ops::Range<i32>) -> Vec<Document> {
    range.map(|x| doc! { "x": x }).collect()
}

fn first_batch(id: i64, documents: Vec<Document>) -> Document {
    doc! { "ok": 1, "cursor": { "id": id, "ns": "db.coll", "firstBatch": documents } }
}

fn next_batch(id: i64, documents: Vec<Document>) -> Document {
    doc! { "ok": 1, "cursor": { "id": id, "ns": "db.coll", "nextBatch": documents } }
}

#[tokio::test]
async fn batches_are_fetched_until_exhausted() {
    let (mock, client) = setup();
    let cancel = CancellationToken::new();
    mock.reply(&address(PRIMARY), "find", first_batch(42, batch(0..2)));
    mock.reply(&address(PRIMARY), "getMore", next_batch(42, batch(2..4)));
    mock.reply(&address(PRIMARY), "getMore", next_batch(0, batch(4..5)));

    let options = FindOptions::builder().batch_size(2_u32).build();
    let mut cursor = client
        .find(ns(), doc! {}, options, None, &cancel)
        .await
        .unwrap();
    assert_eq!(cursor.id(), 42);

    let mut seen = Vec::new();
    while let Some(document) = cursor.next(&cancel).await.unwrap() {
        seen.push(document.get_i32("x").unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    assert!(cursor.is_exhausted());

    let find = &mock.received_named("find")[0];
    let get_mores = mock.received_named("getMore");
    assert_eq!(get_mores.len(), 2);
    assert_eq!(get_mores[0].body.get("getMore"), Some(&Bson::Int64(42)));
    assert_eq!(get_mores[0].body.get_str("collection").unwrap(), "coll");
    assert_eq!(get_mores[0].body.get_i32("batchSize").unwrap(), 2);
    assert_eq!(
        find.body.get_document("lsid").unwrap(),
        get_mores[0].body.get_document("lsid").unwrap()
    );

    drop(cursor);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(mock.received_named("killCursors").is_empty());
}

#[tokio::test]
async fn single_batch_cursor_never_contacts_the_server_again() {
    let (mock, client) = setup();
    let cancel = CancellationToken::new();
    mock.reply(&address(PRIMARY), "find", first_batch(0, batch(0..3)));

    let cursor = client.find(ns(), doc! {}, None, None, &cancel).await.unwrap();
    assert_eq!(cursor.id(), 0);
    let documents: Vec<Document> = cursor.into_stream().try_collect().await.unwrap();
    assert_eq!(documents, batch(0..3));
    assert_eq!(mock.received().len(), 1);
}

#[tokio::test]
async fn stream_follows_get_more() {
    let (mock, client) = setup();
    let cancel = CancellationToken::new();
    mock.reply(&address(PRIMARY), "find", first_batch(7, batch(0..1)));
    mock.reply(&address(PRIMARY), "getMore", next_batch(0, batch(1..3)));

    let cursor = client.find(ns(), doc! {}, None, None, &cancel).await.unwrap();
    let documents: Vec<Document> = cursor.into_stream().try_collect().await.unwrap();
    assert_eq!(documents, batch(0..3));
}

#[tokio::test]
async fn close_kills_the_server_cursor() {
    let (mock, client) = setup();
    let cancel = CancellationToken::new();
    mock.reply(&address(PRIMARY), "find", first_batch(42, batch(0..2)));

    let cursor = client.find(ns(), doc! {}, None, None, &cancel).await.unwrap();
    cursor.close(&cancel).await.unwrap();

    let kills = mock.received_named("killCursors");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].body.get_str("killCursors").unwrap(), "coll");
    assert_eq!(
        kills[0].body.get_array("cursors").unwrap(),
        &vec![Bson::Int64(42)]
    );
}

#[tokio::test]
async fn dropped_cursor_is_killed_in_the_background() {
    let (mock, client) = setup();
    let cancel = CancellationToken::new();
    mock.reply(&address(PRIMARY), "find", first_batch(42, batch(0..2)));

    let mut cursor = client.find(ns(), doc! {}, None, None, &cancel).await.unwrap();
    cursor.next(&cancel).await.unwrap();
    drop(cursor);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let kills = mock.received_named("killCursors");
    assert_eq!(kills.len(), 1);
    assert_eq!(
        kills[0].body.get_array("cursors").unwrap(),
        &vec![Bson::Int64(42)]
    );
}

#[tokio::test]
async fn network_error_on_get_more_exhausts_the_cursor() {
    let (mock, client) = setup();
    let cancel = CancellationToken::new();
    mock.reply(&address(PRIMARY), "find", first_batch(42, Vec::new()));
    mock.reply(&address(PRIMARY), "getMore", MockReply::CloseConnection);

    let mut cursor = client.find(ns(), doc! {}, None, None, &cancel).await.unwrap();
    let error = cursor.next(&cancel).await.unwrap_err();
    assert!(error.is_network_error());
    assert_eq!(mock.received_named("getMore").len(), 1);
    assert!(cursor.is_exhausted());
    assert!(cursor.next(&cancel).await.unwrap().is_none());

    drop(cursor);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(mock.received_named("killCursors").is_empty());
}
