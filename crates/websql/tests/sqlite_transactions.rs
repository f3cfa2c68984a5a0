use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use websql::prelude::*;
use websql::{QueryErrorKind, TransactionErrorKind};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Err(e) => e,
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

async fn open_with_items(cx: &Cx, options: ConnectionOptions) -> Connection {
    let conn = Connection::create(options).expect("open websql db");
    unwrap_outcome(
        conn.query(
            cx,
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
            &[],
        )
        .await,
    );
    conn
}

async fn item_count(cx: &Cx, conn: &Connection) -> i64 {
    let result = unwrap_outcome(conn.query(cx, "SELECT count(*) AS n FROM items", &[]).await)
        .expect("count produces a row");
    result.first().unwrap().get_named::<i64>("n").unwrap()
}

#[test]
fn committed_body_keeps_every_statement() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("commit")).await;

        let ids = unwrap_outcome(
            conn.transaction(&cx, |tx| async move {
                let mut ids = Vec::new();
                for name in ["a", "b", "c"] {
                    let result = tx
                        .query("INSERT INTO items (name) VALUES (?)", &[name.into()])
                        .await?
                        .expect("insert produces a result");
                    ids.push(result.insert_id.expect("insert id"));
                }
                let count = tx
                    .query("SELECT count(*) AS n FROM items", &[])
                    .await?
                    .expect("count produces a row");
                assert_eq!(count.first().unwrap().get_named::<i64>("n")?, 3);
                Ok::<_, Error>(ids)
            })
            .await,
        );

        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(item_count(&cx, &conn).await, 3);
        assert!(!conn.is_busy());
    });
}

#[test]
fn body_error_discards_earlier_statements() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("forced")).await;

        let err = expect_err(
            conn.transaction(&cx, |tx| async move {
                tx.query("INSERT INTO items (name) VALUES (?)", &["a".into()])
                    .await?;
                tx.query("INSERT INTO items (name) VALUES (?)", &["b".into()])
                    .await?;
                Err::<(), _>(Error::custom("body gave up"))
            })
            .await,
        );

        assert!(matches!(err, Error::Custom(ref msg) if msg == "body gave up"));
        assert_eq!(item_count(&cx, &conn).await, 0);
    });
}

#[test]
fn body_error_before_any_statement_rolls_back() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("early")).await;

        let err = expect_err(
            conn.transaction(&cx, |_tx| async move { Err::<(), _>(Error::custom("nope")) })
                .await,
        );
        assert_eq!(err.to_string(), "nope");

        // The connection stays usable.
        unwrap_outcome(
            conn.query(&cx, "INSERT INTO items (name) VALUES (?)", &["after".into()])
                .await,
        );
        assert_eq!(item_count(&cx, &conn).await, 1);
    });
}

#[test]
fn native_abort_discards_earlier_statements() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn =
            open_with_items(&cx, ConnectionOptions::new("native").with_native_abort(true)).await;

        let err = expect_err(
            conn.transaction(&cx, |tx| async move {
                tx.query("INSERT INTO items (name) VALUES (?)", &["a".into()])
                    .await?;
                Err::<(), _>(Error::custom("native abort"))
            })
            .await,
        );

        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(item_count(&cx, &conn).await, 0);
    });
}

#[test]
fn failing_statement_reports_engine_error() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("constraint")).await;

        let err = expect_err(
            conn.transaction(&cx, |tx| async move {
                tx.query("INSERT INTO items (name) VALUES (?)", &["dup".into()])
                    .await?;
                tx.query("INSERT INTO items (name) VALUES (?)", &["dup".into()])
                    .await?;
                Ok::<_, Error>(())
            })
            .await,
        );

        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::Constraint));
        assert_eq!(item_count(&cx, &conn).await, 0);
    });
}

#[test]
fn swallowed_statement_error_still_aborts() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("swallowed")).await;

        let err = expect_err(
            conn.transaction(&cx, |tx| async move {
                tx.query("INSERT INTO items (name) VALUES (?)", &["kept?".into()])
                    .await?;
                let failed = tx.query("INSERT INTO nowhere VALUES (1)", &[]).await;
                assert!(failed.is_err());
                Ok::<_, Error>(())
            })
            .await,
        );

        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::NotFound));
        assert_eq!(item_count(&cx, &conn).await, 0);
    });
}

#[test]
fn statements_after_a_failure_are_not_run() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("after-failure")).await;

        let err = expect_err(
            conn.transaction(&cx, |tx| async move {
                let _ = tx.query("INSERT INTO nowhere VALUES (1)", &[]).await;
                let late = tx
                    .query("INSERT INTO items (name) VALUES (?)", &["late".into()])
                    .await;
                assert!(late.is_err());
                late.map(|_| ())
            })
            .await,
        );

        // The first failure wins over the fallout.
        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::NotFound));
        assert_eq!(item_count(&cx, &conn).await, 0);
    });
}

#[test]
fn handle_expires_with_its_body() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("expired")).await;

        let handle = unwrap_outcome(
            conn.transaction(&cx, |tx| async move {
                tx.query("INSERT INTO items (name) VALUES (?)", &["a".into()])
                    .await?;
                assert!(tx.is_active());
                Ok::<_, Error>(tx)
            })
            .await,
        );

        assert!(!handle.is_active());
        let err = handle
            .query("INSERT INTO items (name) VALUES (?)", &["b".into()])
            .await
            .unwrap_err();
        assert!(err.is_transaction(TransactionErrorKind::HandleExpired));
        assert_eq!(item_count(&cx, &conn).await, 1);
    });
}

#[test]
fn body_waiting_on_foreign_future_is_incomplete() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("incomplete")).await;

        let err = expect_err(
            conn.transaction(&cx, |_tx| async move {
                std::future::pending::<()>().await;
                Ok::<_, Error>(())
            })
            .await,
        );
        assert!(err.is_transaction(TransactionErrorKind::BodyIncomplete));

        assert!(!conn.is_busy());
        assert_eq!(item_count(&cx, &conn).await, 0);
    });
}

#[test]
fn panicking_body_leaves_the_connection_usable() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = open_with_items(&cx, ConnectionOptions::new("panicked")).await;

        let err = expect_err(
            conn.transaction(&cx, |tx| async move {
                tx.query("INSERT INTO items (name) VALUES (?)", &["lost".into()])
                    .await?;
                if tx.is_active() {
                    panic!("body blew up");
                }
                Ok::<_, Error>(())
            })
            .await,
        );
        assert!(err.is_transaction(TransactionErrorKind::BodyPanicked));
        assert!(!conn.is_busy());

        let inserted = unwrap_outcome(
            conn.query(&cx, "INSERT INTO items (name) VALUES (?)", &["kept".into()])
                .await,
        )
        .expect("insert produces a result");
        assert_eq!(inserted.affected_rows, Some(1));
        assert_eq!(item_count(&cx, &conn).await, 1);
    });
}

#[test]
fn binary_values_inside_a_transaction() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = Connection::create(ConnectionOptions::new("tx-blob")).expect("open websql db");

        let blob = unwrap_outcome(
            conn.transaction(&cx, |tx| async move {
                tx.query("CREATE TABLE blobs (data)", &[]).await?;
                tx.query(
                    "INSERT INTO blobs (data) VALUES (?)",
                    &[Value::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF])],
                )
                .await?;
                let result = tx
                    .query("SELECT data FROM blobs", &[])
                    .await?
                    .expect("select produces a result");
                result.first().unwrap().get_named::<Vec<u8>>("data")
            })
            .await,
        );

        assert_eq!(blob, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    });
}
