mod common;

use common::{people_csv, Faults, Fixture, FlakyStore, DATABASE};
use graphload::query::{ThingPattern, Value, Var};
use graphload::store::StoreError;
use graphload::{BulkLoader, LoadOptions, LoaderError};
use serde_json::{json, Value as Json};

fn options(allow_multi_insert: bool) -> LoadOptions {
    LoadOptions {
        database: DATABASE.to_string(),
        allow_multi_insert,
    }
}

fn global(workers: usize, rows_per_commit: usize) -> Json {
    json!({
        "schema": "schema.gql",
        "separator": ",",
        "rowsPerCommit": rows_per_commit,
        "parallelisation": workers,
        "retry": {"initialDelayMs": 1, "maxDelayMs": 4, "maxAttempts": 5}
    })
}

fn people_unit(file: &str) -> Json {
    json!({
        "data": [file],
        "insert": {
            "entity": "person",
            "ownerships": [
                {"attribute": "phone-number", "column": "phone", "required": true},
                {"attribute": "name", "column": "name"},
                {"attribute": "age", "column": "age"}
            ]
        }
    })
}

fn calls_unit() -> Json {
    json!({
        "data": ["calls.csv"],
        "insert": {
            "relation": "call",
            "ownerships": [{"attribute": "duration", "column": "duration"}],
            "players": [
                {"role": "caller", "required": true, "match": {"type": "person",
                    "ownerships": [{"attribute": "phone-number", "column": "caller", "required": true}]}},
                {"role": "callee", "required": true, "match": {"type": "person",
                    "ownerships": [{"attribute": "phone-number", "column": "callee", "required": true}]}}
            ]
        }
    })
}

fn person_with(attribute: &str, value: &str) -> Vec<ThingPattern> {
    vec![ThingPattern::isa(Var::new("p"), "person").with_has(attribute, Value::String(value.into()))]
}

#[test]
fn test_rows_commit_in_batches_independent_of_workers() {
    for workers in [1, 4] {
        let fx = Fixture::new();
        fx.write("people.csv", &people_csv(120));
        let config = fx.config(&json!({
            "globalConfig": global(workers, 50),
            "entities": {"person": people_unit("people.csv")}
        }));
        let store = fx.store();
        let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

        assert_eq!(store.commit_count(DATABASE).unwrap(), 3, "workers = {}", workers);
        assert_eq!(summary.transactions, 3);
        assert_eq!(summary.rows_read, 120);
        assert_eq!(summary.rows_committed, 120);
        assert_eq!(store.count_instances(DATABASE, "person").unwrap(), 120);
        assert!(summary.failed_units.is_empty());
    }
}

#[test]
fn test_relations_load_after_their_players() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(40));
    let mut calls = String::from("caller,callee,duration\n");
    for i in 1..=200 {
        calls.push_str(&format!("+{},+{},{}\n", i % 40 + 1, (i + 7) % 40 + 1, i));
    }
    fx.write("calls.csv", &calls);
    let config = fx.config(&json!({
        "globalConfig": global(4, 7),
        "entities": {"person": people_unit("people.csv")},
        "relations": {"call": calls_unit()}
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.invalid, 0, "{}", fx.row_log("calls.csv_invalid.log"));
    assert_eq!(store.count_instances(DATABASE, "call").unwrap(), 200);
    assert_eq!(summary.rows_committed, 240);
}

#[test]
fn test_missing_required_player_goes_to_invalid_log() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(3));
    fx.write("calls.csv", "caller,callee,duration\n+1,+2,10\n+2,,11\n+3,+9,12\n");
    let config = fx.config(&json!({
        "globalConfig": global(2, 10),
        "entities": {"person": people_unit("people.csv")},
        "relations": {"call": calls_unit()}
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    // the second row lacks the callee, the third one matches no callee
    assert_eq!(summary.invalid, 2);
    assert_eq!(store.count_instances(DATABASE, "call").unwrap(), 1);
    let log = fx.row_log("calls.csv_invalid.log");
    assert!(log.contains("+2,,11"), "{}", log);
    assert!(log.contains("+3,+9,12"), "{}", log);
}

#[test]
fn test_fatal_store_error_stops_the_job() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(100));
    let config = fx.config(&json!({
        "globalConfig": global(1, 5),
        "entities": {"person": people_unit("people.csv")}
    }));
    let store = FlakyStore::new(
        fx.store(),
        Faults {
            reject_write: Some(10),
            ..Faults::default()
        },
    );
    let err = BulkLoader::new(config, options(false)).run(&store).unwrap_err();
    assert!(matches!(err, LoaderError::Store(StoreError::Rejected(_))), "{}", err);

    // only the batch before the failing row was committed, nothing after it was attempted
    assert_eq!(store.inner.commit_count(DATABASE).unwrap(), 1);
    assert_eq!(store.inner.count_instances(DATABASE, "person").unwrap(), 5);
    assert_eq!(store.faults.writes(), 10);
}

#[test]
fn test_fatal_error_with_parallel_writers_commits_whole_batches_only() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(100));
    let config = fx.config(&json!({
        "globalConfig": global(4, 5),
        "entities": {"person": people_unit("people.csv")}
    }));
    let store = FlakyStore::new(
        fx.store(),
        Faults {
            reject_write: Some(10),
            ..Faults::default()
        },
    );
    assert!(BulkLoader::new(config, options(false)).run(&store).is_err());

    let commits = store.inner.commit_count(DATABASE).unwrap() as usize;
    let people = store.inner.count_instances(DATABASE, "person").unwrap();
    assert_eq!(people, commits * 5);
    assert!(people < 100);
}

#[test]
fn test_plain_writes_drop_rows_on_contention() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(10));
    let config = fx.config(&json!({
        "globalConfig": global(1, 10),
        "entities": {"person": people_unit("people.csv")}
    }));
    let faults = Faults::default();
    faults.transient_writes.store(2, std::sync::atomic::Ordering::SeqCst);
    let store = FlakyStore::new(fx.store(), faults);
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.unavailable, 2);
    assert_eq!(summary.retries, 0);
    assert_eq!(store.inner.count_instances(DATABASE, "person").unwrap(), 8);
    let log = fx.row_log("people.csv_unavailable.log");
    assert_eq!(log.lines().collect::<Vec<_>>(), vec!["+1,Person 1,21", "+2,Person 2,22"]);
}

fn twitter_unit() -> Json {
    json!({
        "data": ["twitter.csv"],
        "match": {"type": "person", "ownerships": [
            {"attribute": "phone-number", "column": "phone", "required": true}]},
        "insert": {"ownerships": [
            {"attribute": "twitter-username", "column": "twitter", "required": true}]}
    })
}

#[test]
fn test_append_or_insert_takes_exactly_one_path() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(5));
    fx.write("twitter.csv", "phone,twitter\n+1,@one\n+2,@two\n+8,@eight\n+9,@nine\n");
    let config = fx.config(&json!({
        "globalConfig": global(2, 10),
        "entities": {"person": people_unit("people.csv")},
        "appendAttributeOrInsertThing": {"twitter": twitter_unit()}
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.invalid, 0);
    assert_eq!(summary.retries, 0);
    // +1 and +2 gained a handle, +8 and +9 were created
    assert_eq!(store.count_instances(DATABASE, "person").unwrap(), 7);
    for (phone, twitter) in [("+1", "@one"), ("+2", "@two"), ("+8", "@eight"), ("+9", "@nine")] {
        let patterns = vec![ThingPattern::isa(Var::new("p"), "person")
            .with_has("phone-number", Value::String(phone.into()))
            .with_has("twitter-username", Value::String(twitter.into()))];
        assert_eq!(store.count_answers(DATABASE, &patterns).unwrap(), 1, "{}", phone);
    }
    assert_eq!(store.count_answers(DATABASE, &person_with("name", "Person 1")).unwrap(), 1);
}

#[test]
fn test_append_or_insert_retry_on_contention() {
    let fx = Fixture::new();
    fx.write("twitter.csv", "phone,twitter\n+1,@one\n+2,@two\n");
    let config = fx.config(&json!({
        "globalConfig": global(1, 10),
        "appendAttributeOrInsertThing": {"twitter": twitter_unit()}
    }));
    let faults = Faults::default();
    faults.transient_commits.store(2, std::sync::atomic::Ordering::SeqCst);
    let store = FlakyStore::new(fx.store(), faults);
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.retries, 2);
    assert_eq!(summary.unavailable, 0);
    assert_eq!(summary.transactions, 1);
    assert_eq!(store.inner.count_instances(DATABASE, "person").unwrap(), 2);
    assert!(fx.row_log("twitter.csv_unavailable.log").is_empty());
}

#[test]
fn test_append_or_insert_gives_up_after_max_attempts() {
    let fx = Fixture::new();
    fx.write("twitter.csv", "phone,twitter\n+1,@one\n");
    let config = fx.config(&json!({
        "globalConfig": global(1, 10),
        "appendAttributeOrInsertThing": {"twitter": twitter_unit()}
    }));
    let faults = Faults::default();
    faults.transient_commits.store(100, std::sync::atomic::Ordering::SeqCst);
    let store = FlakyStore::new(fx.store(), faults);
    let err = BulkLoader::new(config, options(false)).run(&store).unwrap_err();
    assert!(matches!(err, LoaderError::Aborted(_)), "{}", err);
    assert_eq!(store.inner.count_instances(DATABASE, "person").unwrap(), 0);
}

#[test]
fn test_append_attribute_drops_unmatched_rows() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(2));
    fx.write("twitter.csv", "phone,twitter\n+1,@one\n+7,@seven\n");
    let config = fx.config(&json!({
        "globalConfig": global(2, 10),
        "entities": {"person": people_unit("people.csv")},
        "appendAttribute": {"twitter": twitter_unit()}
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.invalid, 1);
    assert_eq!(store.count_instances(DATABASE, "person").unwrap(), 2);
    assert_eq!(store.count_answers(DATABASE, &person_with("twitter-username", "@one")).unwrap(), 1);
    assert!(fx.row_log("twitter.csv_invalid.log").contains("+7,@seven"));
}

#[test]
fn test_ambiguous_matches_need_multi_insert() {
    for allow in [false, true] {
        let fx = Fixture::new();
        fx.write("people.csv", "phone,name,age\n+1,Jo,30\n+2,Jo,31\n");
        fx.write("nicks.csv", "name,twitter\nJo,@jo\n");
        let config = fx.config(&json!({
            "globalConfig": global(1, 10),
            "entities": {"person": people_unit("people.csv")},
            "appendAttribute": {"by-name": {
                "data": ["nicks.csv"],
                "match": {"type": "person", "ownerships": [{"attribute": "name", "column": "name"}]},
                "insert": {"ownerships": [{"attribute": "twitter-username", "column": "twitter"}]}
            }}
        }));
        let store = fx.store();
        let summary = BulkLoader::new(config, options(allow)).run(&store).unwrap();

        let tagged = store
            .count_answers(DATABASE, &person_with("twitter-username", "@jo"))
            .unwrap();
        if allow {
            assert_eq!(tagged, 2);
            assert_eq!(summary.invalid, 0);
        } else {
            assert_eq!(tagged, 0);
            assert_eq!(summary.invalid, 1);
        }
    }
}

#[test]
fn test_configuration_error_skips_only_that_unit() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(3));
    fx.write("other.csv", "mobile\n+5\n");
    let config = fx.config(&json!({
        "globalConfig": global(2, 10),
        "entities": {
            "person": people_unit("people.csv"),
            "broken": people_unit("other.csv")
        }
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.failed_units.len(), 1);
    assert!(summary.failed_units[0].starts_with("broken"), "{:?}", summary.failed_units);
    assert_eq!(store.count_instances(DATABASE, "person").unwrap(), 3);
}

#[test]
fn test_column_type_errors_do_not_drop_rows() {
    let fx = Fixture::new();
    fx.write("people.csv", "phone,name,age\n+1,Jo,old\n+2,Al,40\n");
    let config = fx.config(&json!({
        "globalConfig": global(1, 10),
        "entities": {"person": people_unit("people.csv")}
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.column_type_errors, 1);
    assert_eq!(summary.rows_committed, 2);
    let log = fx.row_log("people.csv_column_type.log");
    assert!(log.starts_with("line 2:"), "{}", log);
    assert!(log.contains("'old'"), "{}", log);
}

#[test]
fn test_gzip_and_list_separated_attributes() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let fx = Fixture::new();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"names\nAnn|Bob\nnull\nCid\n").unwrap();
    let bytes = encoder.finish().unwrap();
    std::fs::write(fx.dir.path().join("names.csv.gz"), bytes).unwrap();

    let config = fx.config(&json!({
        "globalConfig": global(1, 10),
        "attributes": {"names": {
            "data": ["names.csv.gz"],
            "insert": {"attribute": "name", "column": "names", "listSeparator": "|", "required": true}
        }}
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.rows_read, 3);
    assert_eq!(summary.invalid, 1);
    assert_eq!(store.count_instances(DATABASE, "name").unwrap(), 3);
}

#[test]
fn test_cancelled_job_reports_abort() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(10));
    let config = fx.config(&json!({
        "globalConfig": global(1, 5),
        "entities": {"person": people_unit("people.csv")}
    }));
    let store = fx.store();
    let loader = BulkLoader::new(config, options(false));
    loader.cancellation_token().cancel();
    let err = loader.run(&store).unwrap_err();
    assert!(matches!(err, LoaderError::Aborted(_)));
    assert_eq!(store.commit_count(DATABASE).unwrap(), 0);
}

#[test]
fn test_broken_quotes_are_retried_and_overlong_rows_are_malformed() {
    let fx = Fixture::new();
    fx.write("people.csv", "phone,name,age\n+1,Jo,30\n+2,\"Al,40\n+3,Cy,30,x\n");
    let config = fx.config(&json!({
        "globalConfig": global(1, 10),
        "entities": {"person": people_unit("people.csv")}
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    assert_eq!(summary.rows_read, 3);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.rows_committed, 2);
    assert_eq!(store.count_answers(DATABASE, &person_with("name", "Al")).unwrap(), 1);
    assert_eq!(fx.row_log("people.csv_malformed.log"), "+3,Cy,30,x\n");
}

#[test]
fn test_append_or_insert_without_values_never_duplicates_target() {
    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(2));
    fx.write("twitter.csv", "phone,twitter\n+1,\n+5,\n");
    let config = fx.config(&json!({
        "globalConfig": global(1, 10),
        "entities": {"person": people_unit("people.csv")},
        "appendAttributeOrInsertThing": {"twitter": {
            "data": ["twitter.csv"],
            "match": {"type": "person", "ownerships": [
                {"attribute": "phone-number", "column": "phone", "required": true}]},
            "insert": {"ownerships": [{"attribute": "twitter-username", "column": "twitter"}]}
        }}
    }));
    let store = fx.store();
    let summary = BulkLoader::new(config, options(false)).run(&store).unwrap();

    // +1 exists and has nothing to append, +5 is new and gets inserted
    assert_eq!(store.count_answers(DATABASE, &person_with("phone-number", "+1")).unwrap(), 1);
    assert_eq!(store.count_answers(DATABASE, &person_with("phone-number", "+5")).unwrap(), 1);
    assert_eq!(store.count_instances(DATABASE, "person").unwrap(), 3);
    assert_eq!(summary.invalid, 1);
    assert_eq!(fx.row_log("twitter.csv_invalid.log"), "+1,\n");
}

#[test]
fn test_writer_panic_aborts_the_job() {
    use std::sync::mpsc;
    use std::time::Duration;

    let fx = Fixture::new();
    fx.write("people.csv", &people_csv(100));
    let config = fx.config(&json!({
        "globalConfig": global(2, 5),
        "entities": {"person": people_unit("people.csv")}
    }));
    let store = FlakyStore::new(
        fx.store(),
        Faults {
            panic_write: Some(3),
            ..Faults::default()
        },
    );

    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = BulkLoader::new(config, options(false)).run(&store);
        let _ = done_tx.send(result.map(|_| ()));
        drop(fx);
    });
    let result = done_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("load did not return after a writer panic");
    assert!(matches!(result, Err(LoaderError::Aborted(_))), "{:?}", result);
}
