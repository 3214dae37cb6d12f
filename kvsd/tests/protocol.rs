//! Dispatcher end-to-end tests: input line in, response line out,
//! against a real shared heap and gate.

use kvsd::{Command, CommandTable, Server, command, storage};
use kvsd_common::ServerConfig;
use tempfile::TempDir;

fn test_server(dir: &TempDir) -> (Server, CommandTable) {
    let config = ServerConfig {
        storage_file: dir.path().join("data.csv"),
        web_root: dir.path().to_path_buf(),
        initial_storage_entries: 32,
        initial_storage_bytes: 64 * 1024,
        snapshot_interval_secs: 0,
        ..ServerConfig::default()
    };
    let table = Server::build_command_table(&config).expect("command table");
    let server = Server::initialize(config).expect("server init");
    (server, table)
}

fn roundtrip(server: &mut Server, table: &CommandTable, line: &str) -> String {
    let mut cmd = Command::new();
    command::parse_input(table, &mut cmd, line);
    command::execute(table, server, &mut cmd);
    command::format_response(table, &cmd)
}

#[test]
fn put_get_overwrite_delete_lifecycle() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    assert_eq!(
        roundtrip(&mut server, &table, "PUT foo 1"),
        "PUT:foo:1:record_new\r\n"
    );
    assert_eq!(roundtrip(&mut server, &table, "GET foo"), "GET:foo:1\r\n");
    assert_eq!(
        roundtrip(&mut server, &table, "PUT foo 2"),
        "PUT:foo:2:record_overwritten\r\n"
    );
    assert_eq!(roundtrip(&mut server, &table, "GET foo"), "GET:foo:2\r\n");
    assert_eq!(
        roundtrip(&mut server, &table, "DEL foo"),
        "DEL:foo:key_deleted\r\n"
    );
    assert_eq!(
        roundtrip(&mut server, &table, "GET foo"),
        "GET:foo:key_nonexistent\r\n"
    );

    server.teardown();
}

#[test]
fn wildcard_get_returns_every_match() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    roundtrip(&mut server, &table, "PUT apple 1");
    roundtrip(&mut server, &table, "PUT apricot 2");
    roundtrip(&mut server, &table, "PUT banana 3");

    let response = roundtrip(&mut server, &table, "GET ap*");
    let mut lines: Vec<&str> = response.split("\r\n").filter(|l| !l.is_empty()).collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["GET:apple:1", "GET:apricot:2"]);

    let response = roundtrip(&mut server, &table, "GET ?anana");
    assert_eq!(response, "GET:banana:3\r\n");

    server.teardown();
}

#[test]
fn wildcard_del_removes_every_match() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    roundtrip(&mut server, &table, "PUT apple 1");
    roundtrip(&mut server, &table, "PUT apricot 2");
    roundtrip(&mut server, &table, "PUT banana 3");

    let response = roundtrip(&mut server, &table, "DEL ap*");
    let mut lines: Vec<&str> = response.split("\r\n").filter(|l| !l.is_empty()).collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["DEL:apple:key_deleted", "DEL:apricot:key_deleted"]);

    assert_eq!(roundtrip(&mut server, &table, "COUNT"), "COUNT:1\r\n");
    assert_eq!(
        roundtrip(&mut server, &table, "DEL ap*"),
        "DEL:ap*:key_nonexistent\r\n"
    );

    server.teardown();
}

#[test]
fn missing_arguments_are_reported() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    assert_eq!(
        roundtrip(&mut server, &table, "GET"),
        "GET:argument_missing\r\n"
    );
    assert_eq!(
        roundtrip(&mut server, &table, "PUT lonely"),
        "PUT:lonely:argument_missing\r\n"
    );

    server.teardown();
}

#[test]
fn unknown_commands_get_the_overview() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    assert_eq!(
        roundtrip(&mut server, &table, "FOO"),
        "SUPPORTED_COMMANDS: GET, PUT, DEL, BEG, END, SUB, OP, QUIT, COUNT\r\n"
    );

    server.teardown();
}

#[test]
fn key_symbol_policy_is_per_command() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    // PUT forbids wildcards, GET allows them.
    assert_eq!(
        roundtrip(&mut server, &table, "PUT ap* 1"),
        "PUT:ap*:1:argument_bad_symbol\r\n"
    );
    assert_eq!(
        roundtrip(&mut server, &table, "PUT k,v 1"),
        "PUT:k,v:1:argument_bad_symbol\r\n"
    );
    assert_eq!(
        roundtrip(&mut server, &table, "GET ap*"),
        "GET:ap*:key_nonexistent\r\n"
    );

    server.teardown();
}

#[test]
fn oversized_arguments_are_rejected() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    let long_key = "k".repeat(65);
    let response = roundtrip(&mut server, &table, &format!("PUT {long_key} 1"));
    assert!(response.ends_with(":argument_too_long\r\n"));

    // Exactly at the limits is fine.
    let max_key = "k".repeat(64);
    let max_value = "v".repeat(256);
    let response = roundtrip(&mut server, &table, &format!("PUT {max_key} {max_value}"));
    assert!(response.ends_with(":record_new\r\n"));

    let over_value = "v".repeat(257);
    let response = roundtrip(&mut server, &table, &format!("PUT key {over_value}"));
    assert!(response.ends_with(":argument_too_long\r\n"));

    server.teardown();
}

#[test]
fn exclusive_mode_latch_messages() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    assert_eq!(roundtrip(&mut server, &table, "BEG"), "BEG:locked\r\n");
    assert_eq!(
        roundtrip(&mut server, &table, "BEG"),
        "BEG:already_locked\r\n"
    );

    // Storage operations from the lock holder proceed.
    assert_eq!(
        roundtrip(&mut server, &table, "PUT x 1"),
        "PUT:x:1:record_new\r\n"
    );
    assert_eq!(roundtrip(&mut server, &table, "GET x"), "GET:x:1\r\n");

    assert_eq!(roundtrip(&mut server, &table, "END"), "END:unlocked\r\n");
    assert_eq!(roundtrip(&mut server, &table, "END"), "END:not_locked\r\n");

    server.teardown();
}

#[test]
fn quit_says_goodbye() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    assert_eq!(roundtrip(&mut server, &table, "QUIT"), "QUIT:goodbye\r\n");

    server.teardown();
}

#[test]
fn sub_requires_an_existing_key() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    assert_eq!(
        roundtrip(&mut server, &table, "SUB ghost"),
        "SUB:ghost:key_nonexistent\r\n"
    );

    server.teardown();
}

#[test]
fn op_pipes_the_record_through_a_program() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    roundtrip(&mut server, &table, "PUT calc 5");
    assert_eq!(
        roundtrip(&mut server, &table, "OP calc cat"),
        "OP:calc:cat:op_successful\r\n"
    );
    assert_eq!(roundtrip(&mut server, &table, "GET calc"), "GET:calc:5\r\n");

    assert_eq!(
        roundtrip(&mut server, &table, "OP calc false"),
        "OP:calc:false:op_failed\r\n"
    );

    server.teardown();
}

#[test]
fn count_tracks_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let (mut server, table) = test_server(&dir);

    assert_eq!(roundtrip(&mut server, &table, "COUNT"), "COUNT:0\r\n");
    for i in 0..5 {
        roundtrip(&mut server, &table, &format!("PUT key{i} {i}"));
    }
    assert_eq!(roundtrip(&mut server, &table, "COUNT"), "COUNT:5\r\n");

    // Overwriting does not change the count.
    roundtrip(&mut server, &table, "PUT key0 changed");
    assert_eq!(roundtrip(&mut server, &table, "COUNT"), "COUNT:5\r\n");

    server.teardown();
}

#[test]
fn snapshot_survives_a_restart() {
    let dir = TempDir::new().unwrap();

    let (mut server, table) = test_server(&dir);
    roundtrip(&mut server, &table, "PUT foo 1");
    roundtrip(&mut server, &table, "PUT bar some words");
    storage::save_snapshot(&mut server).unwrap();

    let written = std::fs::read_to_string(dir.path().join("data.csv")).unwrap();
    let mut lines: Vec<&str> = written.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["bar,some words", "foo,1"]);

    // Teardown rewrites the final snapshot; the next instance loads it.
    server.teardown();

    let (mut revived, table) = test_server(&dir);
    assert_eq!(roundtrip(&mut revived, &table, "GET foo"), "GET:foo:1\r\n");
    assert_eq!(
        roundtrip(&mut revived, &table, "GET bar"),
        "GET:bar:some words\r\n"
    );
    revived.teardown();
}

#[test]
fn malformed_snapshot_lines_are_skipped() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("data.csv"),
        "good,value\nno comma here\n,emptykey\nalso,fine\n",
    )
    .unwrap();

    let (mut server, table) = test_server(&dir);
    assert_eq!(roundtrip(&mut server, &table, "COUNT"), "COUNT:2\r\n");
    assert_eq!(
        roundtrip(&mut server, &table, "GET good"),
        "GET:good:value\r\n"
    );

    server.teardown();
}
