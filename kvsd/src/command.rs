//! Command table and dispatcher.
//!
//! Handlers register under an upper-cased name with a required argument
//! count and a key-symbol policy. An input line is parsed into a
//! [`Command`], validated against the matching entry and dispatched; the
//! formatter always produces a response line, falling back to the
//! overview of registered names for unknown commands.

use crate::server::Server;
use kvsd_common::consts::{KEY_MAX_LEN, VALUE_MAX_LEN};
use kvsd_common::protocol;

/// Handler invoked after validation. Returns `false` on internal
/// failure; the response message is emitted either way.
pub type CommandHandler = fn(&mut Server, &mut Command) -> bool;

/// One registered command.
pub struct CommandEntry {
    name: String,
    argc: usize,
    wildcard_key: bool,
    handler: CommandHandler,
}

impl CommandEntry {
    /// Upper-cased command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `?`/`*` are permitted in the key.
    pub fn wildcard_key(&self) -> bool {
        self.wildcard_key
    }
}

/// Process-global registry of commands, in registration order.
#[derive(Default)]
pub struct CommandTable {
    entries: Vec<CommandEntry>,
}

/// Per-connection command object.
#[derive(Debug, Default)]
pub struct Command {
    /// Upper-cased command name; empty for unknown commands.
    pub name: String,
    /// First argument.
    pub key: String,
    /// Remaining arguments, verbatim.
    pub value: String,
    /// Single-line response message.
    pub response_message: String,
    /// Multi-record response, one line each.
    pub response_records: Vec<ResponseRecord>,
}

/// One `key:value` pair of a multi-record response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    /// Record key.
    pub key: String,
    /// Record value.
    pub value: String,
}

impl Command {
    /// Fresh command object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to the response.
    pub fn push_record(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.response_records.push(ResponseRecord {
            key: key.into(),
            value: value.into(),
        });
    }

    fn reset(&mut self) {
        self.name.clear();
        self.key.clear();
        self.value.clear();
        self.response_message.clear();
        self.response_records.clear();
    }
}

impl CommandTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with `argc` required arguments.
    ///
    /// Names are normalized to upper case. Duplicate names and argument
    /// counts outside 0..=2 are rejected.
    pub fn register(
        &mut self,
        name: &str,
        argc: usize,
        wildcard_key: bool,
        handler: CommandHandler,
    ) -> Result<(), crate::error::ServerError> {
        debug_assert!(!name.is_empty(), "command name can't be empty");
        debug_assert!(argc <= 2, "only 0-2 arguments allowed");

        if name.is_empty() || argc > 2 {
            return Err(crate::error::ServerError::Registration(format!(
                "invalid registration of '{name}'"
            )));
        }
        let name = name.to_ascii_uppercase();
        if self.lookup(&name).is_some() {
            return Err(crate::error::ServerError::Registration(format!(
                "overlapping registration of '{name}'"
            )));
        }

        self.entries.push(CommandEntry {
            name,
            argc,
            wildcard_key,
            handler,
        });
        Ok(())
    }

    /// Entry registered under `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<&CommandEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// The `SUPPORTED_COMMANDS` overview in registration order.
    pub fn overview(&self) -> String {
        let names: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
        format!("{}{}", protocol::SUPPORTED_COMMANDS, names.join(", "))
    }
}

/// Split an input line into the command object.
///
/// The line is trimmed of ASCII whitespace; the first whitespace-
/// delimited word becomes the upper-cased name, the second the key and
/// the remainder the value. Unknown names clear the command so the
/// formatter emits the overview.
pub fn parse_input(table: &CommandTable, cmd: &mut Command, input: &str) {
    cmd.reset();

    let input = input.trim_matches(|c: char| c.is_ascii_whitespace());
    let mut parts = input.splitn(2, |c: char| c.is_ascii_whitespace());

    let name = parts.next().unwrap_or("").to_ascii_uppercase();
    if table.lookup(&name).is_none() {
        return;
    }
    cmd.name = name;

    let rest = parts
        .next()
        .unwrap_or("")
        .trim_start_matches(|c: char| c.is_ascii_whitespace());
    let mut parts = rest.splitn(2, |c: char| c.is_ascii_whitespace());
    cmd.key = parts.next().unwrap_or("").to_string();
    cmd.value = parts
        .next()
        .unwrap_or("")
        .trim_start_matches(|c: char| c.is_ascii_whitespace())
        .to_string();
}

fn charset_ok(text: &str, extra: &str) -> bool {
    text.chars()
        .all(|c| c.is_ascii_alphanumeric() || extra.contains(c))
}

/// Validate the command's arguments and invoke its handler.
///
/// Returns `false` without invoking a handler for unknown commands and
/// validation failures; the response message carries the reason.
pub fn execute(table: &CommandTable, server: &mut Server, cmd: &mut Command) -> bool {
    let Some(entry) = table.lookup(&cmd.name) else {
        return false;
    };

    let mut argc = 0;
    if !cmd.key.is_empty() {
        argc += 1;
    }
    if !cmd.value.is_empty() {
        argc += 1;
    }
    if argc < entry.argc {
        cmd.response_message = protocol::ARGUMENT_MISSING.to_string();
        return false;
    }

    let key_extra = if entry.wildcard_key { "?*" } else { "" };
    if !charset_ok(&cmd.key, key_extra) || !charset_ok(&cmd.value, " ") {
        cmd.response_message = protocol::ARGUMENT_BAD_SYMBOL.to_string();
        return false;
    }

    if cmd.key.len() > KEY_MAX_LEN || cmd.value.len() > VALUE_MAX_LEN {
        cmd.response_message = protocol::ARGUMENT_TOO_LONG.to_string();
        return false;
    }

    (entry.handler)(server, cmd)
}

/// One `NAME:key:value` response line.
pub fn record_line(name: &str, key: &str, value: &str) -> String {
    format!("{name}:{key}:{value}{}", protocol::CRLF)
}

/// Format the response for a processed command.
pub fn format_response(table: &CommandTable, cmd: &Command) -> String {
    if table.lookup(&cmd.name).is_none() {
        return format!("{}{}", table.overview(), protocol::CRLF);
    }

    if !cmd.response_records.is_empty() {
        let mut response = String::new();
        for record in &cmd.response_records {
            response.push_str(&record_line(&cmd.name, &record.key, &record.value));
        }
        return response;
    }

    let mut response = cmd.name.clone();
    for field in [&cmd.key, &cmd.value, &cmd.response_message] {
        if !field.is_empty() {
            response.push(':');
            response.push_str(field);
        }
    }
    response.push_str(protocol::CRLF);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Server, _: &mut Command) -> bool {
        true
    }

    fn echo_message(_: &mut Server, cmd: &mut Command) -> bool {
        cmd.response_message = "done".to_string();
        true
    }

    fn test_table() -> CommandTable {
        let mut table = CommandTable::new();
        table.register("GET", 1, true, noop).unwrap();
        table.register("put", 2, false, echo_message).unwrap();
        table.register("QUIT", 0, false, noop).unwrap();
        table
    }

    #[test]
    fn registration_normalizes_and_rejects_duplicates() {
        let mut table = test_table();
        assert!(table.lookup("PUT").is_some());
        assert!(table.lookup("put").is_none());
        assert!(table.register("GET", 1, true, noop).is_err());
        assert_eq!(
            table.overview(),
            "SUPPORTED_COMMANDS: GET, PUT, QUIT"
        );
    }

    #[test]
    fn parse_splits_name_key_value() {
        let table = test_table();
        let mut cmd = Command::new();

        parse_input(&table, &mut cmd, "  put foo some value here \r\n");
        assert_eq!(cmd.name, "PUT");
        assert_eq!(cmd.key, "foo");
        assert_eq!(cmd.value, "some value here");

        parse_input(&table, &mut cmd, "GET foo");
        assert_eq!(cmd.name, "GET");
        assert_eq!(cmd.key, "foo");
        assert_eq!(cmd.value, "");

        parse_input(&table, &mut cmd, "QUIT");
        assert_eq!(cmd.name, "QUIT");
        assert_eq!(cmd.key, "");
    }

    #[test]
    fn parse_clears_unknown_commands() {
        let table = test_table();
        let mut cmd = Command::new();
        cmd.key = "stale".to_string();

        parse_input(&table, &mut cmd, "FOO bar baz");
        assert_eq!(cmd.name, "");
        assert_eq!(cmd.key, "");
        assert_eq!(cmd.value, "");
    }

    #[test]
    fn unknown_command_formats_overview() {
        let table = test_table();
        let mut cmd = Command::new();
        parse_input(&table, &mut cmd, "FOO");
        assert_eq!(
            format_response(&table, &cmd),
            "SUPPORTED_COMMANDS: GET, PUT, QUIT\r\n"
        );
    }

    #[test]
    fn single_line_omits_empty_trailing_fields() {
        let table = test_table();
        let mut cmd = Command::new();
        cmd.name = "QUIT".to_string();
        cmd.response_message = "goodbye".to_string();
        assert_eq!(format_response(&table, &cmd), "QUIT:goodbye\r\n");

        cmd.response_message.clear();
        assert_eq!(format_response(&table, &cmd), "QUIT\r\n");

        cmd.name = "GET".to_string();
        cmd.key = "foo".to_string();
        cmd.response_message = "key_nonexistent".to_string();
        assert_eq!(format_response(&table, &cmd), "GET:foo:key_nonexistent\r\n");
    }

    #[test]
    fn record_lines_one_per_record() {
        let table = test_table();
        let mut cmd = Command::new();
        cmd.name = "GET".to_string();
        cmd.key = "ap*".to_string();
        cmd.push_record("apple", "1");
        cmd.push_record("apricot", "2");
        assert_eq!(
            format_response(&table, &cmd),
            "GET:apple:1\r\nGET:apricot:2\r\n"
        );
    }
}
