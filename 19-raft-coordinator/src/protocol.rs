//! REPL command parsing for the interactive client shell.
//!
//! A [`ConsoleCommand`] is what a person types at the `coord-cli` prompt; the
//! shell turns each one into a call on [`crate::sdk::Client`]. Commands are
//! case-insensitive and most have a one-letter alias.

use anyhow::{Result, anyhow, bail};

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    /// `end` empty means unbounded.
    Scan { start: String, end: String },
    Lock { key: String },
    TryLock { key: String },
    UnLock { key: String },
    Watch { key: String },
    Show,
    Stat,
    Clean { end_index: i64 },
    Help,
    Exit,
}

pub const HELP: &str = "\
commands:
  put/p <key> <value>     store a value
  get/g <key>             read a value
  delete/d <key>          remove a key
  scan/s <start> [end]    list keys in [start, end)
  lock/l <key>            block until the lock is held
  trylock/t <key>         take the lock if it is free
  unlock/u <key>          release a lock
  watch/w <key>           wait for the next change of a key
  show                    cluster members and their progress
  stat                    leader throughput per operation
  clean <index>           drop binlog slots below index
  help/h                  this text
  exit/e                  quit";

impl ConsoleCommand {
    /// Parses one line of input. Values may contain spaces: everything after
    /// the key is taken as the value of a `put`.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let Some(word) = parts.next().filter(|word| !word.is_empty()) else {
            bail!("empty command");
        };
        let rest = parts.next().unwrap_or("").trim();
        let args: Vec<&str> = rest.split_whitespace().collect();

        let cmd = word.to_uppercase();
        let normalized = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "D" | "DEL" => "DELETE",
            "S" => "SCAN",
            "L" => "LOCK",
            "T" => "TRYLOCK",
            "U" => "UNLOCK",
            "W" => "WATCH",
            "H" | "?" => "HELP",
            "E" | "QUIT" | "Q" => "EXIT",
            other => other,
        };

        let key = |usage: &str| -> Result<String> {
            match args.as_slice() {
                [key] => Ok(key.to_string()),
                _ => Err(anyhow!("usage: {usage}")),
            }
        };

        match normalized {
            "EXIT" => Ok(ConsoleCommand::Exit),
            "HELP" => Ok(ConsoleCommand::Help),
            "SHOW" => Ok(ConsoleCommand::Show),
            "STAT" | "STATS" => Ok(ConsoleCommand::Stat),
            "PUT" => {
                let mut kv = rest.splitn(2, char::is_whitespace);
                match (kv.next().filter(|k| !k.is_empty()), kv.next()) {
                    (Some(key), Some(value)) if !value.trim().is_empty() => Ok(ConsoleCommand::Put {
                        key: key.to_string(),
                        value: value.trim().to_string(),
                    }),
                    _ => Err(anyhow!("usage: put <key> <value>")),
                }
            }
            "GET" => Ok(ConsoleCommand::Get { key: key("get <key>")? }),
            "DELETE" => Ok(ConsoleCommand::Delete { key: key("delete <key>")? }),
            "LOCK" => Ok(ConsoleCommand::Lock { key: key("lock <key>")? }),
            "TRYLOCK" => Ok(ConsoleCommand::TryLock { key: key("trylock <key>")? }),
            "UNLOCK" => Ok(ConsoleCommand::UnLock { key: key("unlock <key>")? }),
            "WATCH" => Ok(ConsoleCommand::Watch { key: key("watch <key>")? }),
            "SCAN" => match args.as_slice() {
                [start] => Ok(ConsoleCommand::Scan {
                    start: start.to_string(),
                    end: String::new(),
                }),
                [start, end] => Ok(ConsoleCommand::Scan {
                    start: start.to_string(),
                    end: end.to_string(),
                }),
                _ => Err(anyhow!("usage: scan <start> [end]")),
            },
            "CLEAN" => match args.as_slice() {
                [index] => {
                    let end_index = index
                        .parse()
                        .map_err(|_| anyhow!("clean expects a slot index, got {index:?}"))?;
                    Ok(ConsoleCommand::Clean { end_index })
                }
                _ => Err(anyhow!("usage: clean <index>")),
            },
            _ => Err(anyhow!("unknown command {word:?}; type help for a list")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("ExIt"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("SHOW"), Ok(ConsoleCommand::Show)));
        assert!(matches!(ConsoleCommand::parse("stat"), Ok(ConsoleCommand::Stat)));
    }

    #[test]
    fn test_aliases() {
        assert!(matches!(ConsoleCommand::parse("q"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("h"), Ok(ConsoleCommand::Help)));
        assert!(matches!(
            ConsoleCommand::parse("g foo"),
            Ok(ConsoleCommand::Get { key }) if key == "foo"
        ));
        assert!(matches!(
            ConsoleCommand::parse("del foo"),
            Ok(ConsoleCommand::Delete { key }) if key == "foo"
        ));
        assert!(matches!(
            ConsoleCommand::parse("t /locks/a"),
            Ok(ConsoleCommand::TryLock { key }) if key == "/locks/a"
        ));
    }

    #[test]
    fn test_put_keeps_spaces_in_value() {
        assert!(matches!(
            ConsoleCommand::parse("put greeting hello   world "),
            Ok(ConsoleCommand::Put { key, value }) if key == "greeting" && value == "hello   world"
        ));
        assert!(ConsoleCommand::parse("put lonely").is_err());
    }

    #[test]
    fn test_scan_end_is_optional() {
        assert!(matches!(
            ConsoleCommand::parse("scan b"),
            Ok(ConsoleCommand::Scan { start, end }) if start == "b" && end.is_empty()
        ));
        assert!(matches!(
            ConsoleCommand::parse("s b z"),
            Ok(ConsoleCommand::Scan { start, end }) if start == "b" && end == "z"
        ));
    }

    #[test]
    fn test_invalid_input() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("get").is_err());
        assert!(ConsoleCommand::parse("get a b").is_err());
        assert!(ConsoleCommand::parse("clean ten").is_err());
        assert!(ConsoleCommand::parse("frobnicate").is_err());
        assert!(matches!(
            ConsoleCommand::parse("clean 42"),
            Ok(ConsoleCommand::Clean { end_index: 42 })
        ));
    }
}
