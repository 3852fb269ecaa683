//! Shell command parsing for `bullet-node`.
//!
//! Commands are case-insensitive and each has a one-letter alias:
//!
//! - `PROPOSE <value>` (`p`): propose a value; JSON if it parses, a string otherwise
//! - `LEADER` (`l`): run for leader of the next term
//! - `PASS <id>` (`t`): hand the bullet to another acceptor
//! - `STATUS` (`s`), `SAFETY` (`y`), `HELP` (`h`), `EXIT` (`e`)

use anyhow::{Result, anyhow};

use crate::codec::Value;
use crate::state::AcceptorId;

pub const HELP_TEXT: &str = "\
commands:
  PROPOSE/p <value>  propose a value (JSON, or a plain string)
  LEADER/l           request leadership for the next term
  PASS/t <id>        pass the bullet to acceptor <id>
  STATUS/s           print this node's status as JSON
  SAFETY/y           check the safety invariants
  HELP/h             show this help
  EXIT/e             shut down this node";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Propose { value: Value },
    Leader,
    Pass { target: AcceptorId },
    Status,
    Safety,
    Help,
    Exit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let Some((head, rest)) = split_command(trimmed) else {
            return Err(anyhow!("empty command"));
        };

        let cmd = head.to_uppercase();
        let normalized = match cmd.as_str() {
            "P" => "PROPOSE",
            "L" => "LEADER",
            "T" => "PASS",
            "S" => "STATUS",
            "Y" => "SAFETY",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized, rest.is_empty()) {
            ("LEADER", true) => Ok(ConsoleCommand::Leader),
            ("STATUS", true) => Ok(ConsoleCommand::Status),
            ("SAFETY", true) => Ok(ConsoleCommand::Safety),
            ("HELP", true) => Ok(ConsoleCommand::Help),
            ("EXIT", true) => Ok(ConsoleCommand::Exit),
            ("PROPOSE", false) => Ok(ConsoleCommand::Propose {
                value: parse_value(rest),
            }),
            ("PASS", false) => {
                let target = rest
                    .parse()
                    .map_err(|_| anyhow!("PASS needs an acceptor id between 0 and 255, got '{rest}'"))?;
                Ok(ConsoleCommand::Pass { target })
            }
            ("PROPOSE", true) => Err(anyhow!("PROPOSE requires a value: PROPOSE <value>")),
            ("PASS", true) => Err(anyhow!("PASS requires a target: PASS <id>")),
            ("LEADER" | "STATUS" | "SAFETY" | "HELP" | "EXIT", false) => {
                Err(anyhow!("{normalized} takes no arguments"))
            }
            _ => Err(anyhow!(
                "invalid command. Try: PROPOSE/p <value>, LEADER/l, PASS/t <id>, STATUS/s, SAFETY/y, HELP/h, EXIT/e"
            )),
        }
    }
}

/// Splits off the first word, keeping the remainder's inner spacing.
fn split_command(line: &str) -> Option<(&str, &str)> {
    if line.is_empty() {
        return None;
    }
    Some(match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    })
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
