//! Interactive host loop for `gamesaver run`.
//!
//! Stands in for a game: it owns one participant holding a free-form JSON
//! object, reads commands from stdin, and forwards save/load triggers to the
//! [`SaveManager`]. Ctrl-C or end of input ends the loop; the caller then runs
//! the shutdown hook.

use std::sync::Arc;

use anyhow::{Context, Result};
use gamesaver_kernel::{Durability, SaveEvent, SaveManager, SharedModule};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// The state a host session edits.
pub type HostState = SharedModule<Map<String, Value>>;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One line of host input.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// `save` or `save!` (immediate).
    Save { durability: Durability },
    /// `load`
    Load,
    /// `new`
    NewGame,
    /// `profile <id>`: write future saves under another profile.
    Profile(String),
    /// `set <field> <json>`
    Set { field: String, value: Value },
    /// `unset <field>`
    Unset(String),
    /// `show`
    Show,
    /// `profiles`
    Profiles,
    /// `help`
    Help,
    /// `quit` or `exit`
    Quit,
}

impl HostCommand {
    /// Parse a non-empty input line.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match (verb, rest) {
            ("save", "") => Self::Save {
                durability: Durability::Async,
            },
            ("save!", "") => Self::Save {
                durability: Durability::Immediate,
            },
            ("load", "") => Self::Load,
            ("new", "") => Self::NewGame,
            ("profile", id) if !id.is_empty() => Self::Profile(id.to_string()),
            ("set", args) => {
                let Some((field, raw)) = args.split_once(char::is_whitespace) else {
                    return Err("usage: set <field> <json value>".into());
                };
                // Bare words are taken as strings.
                let raw = raw.trim();
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.into()));
                Self::Set {
                    field: field.to_string(),
                    value,
                }
            }
            ("unset", field) if !field.is_empty() => Self::Unset(field.to_string()),
            ("show", "") => Self::Show,
            ("profiles", "") => Self::Profiles,
            ("help" | "?", "") => Self::Help,
            ("quit" | "exit", "") => Self::Quit,
            _ => return Err(format!("unknown command `{line}` (try `help`)")),
        };
        Ok(command)
    }
}

const HELP: &str = "\
  save             request a save
  save!            request an immediate (fsynced) save
  load             reload the active profile from disk
  new              start an empty profile
  profile <id>     save future progress under <id>
  set <k> <json>   set a field of the session state
  unset <k>        remove a field
  show             print the session state
  profiles         list profiles on disk
  quit             save and exit";

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run until Ctrl-C, `quit`, or end of input.
pub async fn run(manager: &SaveManager, state: &Arc<HostState>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut events = manager.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "save events dropped"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read input")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match HostCommand::parse(&line) {
                    Ok(HostCommand::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(manager, state, command).await {
                            error!(error = %e, "command failed");
                        }
                    }
                    Err(message) => println!("  {message}"),
                }
            }
        }
    }
    Ok(())
}

async fn execute(
    manager: &SaveManager,
    state: &Arc<HostState>,
    command: HostCommand,
) -> gamesaver_kernel::Result<()> {
    match command {
        HostCommand::Save { durability } => {
            // Completion is reported through the event stream.
            manager.request_save(durability).await?;
        }
        HostCommand::Load => manager.load_game().await?,
        HostCommand::NewGame => {
            manager.new_game().await?;
            state.set(Map::new());
        }
        HostCommand::Profile(id) => manager.set_profile_id(id).await?,
        HostCommand::Set { field, value } => {
            state.update(|map| map.insert(field, value));
        }
        HostCommand::Unset(field) => {
            state.update(|map| map.remove(&field));
        }
        HostCommand::Show => {
            let snapshot = Value::Object(state.get());
            println!(
                "  [{}] {}",
                manager.profile_id().await?,
                serde_json::to_string_pretty(&snapshot).unwrap_or_default()
            );
        }
        HostCommand::Profiles => {
            for profile in manager.list_profiles().await? {
                println!("  {}", profile.id);
            }
        }
        HostCommand::Help => println!("{HELP}"),
        HostCommand::Quit => {}
    }
    Ok(())
}

fn report(event: &SaveEvent) {
    match event {
        SaveEvent::SaveCompleted {
            profile_id,
            success: true,
        } => println!("  saved [{profile_id}]"),
        SaveEvent::SaveCompleted {
            profile_id,
            success: false,
        } => println!("  save FAILED [{profile_id}]"),
        SaveEvent::LoadCompleted { profile_id, found } => {
            let origin = if *found { "from disk" } else { "new profile" };
            println!("  loaded [{profile_id}] ({origin})");
        }
        SaveEvent::ProfileDeleted { profile_id } => println!("  deleted [{profile_id}]"),
        SaveEvent::LoadStarted { .. } | SaveEvent::SaveStarted { .. } => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
