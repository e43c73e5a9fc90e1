//! Command table and dispatch for control-socket requests.
//!
//! The table is filled once at startup by [`CommandTable::standard`] and is
//! read-only afterwards. Every failure a handler reports becomes an
//! `{"error": ...}` map that is written back to the client as a normal
//! response.

mod handlers;

use std::collections::BTreeMap;

use shared::codec::{Map, Value};
use shared::protocol::error_map;
use thiserror::Error;

use crate::registry::{CommitError, ServiceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Help,
    CommitService,
    RemoveService,
    ListServices,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub usage: &'static str,
    pub kind: CommandKind,
}

#[derive(Debug, Error)]
#[error("command {0} is already registered")]
pub struct DuplicateCommand(pub String);

/// Failures surfaced to the client as error maps.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("invalid key")]
    InvalidKey,
}

impl CommandError {
    pub fn to_map(&self) -> Map {
        error_map(self.to_string())
    }
}

#[derive(Debug, Default)]
pub struct CommandTable {
    commands: BTreeMap<String, Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The commands served on the control socket.
    pub fn standard() -> Result<Self, DuplicateCommand> {
        let mut table = Self::new();
        table.register("help", "help [command]", CommandKind::Help)?;
        table.register(
            "commit_service",
            "commit_service {name, description, uri, icon[, ttl, lifetime, categories, key]}",
            CommandKind::CommitService,
        )?;
        table.register("remove_service", "remove_service <key>", CommandKind::RemoveService)?;
        table.register("list_services", "list_services", CommandKind::ListServices)?;
        Ok(table)
    }

    pub fn register(
        &mut self,
        name: &str,
        usage: &'static str,
        kind: CommandKind,
    ) -> Result<(), DuplicateCommand> {
        if self.commands.contains_key(name) {
            return Err(DuplicateCommand(name.to_string()));
        }
        self.commands.insert(name.to_string(), Command { usage, kind });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Runs `name` against `params`, returning the result or error map.
    pub fn dispatch(
        &self,
        registry: &mut ServiceRegistry,
        name: &str,
        params: &[Value],
    ) -> Result<Map, Map> {
        let Some(command) = self.get(name) else {
            tracing::debug!("Unknown command {:?}", name);
            return Err(CommandError::UnknownCommand(name.to_string()).to_map());
        };

        let result = match command.kind {
            CommandKind::Help => self.help(params),
            CommandKind::CommitService => handlers::commit_service(registry, params),
            CommandKind::RemoveService => handlers::remove_service(registry, params),
            CommandKind::ListServices => Ok(handlers::list_services(registry)),
        };

        result.map_err(|e| {
            tracing::debug!("Command {} failed: {}", name, e);
            e.to_map()
        })
    }

    fn help(&self, params: &[Value]) -> Result<Map, CommandError> {
        match params.first() {
            None => Ok(self
                .commands
                .iter()
                .map(|(name, command)| (name.as_str(), command.usage))
                .collect()),
            Some(param) => {
                let name = param
                    .as_str()
                    .ok_or(CommandError::InvalidParams("help takes a command name"))?;
                let command = self
                    .get(name)
                    .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
                let mut map = Map::new();
                map.insert(name, command.usage);
                Ok(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::signer::KeyringSigner;
    use crate::registry::RecordDefaults;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(
            Box::new(KeyringSigner::new()),
            RecordDefaults {
                ttl: 5,
                lifetime: 0,
            },
        )
    }

    fn error_of(map: &Map) -> &str {
        map.get("error").and_then(Value::as_str).unwrap()
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut table = CommandTable::standard().unwrap();
        assert!(table.register("help", "again", CommandKind::Help).is_err());
    }

    #[test]
    fn test_unknown_command_is_a_structured_failure() {
        let table = CommandTable::standard().unwrap();
        let err = table.dispatch(&mut registry(), "frobnicate", &[]).unwrap_err();
        assert_eq!(error_of(&err), "unknown command: frobnicate");
    }

    #[test]
    fn test_help_lists_every_command() {
        let table = CommandTable::standard().unwrap();
        let help = table.dispatch(&mut registry(), "help", &[]).unwrap();
        let names: Vec<&str> = help.iter().map(|(k, _)| k).collect();
        assert_eq!(
            names,
            vec!["commit_service", "help", "list_services", "remove_service"]
        );
        assert_eq!(
            help.get("remove_service").and_then(Value::as_str),
            Some("remove_service <key>")
        );
    }

    #[test]
    fn test_help_for_one_command() {
        let table = CommandTable::standard().unwrap();
        let help = table
            .dispatch(&mut registry(), "help", &[Value::from("list_services")])
            .unwrap();
        assert_eq!(help.len(), 1);
        assert_eq!(
            help.get("list_services").and_then(Value::as_str),
            Some("list_services")
        );

        assert!(table
            .dispatch(&mut registry(), "help", &[Value::from("nope")])
            .is_err());
        assert!(table.dispatch(&mut registry(), "help", &[Value::U8(1)]).is_err());
    }

    fn chat() -> Value {
        let mut map = Map::new();
        map.insert("name", "Mesh Chat");
        map.insert("description", "chat app");
        map.insert("uri", "http://10.0.0.1:8080");
        map.insert("icon", "chat.png");
        Value::Map(map)
    }

    #[test]
    fn test_commit_returns_key_and_signature() {
        let table = CommandTable::standard().unwrap();
        let mut registry = registry();
        let result = table
            .dispatch(&mut registry, "commit_service", &[chat()])
            .unwrap();
        assert_eq!(result.get("success"), Some(&Value::Bool(true)));
        assert_eq!(result.get("key").and_then(Value::as_str).map(str::len), Some(64));
        assert!(result.get("signature").and_then(Value::as_str).is_some());

        let listing = table.dispatch(&mut registry, "list_services", &[]).unwrap();
        assert_eq!(listing.get("success"), Some(&Value::Bool(true)));
        let services = listing.get("services").and_then(Value::as_list).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(
            services[0].as_map().and_then(|s| s.get("name")).and_then(Value::as_str),
            Some("Mesh Chat")
        );
    }

    #[test]
    fn test_commit_without_service_map_fails() {
        let table = CommandTable::standard().unwrap();
        let err = table
            .dispatch(&mut registry(), "commit_service", &[Value::from("x")])
            .unwrap_err();
        assert!(error_of(&err).starts_with("invalid parameters"));
    }

    #[test]
    fn test_commit_with_unregistered_key_fails() {
        let table = CommandTable::standard().unwrap();
        let mut service = chat();
        if let Value::Map(map) = &mut service {
            map.insert("key", "ab".repeat(32));
        }
        let mut registry = registry();
        assert!(table
            .dispatch(&mut registry, "commit_service", &[service])
            .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rejected_commit_reports_unsuccessful() {
        let table = CommandTable::standard().unwrap();
        let mut service = chat();
        if let Value::Map(map) = &mut service {
            map.insert("uri", "nowhere");
        }
        let result = table
            .dispatch(&mut registry(), "commit_service", &[service])
            .unwrap();
        assert_eq!(result.get("success"), Some(&Value::Bool(false)));
        assert!(result.get("key").is_none());
    }

    #[test]
    fn test_remove_twice() {
        let table = CommandTable::standard().unwrap();
        let mut registry = registry();
        let committed = table
            .dispatch(&mut registry, "commit_service", &[chat()])
            .unwrap();
        let key = committed.get("key").cloned().unwrap();

        let first = table
            .dispatch(&mut registry, "remove_service", &[key.clone()])
            .unwrap();
        assert_eq!(first.get("success"), Some(&Value::Bool(true)));
        let second = table
            .dispatch(&mut registry, "remove_service", &[key])
            .unwrap();
        assert_eq!(second.get("success"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_remove_with_invalid_key_fails() {
        let table = CommandTable::standard().unwrap();
        let err = table
            .dispatch(&mut registry(), "remove_service", &[Value::from("1234")])
            .unwrap_err();
        assert_eq!(error_of(&err), "invalid key");
        assert!(table.dispatch(&mut registry(), "remove_service", &[]).is_err());
    }

    #[test]
    fn test_list_on_empty_registry() {
        let table = CommandTable::standard().unwrap();
        let listing = table.dispatch(&mut registry(), "list_services", &[]).unwrap();
        assert_eq!(listing.get("success"), Some(&Value::Bool(false)));
        assert_eq!(
            listing.get("services").and_then(Value::as_list).map(<[Value]>::len),
            Some(0)
        );
    }
}
