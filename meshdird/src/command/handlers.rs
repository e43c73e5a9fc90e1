use shared::codec::{Map, Value};

use super::CommandError;
use crate::registry::{CommitOutcome, ServiceRegistry};

pub fn commit_service(
    registry: &mut ServiceRegistry,
    params: &[Value],
) -> Result<Map, CommandError> {
    let service = params
        .first()
        .and_then(Value::as_map)
        .ok_or(CommandError::InvalidParams("commit_service takes a service map"))?;

    let mut result = Map::new();
    match registry.commit(service)? {
        CommitOutcome::Committed { key, signature, .. } => {
            result.insert("success", true);
            result.insert("key", key.as_str());
            result.insert("signature", signature);
        }
        CommitOutcome::Rejected(_) => {
            result.insert("success", false);
        }
    }
    Ok(result)
}

pub fn remove_service(
    registry: &mut ServiceRegistry,
    params: &[Value],
) -> Result<Map, CommandError> {
    let key = params
        .first()
        .and_then(Value::as_str)
        .ok_or(CommandError::InvalidParams("remove_service takes a key"))?;

    let removed = registry.remove(key).map_err(|_| CommandError::InvalidKey)?;
    let mut result = Map::new();
    result.insert("success", removed.is_some());
    Ok(result)
}

pub fn list_services(registry: &ServiceRegistry) -> Map {
    let services: Vec<Value> = registry
        .list()
        .into_iter()
        .map(|entry| Value::Map(entry.record.to_map()))
        .collect();

    let mut result = Map::new();
    result.insert("services", services);
    result.insert("success", !registry.is_empty());
    result
}
