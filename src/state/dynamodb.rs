//! DynamoDB-backed state manager
//!
//! One item per `(datasource_type, datasource_source)` pair with a single
//! string attribute holding the position token. Writes are plain overwrites
//! (last writer wins); the table must already exist.

use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;

use crate::aws::{AwsClientConfig, AwsCredentials, AwsJsonClient};
use crate::config::{env_or, require_env};
use crate::error::{CdcError, Result};
use crate::types::Position;

use super::StateManager;

pub struct DynamoStateManager {
    client: AwsJsonClient,
    table_name: String,
    /// Serializes writes from a single coordinator
    write_lock: Mutex<()>,
}

impl DynamoStateManager {
    /// Build from `STATE_DYNAMODB_*` environment variables and verify the
    /// table exists. A missing table is a configuration error; the core
    /// does not auto-provision.
    pub fn from_env() -> Result<Self> {
        let region = require_env("STATE_DYNAMODB_REGION")?;
        let endpoint_url = require_env("STATE_DYNAMODB_ENDPOINT_URL")?;
        let access_key_id = require_env("STATE_DYNAMODB_ACCESS_KEY")?;
        let secret_access_key = require_env("STATE_DYNAMODB_SECRET_KEY")?;
        let table_name = require_env("STATE_DYNAMODB_TABLE")?;

        let connect_timeout = parse_timeout("STATE_DYNAMODB_CONNECT_TIMEOUT", "5")?;
        let read_timeout = parse_timeout("STATE_DYNAMODB_READ_TIMEOUT", "5")?;

        log::debug!(
            "DynamoDB configuration: region={} endpoint={} table={}",
            region,
            endpoint_url,
            table_name
        );

        let mut config = AwsClientConfig::new(
            region,
            endpoint_url,
            AwsCredentials {
                access_key_id,
                secret_access_key,
            },
        );
        config.connect_timeout = connect_timeout;
        config.read_timeout = read_timeout;

        let manager = DynamoStateManager {
            client: AwsJsonClient::new("dynamodb", config)?,
            table_name,
            write_lock: Mutex::new(()),
        };
        manager.ensure_table_exists()?;
        Ok(manager)
    }

    fn ensure_table_exists(&self) -> Result<()> {
        let request = json!({ "TableName": self.table_name });
        match self.client.post("DynamoDB_20120810.DescribeTable", &request) {
            Ok(_) => {
                log::debug!("DynamoDB table {} exists", self.table_name);
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("ResourceNotFoundException") {
                    Err(CdcError::Configuration(format!(
                        "DynamoDB table {} does not exist. Please create it manually.",
                        self.table_name
                    )))
                } else {
                    Err(CdcError::Configuration(format!(
                        "Failed to check DynamoDB table {}: {}",
                        self.table_name, msg
                    )))
                }
            }
        }
    }
}

impl StateManager for DynamoStateManager {
    fn store(&self, datasource_type: &str, datasource_source: &str, position: &Position) -> bool {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let request = json!({
            "TableName": self.table_name,
            "Item": {
                "datasource_type": { "S": datasource_type },
                "datasource_source": { "S": datasource_source },
                "position": { "S": position.as_str() },
            }
        });

        match self.client.post("DynamoDB_20120810.PutItem", &request) {
            Ok(_) => {
                log::info!(
                    "State stored for {}:{} - {}",
                    datasource_type,
                    datasource_source,
                    position
                );
                true
            }
            Err(e) => {
                log::error!("Failed to store state: {}", e);
                false
            }
        }
    }

    fn read(&self, datasource_type: &str, datasource_source: &str) -> Position {
        let request = json!({
            "TableName": self.table_name,
            "Key": {
                "datasource_type": { "S": datasource_type },
                "datasource_source": { "S": datasource_source },
            }
        });

        match self.client.post("DynamoDB_20120810.GetItem", &request) {
            Ok(response) => match position_from_item(&response) {
                Some(position) => {
                    log::debug!("Retrieved state: {}", position);
                    position
                }
                None => {
                    log::info!(
                        "No state found for {}:{}",
                        datasource_type,
                        datasource_source
                    );
                    Position::empty()
                }
            },
            Err(e) => {
                log::error!("Failed to read state: {}", e);
                Position::empty()
            }
        }
    }
}

fn parse_timeout(name: &str, default: &str) -> Result<Duration> {
    let raw = env_or(name, default);
    let secs = raw
        .parse::<f64>()
        .map_err(|_| CdcError::Configuration(format!("{} must be a number of seconds, got '{}'", name, raw)))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(CdcError::Configuration(format!("{} must be greater than zero", name)));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Extract the position attribute from a GetItem response
fn position_from_item(response: &serde_json::Value) -> Option<Position> {
    response
        .get("Item")?
        .get("position")?
        .get("S")?
        .as_str()
        .map(Position::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_from_item_present() {
        let response = json!({
            "Item": {
                "datasource_type": { "S": "mysql" },
                "datasource_source": { "S": "db.example.com" },
                "position": { "S": "3e11fa47:23" },
            }
        });
        assert_eq!(
            position_from_item(&response),
            Some(Position::new("3e11fa47:23"))
        );
    }

    #[test]
    fn test_position_from_item_missing() {
        assert_eq!(position_from_item(&json!({})), None);
        assert_eq!(position_from_item(&json!({"Item": {}})), None);
        assert_eq!(
            position_from_item(&json!({"Item": {"position": {"N": "1"}}})),
            None
        );
    }
}
