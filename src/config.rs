//! Document configuration.

use serde::{Deserialize, Serialize};

use crate::core::UserId;

/// Per-document construction parameters. No environment variables, no
/// CLI; embedders persist this themselves if they want to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Author stamped on every record this replica appends.
    pub user_id: UserId,
}

impl Config {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}
