//! Usage records written once per completed agent invocation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::ProviderKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub cost_usd: f64,
    pub task_id: Uuid,
    pub environment_id: Uuid,
    pub user_id: Uuid,
    /// Which invocation produced the cost (e.g. "plan", "execute")
    pub label: String,
    pub created_at: DateTime<Utc>,
}
