//! Rows of the metadata store

use crate::schema::*;
use diesel::prelude::*;
use serde::Serialize;

/// A registered field agent
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable, Serialize)]
#[diesel(table_name = agents)]
pub struct Agent {
    /// Caller supplied identifier, at most 50 characters
    pub id: String,
    pub name: String,
    pub location: String,
    /// Shared key held by the agent, never serialized
    #[serde(skip_serializing)]
    pub secret: String,
    /// Epoch seconds of the last registration
    pub online: i64,
    pub description: Option<String>,
    /// Path of the agent's picture relative to the data directory
    pub picture: Option<String>,
}

/// Partial update of an agent, only `Some` fields are written
#[derive(Debug, Clone, Default, PartialEq, Eq, AsChangeset)]
#[diesel(table_name = agents)]
pub struct AgentChanges {
    pub name: Option<String>,
    pub location: Option<String>,
    pub secret: Option<String>,
    pub online: Option<i64>,
    pub description: Option<String>,
    pub picture: Option<String>,
}

impl AgentChanges {
    /// Whether the update would not touch any column
    pub fn is_empty(&self) -> bool {
        self == &AgentChanges::default()
    }

    /// Apply these changes to an in-memory agent
    pub fn apply(self, agent: &mut Agent) {
        if let Some(name) = self.name {
            agent.name = name;
        }
        if let Some(location) = self.location {
            agent.location = location;
        }
        if let Some(secret) = self.secret {
            agent.secret = secret;
        }
        if let Some(online) = self.online {
            agent.online = online;
        }
        if let Some(description) = self.description {
            agent.description = Some(description);
        }
        if let Some(picture) = self.picture {
            agent.picture = Some(picture);
        }
    }
}

/// A timestamped submission by an agent
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable, Serialize)]
#[diesel(table_name = reports)]
pub struct Report {
    pub id: String,
    /// Epoch seconds, as supplied by the agent
    pub time: i64,
    /// Location of the agent at the time of submission
    pub location: String,
    pub agent: String,
}

/// A photo attached to a report
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable, Serialize)]
#[diesel(table_name = images)]
pub struct ReportImage {
    /// `{report_id}_{location}`
    pub id: String,
    /// Path of the full resolution image relative to the data directory
    pub path: String,
    pub location: String,
    pub confirmed: bool,
    pub report: String,
}
