//! Request bodies accepted by the ingestion endpoints, and their validation.
//!
//! Bodies are deserialized with every field optional, then validated in a single pass so
//! that one [`ValidationError`] lists every problem with the request.

use std::collections::HashSet;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::images::secure_filename;

/// Longest accepted agent id, in characters
pub const MAX_ID_LEN: usize = 50;
/// Longest accepted agent secret, in characters
pub const MAX_SECRET_LEN: usize = 256;

/// What is wrong with a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Problem {
    /// Absent, or only whitespace
    Missing,
    /// Longer than allowed
    TooLong {
        /// Maximum length in characters
        max: usize,
    },
    /// Present but unusable
    Malformed {
        /// Why the value was rejected
        reason: String,
    },
}

/// A problem with one named field of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldProblem {
    /// Name of the field, e.g. `secret` or `images[2].location`
    pub field: String,
    /// What is wrong with it
    pub problem: Problem,
}

/// Every problem found with a request body
#[derive(Debug, Clone, PartialEq, Eq, Default, Error)]
#[error("invalid request:{}", summary(.problems))]
pub struct ValidationError {
    /// Problems in the order the fields were checked
    pub problems: Vec<FieldProblem>,
}

impl ValidationError {
    /// A body that could not be parsed at all
    pub fn malformed_body(reason: impl ToString) -> Self {
        Self {
            problems: vec![FieldProblem {
                field: "body".into(),
                problem: Problem::Malformed {
                    reason: reason.to_string(),
                },
            }],
        }
    }

    /// Names of the offending fields
    pub fn fields(&self) -> Vec<&str> {
        self.problems.iter().map(|p| p.field.as_str()).collect()
    }
}

fn summary(problems: &[FieldProblem]) -> String {
    problems
        .iter()
        .map(|p| match &p.problem {
            Problem::Missing => format!(" `{}` missing or empty;", p.field),
            Problem::TooLong { max } => format!(" `{}` longer than {} characters;", p.field, max),
            Problem::Malformed { reason } => format!(" `{}` {};", p.field, reason),
        })
        .collect()
}

/// Parse a JSON body into one of the request schemas
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ValidationError> {
    serde_json::from_slice(body).map_err(ValidationError::malformed_body)
}

#[derive(Debug, Default)]
struct Checker {
    problems: Vec<FieldProblem>,
}

impl Checker {
    fn push(&mut self, field: impl Into<String>, problem: Problem) {
        self.problems.push(FieldProblem {
            field: field.into(),
            problem,
        });
    }

    /// Returns the value if it is present and not blank, records a problem otherwise
    fn required(&mut self, field: impl Into<String>, value: Option<String>) -> Option<String> {
        match value {
            Some(v) if !v.trim().is_empty() => Some(v),
            _ => {
                self.push(field, Problem::Missing);
                None
            }
        }
    }

    fn max_len(&mut self, field: &str, value: Option<&String>, max: usize) {
        if let Some(v) = value {
            if v.chars().count() > max {
                self.push(field, Problem::TooLong { max });
            }
        }
    }

    fn finish<T>(self, value: impl FnOnce() -> Option<T>) -> Result<T, ValidationError> {
        if !self.problems.is_empty() {
            return Err(ValidationError {
                problems: self.problems,
            });
        }
        value().ok_or_else(ValidationError::default)
    }
}

/// Body of `POST /api/agents`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegisterAgentRequest {
    /// Unique agent id
    pub id: Option<String>,
    /// Display name
    pub name: Option<String>,
    /// Where the agent is stationed, copied onto its reports
    pub location: Option<String>,
    /// Per agent secret
    pub secret: Option<String>,
    /// Free text, blank is treated as absent
    pub description: Option<String>,
}

/// A validated agent registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAgent {
    /// Trimmed id
    pub id: String,
    /// Display name
    pub name: String,
    /// Where the agent is stationed
    pub location: String,
    /// Per agent secret
    pub secret: String,
    /// `None` when absent or blank
    pub description: Option<String>,
}

impl RegisterAgentRequest {
    /// Check presence of all mandatory fields and the length limits
    pub fn validate(self) -> Result<NewAgent, ValidationError> {
        let mut check = Checker::default();
        let id = check
            .required("id", self.id)
            .map(|id| id.trim().to_string());
        let name = check.required("name", self.name);
        let location = check.required("location", self.location);
        let secret = check.required("secret", self.secret);
        check.max_len("id", id.as_ref(), MAX_ID_LEN);
        check.max_len("secret", secret.as_ref(), MAX_SECRET_LEN);
        let description = self.description.filter(|d| !d.trim().is_empty());

        check.finish(|| {
            Some(NewAgent {
                id: id?,
                name: name?,
                location: location?,
                secret: secret?,
                description,
            })
        })
    }
}

/// Body of `POST /api/agents/image`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentImageRequest {
    /// Id of a registered agent
    pub id: Option<String>,
    /// Base64 encoded image
    pub image: Option<String>,
}

/// A validated agent picture upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentImageUpload {
    /// Trimmed agent id
    pub id: String,
    /// Base64 payload, decoded by the image store
    pub image: String,
}

impl AgentImageRequest {
    /// Check presence of the agent id and the image
    pub fn validate(self) -> Result<AgentImageUpload, ValidationError> {
        let mut check = Checker::default();
        let id = check
            .required("id", self.id)
            .map(|id| id.trim().to_string());
        let image = check.required("image", self.image);
        check.finish(|| {
            Some(AgentImageUpload {
                id: id?,
                image: image?,
            })
        })
    }
}

/// One image entry of a report body
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportImageRequest {
    /// Base64 encoded image
    pub image: Option<String>,
    /// Label of where the photo was taken
    pub location: Option<String>,
}

/// Body of `POST /api/reports`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubmitReportRequest {
    /// Id of the submitting agent
    pub agent: Option<String>,
    /// Epoch seconds
    pub time: Option<i64>,
    /// Photos of the report, may be empty
    #[serde(default)]
    pub images: Vec<ReportImageRequest>,
}

/// A validated image entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSubmission {
    /// Base64 payload, decoded by the image store
    pub image: String,
    /// Trimmed location label
    pub location: String,
    /// `location` reduced to a file name, unique within the report
    pub file_name: String,
}

/// A validated report submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSubmission {
    /// Trimmed agent id
    pub agent: String,
    /// Epoch seconds
    pub time: i64,
    /// Images in submission order
    pub images: Vec<ImageSubmission>,
}

impl SubmitReportRequest {
    /// Check the agent id, the time and every image entry
    pub fn validate(self) -> Result<ReportSubmission, ValidationError> {
        let mut check = Checker::default();
        let agent = check
            .required("agent", self.agent)
            .map(|a| a.trim().to_string());
        if self.time.is_none() {
            check.push("time", Problem::Missing);
        }

        let mut seen = HashSet::new();
        let mut images = Vec::with_capacity(self.images.len());
        for (i, entry) in self.images.into_iter().enumerate() {
            let image = check.required(format!("images[{}].image", i), entry.image);
            let location = check
                .required(format!("images[{}].location", i), entry.location)
                .map(|l| l.trim().to_string());
            let file_name = location.as_deref().map(secure_filename);
            let reason = match (&location, &file_name) {
                (Some(l), Some(name)) if name.is_empty() => {
                    Some(format!("location `{}` has no usable file name characters", l))
                }
                (Some(l), Some(name)) if !seen.insert(name.clone()) => Some(format!(
                    "location `{}` is stored under the same name as an earlier location",
                    l
                )),
                _ => None,
            };
            if let Some(reason) = reason {
                check.push(
                    format!("images[{}].location", i),
                    Problem::Malformed { reason },
                );
            }
            if let (Some(image), Some(location), Some(file_name)) = (image, location, file_name) {
                images.push(ImageSubmission {
                    image,
                    location,
                    file_name,
                });
            }
        }

        let time = self.time;
        check.finish(|| {
            Some(ReportSubmission {
                agent: agent?,
                time: time?,
                images,
            })
        })
    }
}
