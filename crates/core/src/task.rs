//! Try-on task model and its three-state lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entitlement::ChargeStep;
use crate::error::DomainError;
use crate::id::{TaskId, UserId};

/// Task lifecycle. `Processing` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(TaskStatus::Processing),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(DomainError::validation(format!("unknown task status '{other}'"))),
        }
    }
}

/// Kind of item being composited onto the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemCategory {
    #[default]
    Glasses,
    Outfit,
    Shoes,
    Accessories,
}

impl ItemCategory {
    pub const ALL: [ItemCategory; 4] = [
        ItemCategory::Glasses,
        ItemCategory::Outfit,
        ItemCategory::Shoes,
        ItemCategory::Accessories,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCategory::Glasses => "GLASSES",
            ItemCategory::Outfit => "OUTFIT",
            ItemCategory::Shoes => "SHOES",
            ItemCategory::Accessories => "ACCESSORIES",
        }
    }

    /// Composition instructions sent alongside the two images.
    pub fn instructions(&self) -> &'static str {
        match self {
            ItemCategory::Glasses => {
                "Place the glasses from the second image on the face in the first image. \
                 Keep the face photo unchanged in framing and proportions, follow the head tilt, \
                 seat the frame on the nose bridge and temples, and match lighting and perspective."
            }
            ItemCategory::Outfit => {
                "Dress the person in the first image in the outfit from the second image. \
                 Preserve pose, body shape, face and background, and drape the garment naturally \
                 with consistent lighting."
            }
            ItemCategory::Shoes => {
                "Put the shoes from the second image on the person's feet in the first image. \
                 Keep the stance and background unchanged and match scale, angle and shadows."
            }
            ItemCategory::Accessories => {
                "Add the accessory from the second image to the person in the first image where it \
                 is naturally worn. Keep the rest of the photo unchanged and match lighting and scale."
            }
        }
    }
}

impl FromStr for ItemCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        ItemCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "invalid try-on type '{s}'; expected one of GLASSES, OUTFIT, SHOES, ACCESSORIES"
                ))
            })
    }
}

/// A submitted try-on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryOnTask {
    pub id: TaskId,
    pub user_id: UserId,
    pub category: ItemCategory,
    pub subject_url: String,
    pub item_url: String,
    pub result_url: Option<String>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    /// Consumption order resolved when the task was accepted.
    pub charge_plan: Vec<ChargeStep>,
    pub usage_charged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryOnTask {
    /// A freshly accepted task in `Processing`.
    #[allow(clippy::too_many_arguments)]
    pub fn accepted(
        id: TaskId,
        user_id: UserId,
        category: ItemCategory,
        subject_url: String,
        item_url: String,
        charge_plan: Vec<ChargeStep>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            category,
            subject_url,
            item_url,
            result_url: None,
            status: TaskStatus::Processing,
            error_message: None,
            charge_plan,
            usage_charged: false,
            created_at,
            updated_at: created_at,
            expires_at: Some(expires_at),
        }
    }

    /// Every stored payload this task references.
    pub fn payload_urls(&self) -> impl Iterator<Item = &str> {
        [
            Some(self.subject_url.as_str()),
            Some(self.item_url.as_str()),
            self.result_url.as_deref(),
        ]
        .into_iter()
        .flatten()
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.id,
            status: self.status,
            result_url: self.result_url.clone(),
            error: self.error_message.clone(),
            created_at: self.created_at,
        }
    }
}

/// Client-facing snapshot returned by poll and recovery calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
