use axum::extract::Multipart;
use axum::extract::multipart::MultipartError;
use serde::Serialize;

use tryon_core::{DomainError, ItemCategory, TaskView, UserId};
use tryon_infra::gateway::{Submission, Upload};

pub const SUBJECT_FIELD: &str = "subjectImage";
pub const ITEM_FIELD: &str = "itemImage";
pub const TYPE_FIELD: &str = "type";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTasksResponse {
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Read the submission form. Unknown fields are ignored; a missing `type`
/// means glasses.
pub async fn read_submission(user: UserId, mut form: Multipart) -> Result<Submission, FormError> {
    let mut submission = Submission {
        user,
        subject: None,
        item: None,
        category: ItemCategory::default(),
    };

    while let Some(field) = form.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            SUBJECT_FIELD | ITEM_FIELD => {
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await?.to_vec();
                let upload = Upload { bytes, content_type };
                if name == SUBJECT_FIELD {
                    submission.subject = Some(upload);
                } else {
                    submission.item = Some(upload);
                }
            }
            TYPE_FIELD => {
                let text = field.text().await?;
                if !text.trim().is_empty() {
                    submission.category = text.parse()?;
                }
            }
            _ => {}
        }
    }
    Ok(submission)
}
