use async_trait::async_trait;

use super::{metadata_is_empty, BackendError, BackendPublicData, MeetingBackend};
use crate::shared::models::User;

/// The trivial provider: no third-party API, no credentials. Starting a
/// meeting just marks the metadata so the derived status flips to STARTED.
pub struct InPersonBackend;

pub const NAME: &str = "inperson";

#[async_trait]
impl MeetingBackend for InPersonBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn public_data(&self) -> BackendPublicData {
        BackendPublicData {
            name: NAME,
            friendly_name: "In Person",
            enabled: true,
            docs_url: None,
            profile_url: None,
            telephone_num: None,
            intl_telephone_url: None,
        }
    }

    async fn is_authorized(&self, _user: &User) -> bool {
        true
    }

    async fn save_user_meeting(
        &self,
        metadata: serde_json::Value,
        _assignee: &User,
    ) -> Result<serde_json::Value, BackendError> {
        if !metadata_is_empty(&metadata) {
            return Ok(metadata);
        }
        Ok(serde_json::json!({ "started": true }))
    }
}
