use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::documents::{Collection, Record};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

/// An uploaded photo or video. `size` is the byte length of the original file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    #[serde(default)]
    pub id: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    // Rows written before user ids existed only carry the username.
    #[serde(default)]
    pub user_id: Option<String>,
    pub username: String,
    /// Inline data URL, empty when no preview could be produced.
    #[serde(default)]
    pub preview: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wish {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A user with everything they uploaded. Built on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Folder {
    pub user: User,
    pub media: Vec<MediaAsset>,
    pub wishes: Vec<Wish>,
}

impl Record for User {
    const COLLECTION: Collection = Collection::Users;

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

impl Record for MediaAsset {
    const COLLECTION: Collection = Collection::Media;

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

impl Record for Wish {
    const COLLECTION: Collection = Collection::Messages;

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Anything the admin search box can match against.
pub trait Named {
    fn display_name(&self) -> &str;
}

impl Named for User {
    fn display_name(&self) -> &str {
        &self.name
    }
}

impl Named for Folder {
    fn display_name(&self) -> &str {
        &self.user.name
    }
}

impl Named for MediaAsset {
    fn display_name(&self) -> &str {
        &self.username
    }
}

#[derive(Deserialize)]
pub struct UploadUserRequest {
    pub username: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadWishRequest {
    pub message: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
}

/// Metadata-only media write. Every field is optional on the wire so that
/// validation can report all missing ones at once.
#[derive(Deserialize, Default)]
pub struct UploadMediaRequest {
    pub filename: Option<String>,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub preview: Option<String>,
    #[serde(rename = "downloadURL")]
    pub download_url: Option<String>,
}

impl UploadMediaRequest {
    /// Returns the asset to store, or the wire names of every missing field.
    /// An empty `preview` is accepted: it is what a failed video frame grab produces.
    pub fn validate(self) -> Result<MediaAsset, Vec<&'static str>> {
        let mut missing = Vec::new();

        let filename = required_text(self.filename, "filename", &mut missing);
        let mime_type = required_text(self.mime_type, "type", &mut missing);
        if self.size.is_none() {
            missing.push("size");
        }
        let user_id = required_text(self.user_id, "userId", &mut missing);
        let username = required_text(self.username, "username", &mut missing);
        if self.preview.is_none() {
            missing.push("preview");
        }
        let download_url = required_text(self.download_url, "downloadURL", &mut missing);

        if !missing.is_empty() {
            return Err(missing);
        }

        Ok(MediaAsset {
            id: String::new(),
            filename,
            mime_type,
            size: self.size.unwrap_or_default(),
            user_id: Some(user_id),
            username,
            preview: self.preview.unwrap_or_default(),
            download_url,
            created_at: Some(Utc::now()),
        })
    }
}

fn required_text(value: Option<String>, name: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

#[derive(Serialize)]
pub struct IdResponse {
    pub id: String,
}

#[derive(Serialize)]
pub struct UploadMediaResponse {
    pub success: bool,
    pub result: MediaAsset,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUpload {
    pub filename: String,
    pub error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub batch_id: Uuid,
    pub user: User,
    pub media: Vec<MediaAsset>,
    pub failed: Vec<FailedUpload>,
    pub wish: Wish,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitQuery {
    pub batch_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub batch_id: Uuid,
    pub percent: f64,
    pub finished: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestRequest {
    pub device_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_after: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct NameFilterQuery {
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "filePath")]
    pub file_path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadManifestItem {
    pub id: String,
    pub filename: String,
    pub username: String,
    pub download_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete_request() -> serde_json::Value {
        json!({
            "filename": "cake.jpg",
            "type": "image/jpeg",
            "size": 2048,
            "userId": "u1",
            "username": "Anna",
            "preview": "data:image/jpeg;base64,AAAA",
            "downloadURL": "http://gallery.test/downloadFile?filePath=x%2Fcake.jpg"
        })
    }

    #[test]
    fn complete_media_request_validates() {
        let req: UploadMediaRequest = serde_json::from_value(complete_request()).unwrap();
        let asset = req.validate().unwrap();
        assert_eq!(asset.size, 2048);
        assert_eq!(asset.user_id.as_deref(), Some("u1"));
        assert!(asset.created_at.is_some());
    }

    #[test]
    fn missing_size_is_the_only_reported_field() {
        let mut body = complete_request();
        body.as_object_mut().unwrap().remove("size");
        let req: UploadMediaRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.validate().unwrap_err(), vec!["size"]);
    }

    #[test]
    fn empty_request_lists_every_field_in_wire_order() {
        let missing = UploadMediaRequest::default().validate().unwrap_err();
        assert_eq!(
            missing,
            vec!["filename", "type", "size", "userId", "username", "preview", "downloadURL"]
        );
    }

    #[test]
    fn empty_preview_is_accepted() {
        let mut body = complete_request();
        body["preview"] = json!("");
        let req: UploadMediaRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.validate().unwrap().preview, "");
    }

    #[test]
    fn legacy_media_row_without_user_id_deserializes() {
        let asset: MediaAsset = serde_json::from_value(json!({
            "id": "m1",
            "filename": "old.png",
            "type": "image/png",
            "size": 10,
            "username": "A",
            "preview": "",
            "downloadURL": "https://example.invalid/old.png"
        }))
        .unwrap();
        assert!(asset.user_id.is_none());
        assert!(asset.created_at.is_none());

        let with_null: MediaAsset = serde_json::from_value(json!({
            "filename": "old.png",
            "type": "image/png",
            "size": 10,
            "userId": null,
            "username": "A",
            "downloadURL": "https://example.invalid/old.png"
        }))
        .unwrap();
        assert!(with_null.user_id.is_none());
    }

    #[test]
    fn media_asset_uses_store_field_names() {
        let asset = MediaAsset {
            id: "m1".into(),
            filename: "a.mp4".into(),
            mime_type: "video/mp4".into(),
            size: 5,
            user_id: Some("u1".into()),
            username: "A".into(),
            preview: String::new(),
            download_url: "http://x".into(),
            created_at: None,
        };
        let value = serde_json::to_value(&asset).unwrap();
        assert_eq!(value["type"], "video/mp4");
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["downloadURL"], "http://x");
        assert!(value.get("createdAt").is_none());
    }
}
