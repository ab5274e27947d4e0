use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub String);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a file owned by the file storage collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    #[serde(alias = "contentType")]
    pub content_type: String,
    #[serde(default, alias = "previewUrl", skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
}

impl FileRef {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FileId, FileRef};

    #[test]
    fn file_ref_accepts_camel_case_fields() {
        let file: FileRef = serde_json::from_value(json!({
            "id": "F-1",
            "name": "elevation.png",
            "size": 20480,
            "contentType": "image/png",
            "previewUrl": "https://files.example.test/F-1/preview"
        }))
        .expect("file ref decodes");

        assert_eq!(file.id, FileId("F-1".to_owned()));
        assert!(file.is_image());
        assert!(file.preview_url.is_some());
    }
}
