//! Subset of the Telegram Bot API update schema the gateway reads.

use serde::{Deserialize, Serialize};

use crate::models::job::ChatId;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
    pub caption: Option<String>,
    /// Available sizes of a photo, smallest first.
    pub photo: Option<Vec<PhotoSize>>,
}

impl Message {
    pub fn is_photo(&self) -> bool {
        self.photo.as_ref().is_some_and(|sizes| !sizes.is_empty())
    }

    /// The highest resolution version of the photo, if this is a photo message.
    pub fn largest_photo(&self) -> Option<&PhotoSize> {
        self.photo.as_ref().and_then(|sizes| sizes.last())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: String,
    pub width: u32,
    pub height: u32,
    pub file_size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_update() {
        let update: Update = serde_json::from_str(
            r#"{
                "update_id": 1,
                "message": {
                    "message_id": 10,
                    "chat": {"id": 777, "type": "private"},
                    "photo": [
                        {"file_id": "small", "file_unique_id": "a", "width": 90, "height": 90},
                        {"file_id": "large", "file_unique_id": "b", "width": 1280, "height": 960}
                    ]
                }
            }"#,
        )
        .unwrap();

        let message = update.message.unwrap();
        assert!(message.is_photo());
        assert_eq!(message.chat.id, ChatId(777));
        assert_eq!(message.largest_photo().unwrap().file_id, "large");
    }

    #[test]
    fn test_text_update() {
        let update: Update = serde_json::from_str(
            r#"{"message": {"message_id": 3, "chat": {"id": 5}, "text": "hi"}}"#,
        )
        .unwrap();
        let message = update.message.unwrap();
        assert!(!message.is_photo());
        assert_eq!(message.text.as_deref(), Some("hi"));
    }
}
