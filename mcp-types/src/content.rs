use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::Error as _;

use crate::resources::ResourceContents;

/// Optional presentation hints attached to content blocks and resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<Vec<Role>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// Base64-encoded image bytes plus their mime type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    pub data: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// Base64-encoded audio bytes plus their mime type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioContent {
    pub data: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedResource {
    pub resource: ResourceContents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLink {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// A content block whose `type` tag was not recognized. The raw value is kept
/// so forward-compatible messages survive a round-trip untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownContent {
    pub content_type: String,
    pub value: serde_json::Value,
}

/// Tagged content union used in tool results, prompt messages and sampling.
///
/// Serde's derived tagged representation cannot keep an unknown-variant
/// payload, so (de)serialization is written out by hand: known tags map to
/// their structs, anything else is preserved verbatim as [`UnknownContent`].
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(TextContent),
    Image(ImageContent),
    Audio(AudioContent),
    Resource(EmbeddedResource),
    ResourceLink(ResourceLink),
    Unknown(UnknownContent),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextContent {
            text: text.into(),
            annotations: None,
        })
    }
}

const TEXT_TAG: &str = "text";
const IMAGE_TAG: &str = "image";
const AUDIO_TAG: &str = "audio";
const RESOURCE_TAG: &str = "resource";
const RESOURCE_LINK_TAG: &str = "resource_link";

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        fn tagged<T: Serialize, S: Serializer>(
            tag: &str,
            inner: &T,
            serializer: S,
        ) -> std::result::Result<S::Ok, S::Error> {
            let mut value = serde_json::to_value(inner).map_err(serde::ser::Error::custom)?;
            match value.as_object_mut() {
                Some(map) => {
                    map.insert("type".to_string(), serde_json::Value::String(tag.into()));
                }
                None => {
                    return Err(serde::ser::Error::custom(
                        "content block must serialize to an object",
                    ));
                }
            }
            value.serialize(serializer)
        }

        match self {
            ContentBlock::Text(inner) => tagged(TEXT_TAG, inner, serializer),
            ContentBlock::Image(inner) => tagged(IMAGE_TAG, inner, serializer),
            ContentBlock::Audio(inner) => tagged(AUDIO_TAG, inner, serializer),
            ContentBlock::Resource(inner) => tagged(RESOURCE_TAG, inner, serializer),
            ContentBlock::ResourceLink(inner) => tagged(RESOURCE_LINK_TAG, inner, serializer),
            ContentBlock::Unknown(unknown) => unknown.value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let tag = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| D::Error::custom("content block is missing a string `type` tag"))?
            .to_string();

        let parsed = match tag.as_str() {
            TEXT_TAG => serde_json::from_value(value).map(ContentBlock::Text),
            IMAGE_TAG => serde_json::from_value(value).map(ContentBlock::Image),
            AUDIO_TAG => serde_json::from_value(value).map(ContentBlock::Audio),
            RESOURCE_TAG => serde_json::from_value(value).map(ContentBlock::Resource),
            RESOURCE_LINK_TAG => serde_json::from_value(value).map(ContentBlock::ResourceLink),
            _ => {
                return Ok(ContentBlock::Unknown(UnknownContent {
                    content_type: tag,
                    value,
                }));
            }
        };
        parsed.map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn text_block_round_trip() {
        let block = ContentBlock::text("hello");
        let value = serde_json::to_value(&block).expect("to_value");
        assert_eq!(value, json!({"type": "text", "text": "hello"}));
        let back: ContentBlock = serde_json::from_value(value).expect("from_value");
        assert_eq!(back, block);
    }

    #[test]
    fn image_block_keeps_mime_type() {
        let value = json!({"type": "image", "data": "aGk=", "mimeType": "image/png"});
        let block: ContentBlock = serde_json::from_value(value.clone()).expect("from_value");
        let ContentBlock::Image(image) = &block else {
            panic!("expected image block");
        };
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(serde_json::to_value(&block).expect("to_value"), value);
    }

    #[test]
    fn unknown_block_survives_round_trip() {
        let value = json!({"type": "video", "data": "...", "frames": 24});
        let block: ContentBlock = serde_json::from_value(value.clone()).expect("from_value");
        let ContentBlock::Unknown(unknown) = &block else {
            panic!("expected unknown block");
        };
        assert_eq!(unknown.content_type, "video");
        assert_eq!(serde_json::to_value(&block).expect("to_value"), value);
    }

    #[test]
    fn missing_tag_is_rejected() {
        assert!(serde_json::from_value::<ContentBlock>(json!({"text": "hi"})).is_err());
    }
}
