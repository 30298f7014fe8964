/// OpenAI-compatible wire types.
///
/// Only the parts of a chat completion request that routing looks at are modelled here; the
/// request body itself is forwarded to the backend as received (with `model` rewritten).
use serde::{Deserialize, Serialize};

/// The routing-relevant view of a `/v1/chat/completions` request body.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn tool_count(&self) -> usize {
        self.tools.as_ref().map_or(0, Vec::len)
    }

    /// The last `n` user messages, oldest first.
    pub fn last_user_messages(&self, n: usize) -> impl Iterator<Item = &Message> {
        let users: Vec<&Message> = self.messages.iter().filter(|m| m.is_user()).collect();
        let skip = users.len().saturating_sub(n);
        users.into_iter().skip(skip)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }

    /// The text of the message. Multi-part content is joined with `separator`, with each image
    /// part replaced by `image_placeholder`.
    pub fn render(&self, image_placeholder: &str, separator: &str) -> String {
        match &self.content {
            None => String::new(),
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => Some(image_placeholder),
                    ContentPart::Other => None,
                })
                .collect::<Vec<_>>()
                .join(separator),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(
            &self.content,
            Some(MessageContent::Parts(parts))
                if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. }))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        #[serde(default)]
        text: String,
    },
    ImageUrl {
        #[serde(default)]
        image_url: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// The returned models from the /v1/models endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Model {
    /// The model identifier, which can be referenced in the API endpoints.
    pub id: String,
    /// The Unix timestamp (in seconds) when the model was created.
    pub created: u64,
    /// The object type, which is always "model".
    pub object: String,
    /// The organization that owns the model.
    pub owned_by: String,
}

impl Model {
    /// Clients only ever see the router itself; the real models stay behind it.
    pub fn virtual_model(name: &str) -> Self {
        Model {
            id: name.to_owned(),
            created: 0,
            object: "model".into(),
            owned_by: "smart-router".into(),
        }
    }
}

/// The response from the /v1/models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    /// A list of model objects.
    pub data: Vec<Model>,
}

impl ListModelResponse {
    pub fn single(model: Model) -> Self {
        ListModelResponse {
            object: "list".into(),
            data: vec![model],
        }
    }
}
