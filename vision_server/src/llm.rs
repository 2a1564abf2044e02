//! Client for an OpenAI-compatible chat-completion API.
//!
use std::time::Duration;

use async_trait::async_trait;
use common::protocol::DetectionHint;
use image::RgbImage;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    describe::Captioner,
    utils::{crop_to_bbox, encode_png_data_uri},
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const DEFAULT_MAX_TOKENS: u32 = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Error bodies of the API are cut to this many characters.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("language model API key is not configured")]
    MissingApiKey,
    #[error("request to language model failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("language model returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("language model returned no content")]
    EmptyResponse,
    #[error("failed to encode image: {0}")]
    Image(#[from] image::ImageError),
}

/// Part of a multimodal user message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [UserMessage; 1],
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct UserMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LlmClient {
    http: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl LlmClient {
    /// Create a client. Empty keys count as no key.
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Send one user message and return the text of the first choice.
    pub async fn chat(&self, content: Vec<ContentPart>) -> Result<String, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;

        let request = ChatRequest {
            model: &self.model,
            messages: [UserMessage {
                role: "user",
                content,
            }],
            max_tokens: self.max_tokens,
        };

        log::debug!("Requesting completion from {} with {}", self.base_url, self.model);
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY)
                .collect();
            return Err(LlmError::Status { status, body });
        }

        let completion: ChatCompletion = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_owned())
            .filter(|content| !content.is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

fn caption_prompt(hint: &DetectionHint) -> String {
    match hint.class.as_deref() {
        Some(label) => format!(
            "The camera detected a {label} in this image. Describe it in two or three short \
             sentences for a curious visitor: what it is and one interesting fact about it."
        ),
        None => "Describe the main object in this image in two or three short sentences \
                 for a curious visitor: what it is and one interesting fact about it."
            .to_owned(),
    }
}

#[async_trait]
impl Captioner for LlmClient {
    async fn caption(&self, image: &RgbImage, hint: &DetectionHint) -> anyhow::Result<String> {
        // Skip encoding work when the request cannot be sent anyway
        if !self.has_api_key() {
            return Err(LlmError::MissingApiKey.into());
        }

        let crop = crop_to_bbox(image, hint.bbox());
        let data_uri = encode_png_data_uri(&crop).map_err(LlmError::Image)?;
        let content = vec![
            ContentPart::text(caption_prompt(hint)),
            ContentPart::image_url(data_uri),
        ];

        Ok(self.chat(content).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mockito::Matcher;

    const COMPLETION: &str =
        r#"{"choices": [{"index": 0, "message": {"role": "assistant", "content": " A cat. "}}]}"#;

    #[test]
    fn test_content_part_json() {
        let parts = vec![ContentPart::text("hi"), ContentPart::image_url("data:x")];
        assert_eq!(
            serde_json::to_value(&parts).unwrap(),
            serde_json::json!([
                {"type": "text", "text": "hi"},
                {"type": "image_url", "image_url": {"url": "data:x"}}
            ])
        );
    }

    #[tokio::test]
    async fn test_chat_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "gpt-4o-mini",
                "max_tokens": 500
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(COMPLETION)
            .create_async()
            .await;

        let client = LlmClient::new(Some("secret".into())).with_base_url(server.url());
        let answer = client.chat(vec![ContentPart::text("what?")]).await.unwrap();

        assert_eq!(answer, "A cat.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_chat_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let client = LlmClient::new(Some("secret".into())).with_base_url(server.url());
        match client.chat(vec![ContentPart::text("what?")]).await {
            Err(LlmError::Status { status, body }) => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected result {other:?}"),
        }

        let client = LlmClient::new(Some("   ".into()));
        assert!(!client.has_api_key());
        assert!(matches!(
            client.chat(vec![]).await,
            Err(LlmError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn test_chat_without_choices() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let client = LlmClient::new(Some("secret".into())).with_base_url(server.url());
        assert!(matches!(
            client.chat(vec![ContentPart::text("what?")]).await,
            Err(LlmError::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn test_caption_sends_cropped_png() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("data:image/png;base64,".into()),
                Matcher::Regex("detected a dog".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(COMPLETION)
            .create_async()
            .await;

        let client = LlmClient::new(Some("secret".into())).with_base_url(server.url());
        let hint = DetectionHint {
            class: Some("dog".into()),
            confidence: Some(0.9),
            bbox: Some(vec![1.0, 1.0, 5.0, 5.0]),
        };
        let caption = client
            .caption(&RgbImage::new(8, 8), &hint)
            .await
            .unwrap();

        assert_eq!(caption, "A cat.");
        mock.assert_async().await;
    }
}
