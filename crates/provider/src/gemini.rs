//! Gemini provider — Google Generative Language API.
//!
//! Images and text go through `models/{model}:generateContent`; video goes
//! through `models/{model}:predictLongRunning` followed by polling the
//! returned operation. Auth: `x-goog-api-key` with the leased pool key.
//!
//! Each method issues the calls for exactly one attempt. Failures are passed
//! through untouched for the orchestrator to classify.

use crate::http_util::ProviderHttp;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rendergate_config::ProviderSettings;
use rendergate_types::{
    ApiKey, GenError, GenerationProvider, ImageRequest, InlineImage, TextRequest, VideoRequest,
    traits::Result,
};
use rquest::Client;
use serde_json::{Value, json};
use std::time::Duration;

/// Generation operations against the Gemini REST API.
pub struct GeminiProvider {
    http: ProviderHttp,
    settings: ProviderSettings,
}

impl GeminiProvider {
    /// Creates a provider using `settings.base_url` and the configured models.
    #[must_use]
    pub fn new(http: Client, settings: ProviderSettings) -> Self {
        Self {
            http: ProviderHttp::new(http, settings.base_url.clone()),
            settings,
        }
    }

    async fn generate_images(
        &self,
        model: &str,
        key: &ApiKey,
        request: &ImageRequest,
        image_size: Option<&str>,
    ) -> Result<Vec<String>> {
        let body = image_body(request, image_size);
        let path = format!("models/{model}:generateContent");
        let mut uris = Vec::new();
        for _ in 0..request.count.max(1) {
            let resp = self.http.post_json(&path, key, &body).await?;
            uris.extend(parse_images(&resp)?);
        }
        Ok(uris)
    }

    async fn poll_operation(&self, key: &ApiKey, name: &str) -> Result<Value> {
        let interval = Duration::from_millis(self.settings.video_poll_interval_ms);
        for poll in 0..self.settings.video_poll_limit {
            tokio::time::sleep(interval).await;
            let op = self.http.get_json(name, key).await?;
            if op.get("done").and_then(Value::as_bool).unwrap_or(false) {
                tracing::debug!(operation = name, polls = poll + 1, "video operation finished");
                return Ok(op);
            }
        }
        Err(GenError::InvalidResponse(format!(
            "video operation {name} did not finish after {} polls",
            self.settings.video_poll_limit
        )))
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    async fn generate_image(&self, key: &ApiKey, request: &ImageRequest) -> Result<Vec<String>> {
        self.generate_images(&self.settings.image_model, key, request, None)
            .await
    }

    async fn generate_hd_image(
        &self,
        key: &ApiKey,
        request: &ImageRequest,
    ) -> Result<Vec<String>> {
        self.generate_images(
            &self.settings.hd_image_model,
            key,
            request,
            Some(request.resolution.as_str()),
        )
        .await
    }

    async fn generate_video(&self, key: &ApiKey, request: &VideoRequest) -> Result<String> {
        let path = format!("models/{}:predictLongRunning", self.settings.video_model);
        let started = self.http.post_json(&path, key, &video_body(request)).await?;
        let name = started
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GenError::InvalidResponse("operation name missing".into()))?;
        let done = self.poll_operation(key, name).await?;
        parse_video_operation(&done)
    }

    async fn generate_text(&self, key: &ApiKey, request: &TextRequest) -> Result<String> {
        let path = format!("models/{}:generateContent", self.settings.text_model);
        let resp = self.http.post_json(&path, key, &text_body(request)).await?;
        parse_text(&resp)
    }
}

// ── Request bodies ────────────────────────────────────────────────────────────

fn inline_part(image: &InlineImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": STANDARD.encode(&image.data),
        }
    })
}

/// Source image first, then references, then the prompt.
fn image_body(request: &ImageRequest, image_size: Option<&str>) -> Value {
    let mut parts: Vec<Value> = request
        .source
        .iter()
        .chain(&request.references)
        .map(inline_part)
        .collect();
    parts.push(json!({ "text": request.prompt }));

    let mut image_config = serde_json::Map::new();
    if let Some(ratio) = request.aspect_ratio {
        image_config.insert("aspectRatio".into(), json!(ratio.as_str()));
    }
    if let Some(size) = image_size {
        image_config.insert("imageSize".into(), json!(size));
    }

    let mut generation_config = json!({ "responseModalities": ["IMAGE"] });
    if !image_config.is_empty() {
        generation_config["imageConfig"] = Value::Object(image_config);
    }

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": generation_config,
    })
}

fn text_body(request: &TextRequest) -> Value {
    let mut parts: Vec<Value> = request.images.iter().map(inline_part).collect();
    parts.push(json!({ "text": request.prompt }));
    let mut body = json!({ "contents": [{ "role": "user", "parts": parts }] });
    if let Some(system) = &request.system {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    body
}

fn video_body(request: &VideoRequest) -> Value {
    let mut instance = json!({ "prompt": request.prompt });
    if let Some(image) = &request.source {
        instance["image"] = json!({
            "bytesBase64Encoded": STANDARD.encode(&image.data),
            "mimeType": image.mime_type,
        });
    }
    let mut parameters = serde_json::Map::new();
    if let Some(ratio) = request.aspect_ratio {
        parameters.insert("aspectRatio".into(), json!(ratio.as_str()));
    }
    json!({ "instances": [instance], "parameters": parameters })
}

// ── Response parsing ──────────────────────────────────────────────────────────

/// A 2xx body can still carry an `error` object; surface it raw.
fn check_error(resp: &Value) -> Result<()> {
    match resp.get("error") {
        Some(error) if error.is_object() => Err(GenError::Api {
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("provider returned an error")
                .to_string(),
            error: error.clone(),
        }),
        _ => Ok(()),
    }
}

fn parts(resp: &Value) -> impl Iterator<Item = &Value> {
    resp.get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.pointer("/content/parts").and_then(Value::as_array))
        .flatten()
}

fn blocked_reason(resp: &Value) -> Option<String> {
    if let Some(reason) = resp.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
        return Some(reason.to_string());
    }
    resp.pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
        .filter(|r| !matches!(*r, "STOP" | "MAX_TOKENS"))
        .map(str::to_string)
}

fn parse_images(resp: &Value) -> Result<Vec<String>> {
    check_error(resp)?;
    let uris: Vec<String> = parts(resp)
        .filter_map(|p| p.get("inlineData"))
        .filter_map(|d| {
            let data = d.get("data").and_then(Value::as_str)?;
            let mime = d
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            Some(format!("data:{mime};base64,{data}"))
        })
        .collect();
    if uris.is_empty() {
        let reason = blocked_reason(resp).unwrap_or_else(|| "no image in response".into());
        return Err(GenError::InvalidResponse(reason));
    }
    Ok(uris)
}

fn parse_text(resp: &Value) -> Result<String> {
    check_error(resp)?;
    let text: String = parts(resp)
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        let reason = blocked_reason(resp).unwrap_or_else(|| "no text in response".into());
        return Err(GenError::InvalidResponse(reason));
    }
    Ok(text)
}

fn parse_video_operation(op: &Value) -> Result<String> {
    check_error(op)?;
    let response = op
        .get("response")
        .ok_or_else(|| GenError::InvalidResponse("operation has no response".into()))?;
    let sample = response
        .pointer("/generateVideoResponse/generatedSamples/0/video")
        .or_else(|| response.pointer("/generatedVideos/0/video"));
    if let Some(uri) = sample.and_then(|v| v.get("uri")).and_then(Value::as_str) {
        return Ok(uri.to_string());
    }
    let filtered = response
        .pointer("/generateVideoResponse/raiMediaFilteredReasons/0")
        .and_then(Value::as_str);
    Err(GenError::InvalidResponse(
        filtered.map_or_else(|| "no video in response".into(), str::to_string),
    ))
}
