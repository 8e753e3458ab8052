use std::path::Path;
use std::time::{Duration, Instant};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, CreateTranscriptionRequestArgs, ImageUrlArgs,
    ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{AnalysisError, AnalysisResult, FrameAnalyzer, RunSummary};
use crate::pipeline::record::FrameRecord;
use crate::source::Frame;
use crate::AnalysisConfig;

/// Pause applied for rate-limit responses that advertise no retry delay.
const DEFAULT_RATE_PAUSE: Duration = Duration::from_secs(1);

const FRAME_PROMPT: &str = "Analyze this video frame and answer as JSON with the fields \
{\"scene_description\": string, \"main_objects\": [string], \"actions\": [string], \
\"detected_text\": string, \"mood\": string}.";

const SUMMARY_PROMPT: &str = "You are given per-frame analyses of one video. Produce a JSON \
summary with the fields {\"title\": string, \"overview\": string, \"key_moments\": [string], \
\"mood\": string}. Cover the whole video chronologically in overview.";

/// Client for an OpenAI-compatible reasoning service: vision chat per frame,
/// audio transcription, and the run-level summary.
pub struct OpenAiAnalyzer {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiAnalyzer {
    pub fn new(cfg: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let key = cfg.api_key.as_ref().ok_or_else(|| AnalysisError::Fatal {
            reason: "no analysis api credential configured".into(),
        })?;
        let mut service = OpenAIConfig::new().with_api_key(key.reveal());
        if let Some(base) = &cfg.api_base {
            service = service.with_api_base(base);
        }
        Ok(Self {
            client: Client::with_config(service),
            model: cfg.model.clone(),
        })
    }

    fn vision_request(
        &self,
        frame: &Frame,
        ocr_context: Option<&str>,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let mut prompt = FRAME_PROMPT.to_string();
        if let Some(ctx) = ocr_context {
            prompt.push_str("\nText already recognized on screen: ");
            prompt.push_str(ctx);
        }
        let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(&frame.data));

        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(600_u32)
            .response_format(ResponseFormat::JsonObject)
            .messages([ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(vec![
                        ChatCompletionRequestUserMessageContentPart::Text(
                            ChatCompletionRequestMessageContentPartTextArgs::default()
                                .text(prompt)
                                .build()?,
                        ),
                        ChatCompletionRequestUserMessageContentPart::ImageUrl(
                            ChatCompletionRequestMessageContentPartImageArgs::default()
                                .image_url(ImageUrlArgs::default().url(data_url).build()?)
                                .build()?,
                        ),
                    ]))
                    .build()?,
            )])
            .build()
    }

    /// Transcribes an extracted audio track.
    #[instrument(skip(self))]
    pub async fn transcribe(&self, audio: &Path) -> Result<String, AnalysisError> {
        let audio_path = audio.display().to_string();
        let request = CreateTranscriptionRequestArgs::default()
            .file(audio_path.as_str())
            .model("whisper-1")
            .build()
            .map_err(classify)?;
        let response = self
            .client
            .audio()
            .transcribe(request)
            .await
            .map_err(classify)?;
        Ok(response.text)
    }

    /// Condenses the finalized records (and transcript, if any) into a
    /// run-level summary.
    #[instrument(skip_all, fields(records = records.len()))]
    pub async fn summarize(
        &self,
        records: &[FrameRecord],
        transcript: Option<&str>,
    ) -> Result<RunSummary, AnalysisError> {
        let digest = summary_digest(records, transcript);
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(900_u32)
            .response_format(ResponseFormat::JsonObject)
            .messages([
                ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(SUMMARY_PROMPT)
                        .build()
                        .map_err(classify)?,
                ),
                ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(digest)
                        .build()
                        .map_err(classify)?,
                ),
            ])
            .build()
            .map_err(classify)?;

        let response = self.client.chat().create(request).await.map_err(classify)?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(parse_summary(&content))
    }
}

#[async_trait]
impl FrameAnalyzer for OpenAiAnalyzer {
    #[instrument(skip(self, frame, ocr_context), fields(frame = frame.meta.index))]
    async fn analyze(
        &self,
        frame: &Frame,
        ocr_context: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let request = self.vision_request(frame, ocr_context).map_err(classify)?;
        let started = Instant::now();
        let response = self.client.chat().create(request).await.map_err(classify)?;
        let raw_latency = started.elapsed();

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!(
            frame = frame.meta.index,
            latency_ms = raw_latency.as_millis() as u64,
            "analysis complete"
        );
        Ok(FrameInsight::parse(&content).into_result(frame.meta.index, raw_latency))
    }
}

/// Shape the vision prompt asks for
#[derive(Debug, Default, Deserialize)]
struct FrameInsight {
    #[serde(default)]
    scene_description: String,
    #[serde(default)]
    main_objects: Vec<String>,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    mood: String,
}

impl FrameInsight {
    /// Falls back to the raw text as the description when the service strays
    /// from the requested JSON shape.
    fn parse(content: &str) -> Self {
        match serde_json::from_str(content) {
            Ok(insight) => insight,
            Err(_) => FrameInsight {
                scene_description: content.trim().to_string(),
                ..Default::default()
            },
        }
    }

    fn into_result(self, frame_index: u64, raw_latency: Duration) -> AnalysisResult {
        let mut labels = Vec::new();
        for label in self
            .main_objects
            .into_iter()
            .chain(self.actions)
            .chain(std::iter::once(self.mood).filter(|m| !m.is_empty()))
        {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        AnalysisResult {
            frame_index,
            description: self.scene_description,
            labels,
            raw_latency,
        }
    }
}

fn parse_summary(content: &str) -> RunSummary {
    match serde_json::from_str(content) {
        Ok(summary) => summary,
        Err(_) => RunSummary {
            overview: content.trim().to_string(),
            ..Default::default()
        },
    }
}

fn summary_digest(records: &[FrameRecord], transcript: Option<&str>) -> String {
    let mut digest = String::from("Per-frame analysis of the video:\n");
    for record in records {
        if let Some(analysis) = &record.analysis {
            digest.push_str(&format!(
                "At {:.1}s: {}\n",
                record.timestamp.as_secs_f64(),
                analysis.description
            ));
            if !analysis.labels.is_empty() {
                digest.push_str(&format!("Labels: {}\n", analysis.labels.join(", ")));
            }
        }
        if let Some(ocr) = &record.ocr {
            let text = ocr.joined_text();
            if !text.is_empty() {
                digest.push_str(&format!("On-screen text: {text}\n"));
            }
        }
    }
    if let Some(t) = transcript {
        digest.push_str(&format!("\nAudio transcript:\n{t}\n"));
    }
    digest
}

/// Maps service errors onto the retry taxonomy. Quota exhaustion and request
/// shape problems are permanent; rate limits carry any advertised delay;
/// everything else is worth another attempt.
fn classify(err: OpenAIError) -> AnalysisError {
    match err {
        OpenAIError::ApiError(api) => {
            let tag = api.r#type.clone().unwrap_or_default();
            if api.message.contains("insufficient_quota") || tag == "insufficient_quota" {
                return AnalysisError::Fatal {
                    reason: api.message,
                };
            }
            if tag == "invalid_request_error" {
                return AnalysisError::Fatal {
                    reason: api.message,
                };
            }
            if tag.contains("rate_limit") || api.message.to_ascii_lowercase().contains("rate limit")
            {
                return AnalysisError::RateLimited {
                    retry_after: retry_after_hint(&api.message).unwrap_or(DEFAULT_RATE_PAUSE),
                };
            }
            AnalysisError::transient(OpenAIError::ApiError(api))
        }
        other => AnalysisError::transient(other),
    }
}

/// Pulls "Please try again in 20s" style hints out of rate-limit messages.
fn retry_after_hint(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    let rest = lower.split("try again in ").nth(1)?;
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = token.parse().ok()?;
    let secs = if rest[token.len()..].starts_with("ms") {
        value / 1000.0
    } else {
        value
    };
    Some(Duration::from_secs_f64(secs.min(3600.0)))
}
