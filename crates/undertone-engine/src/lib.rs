use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use undertone_contracts::analysis::{
    validate_result, AnalysisInput, AnalysisResult, TimelineCue, MAX_MEDIA_BYTES,
};
use undertone_contracts::chat::{ChatMessage, Transcript};
use undertone_contracts::errors::{Result, SubtextError};
use undertone_contracts::events::EventWriter;
use undertone_contracts::scenarios::{Scenario, ScenarioCatalog};

pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const ANALYSIS_TEMPERATURE: f64 = 0.4;
const REQUEST_TIMEOUT_S: f64 = 60.0;
const TRANSPORT_RETRIES: usize = 2;
const RETRY_BACKOFF_S: f64 = 1.2;

const ANALYST_PERSONA: &str = "你是一位世界级的行为心理学家和沟通大师，尤其精通中国的人情世故、面子文化和职场潜规则。\n你的任务是“深度解码”对话背后的真实意图。";

const ANALYSIS_CHECKLIST: &str = "分析要求：\n1. 对比“字面意思”与“心理现实”，一针见血地指出对方真正想表达的内容。\n2. 如果提供的是媒体文件，请捕捉微表情、语气突变、尴尬的停顿或语速变化，并在 timelineAnalysis 中列出。\n3. 如果是文本，请分析标点符号、用词，并提取 keyExcerpts (关键句) 予以高亮。\n4. 给出“扎心指数”和“委婉程度”。\n5. 提供高情商的回复建议和行动指南。";

const OUTPUT_STYLE_NOTE: &str = "注意：所有输出必须使用**简体中文**。风格要犀利、精准。";

const MEDIA_INSPECTION_PROMPT: &str = "请分析此文件的语音语调、语速变化或面部表情微动作。";

const CHAT_PERSONA: &str = "你继续扮演行为心理学家。你之前已经对用户的输入进行了深度意图解码。\n现在，用户可能会针对分析结果提出疑问，或者询问更多细节。\n请基于之前的分析结果和原始输入，回答用户的追问。\n保持犀利、洞察力强的风格。";

const CHAT_ACKNOWLEDGMENT: &str =
    "好的，我已经了解了背景和分析结果。请问您有什么具体想问的细节，或者需要我进一步解释的地方吗？";

const CHAT_EMPTY_REPLY_FALLBACK: &str = "抱歉，我无法回答这个问题。";

const CHAT_TRANSPORT_APOLOGY: &str = "网络连接似乎断开了，请重试。";

/// A media file read into memory and made transport-safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineMedia {
    pub mime_type: String,
    pub data: String,
}

/// Everything the engine builds locally before touching the network.
///
/// Construction is deterministic: identical inputs always produce a
/// byte-identical instruction, schema, and parts list.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub system_instruction: String,
    pub schema: Value,
    pub parts: Vec<Value>,
}

pub fn build_system_instruction(scenario: &Scenario, background: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str(ANALYST_PERSONA);
    out.push_str("\n\n当前场景: ");
    out.push_str(&scenario.name);
    out.push_str(" (");
    out.push_str(&scenario.description);
    out.push_str(")。\n");
    out.push_str(&scenario.prompt_context);
    out.push_str("\n\n请分析用户提供的输入（文本、音频或视频）。\n\n");
    out.push_str(ANALYSIS_CHECKLIST);
    if let Some(background) = non_empty(background) {
        out.push_str("\n\n用户补充背景信息: \"");
        out.push_str(background);
        out.push_str("\"。请结合此背景进行分析。");
    }
    out.push_str("\n\n");
    out.push_str(OUTPUT_STYLE_NOTE);
    out
}

pub fn build_chat_system_instruction(scenario: &Scenario, background: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str(CHAT_PERSONA);
    out.push_str("\n场景: ");
    out.push_str(&scenario.name);
    if let Some(background) = non_empty(background) {
        out.push_str("\n背景: ");
        out.push_str(background);
    }
    out
}

/// The response schema declared to the model, mirroring
/// [`AnalysisResult`] field for field.
pub fn analysis_response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "surfaceMeaning": { "type": "STRING", "description": "字面意思总结" },
            "hiddenMotive": { "type": "STRING", "description": "深层动机或潜台词，揭示对方真实意图" },
            "heartbreakIndex": { "type": "NUMBER", "description": "扎心指数 (0-100)，真相有多残酷" },
            "euphemismLevel": { "type": "NUMBER", "description": "委婉程度/含蓄指数 (0-100)" },
            "emotionalTags": {
                "type": "ARRAY",
                "items": { "type": "STRING" },
                "description": "情绪标签，如 '阴阳怪气', '虚情假意', '不耐烦', '真诚' 等"
            },
            "communicationScore": { "type": "NUMBER", "description": "沟通段位/质量评分 (0-100)" },
            "missedCues": {
                "type": "ARRAY",
                "items": { "type": "STRING" },
                "description": "用户可能忽略的非语言信号或暗示"
            },
            "betterResponse": { "type": "STRING", "description": "高情商回复建议" },
            "actionableAdvice": { "type": "STRING", "description": "具体的行动建议和局势分析" },
            "keyExcerpts": {
                "type": "ARRAY",
                "items": { "type": "STRING" },
                "description": "关键原文摘录或高亮语句 (针对文本分析，提取最能体现情绪或潜台词的原句)"
            },
            "timelineAnalysis": {
                "type": "ARRAY",
                "description": "针对音视频的时间轴分析",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "timestamp": { "type": "STRING" },
                        "observation": { "type": "STRING" },
                        "type": { "type": "STRING", "enum": TimelineCue::WIRE_NAMES }
                    }
                }
            }
        },
        "required": ["surfaceMeaning", "hiddenMotive", "heartbreakIndex", "emotionalTags"],
    })
}

/// Read a media file into an inline base64 payload.
///
/// Fails before any network activity when the file is unreadable or
/// exceeds the declared ceiling.
pub fn encode_media_file(path: &Path, declared_mime: Option<&str>) -> Result<InlineMedia> {
    let metadata = fs::metadata(path).map_err(|err| {
        SubtextError::InvalidInput(format!("failed reading {}: {err}", path.display()))
    })?;
    ensure_media_within_ceiling(metadata.len())?;
    let bytes = fs::read(path).map_err(|err| {
        SubtextError::InvalidInput(format!("failed reading {}: {err}", path.display()))
    })?;
    let mime_type = non_empty(declared_mime)
        .map(str::to_string)
        .or_else(|| mime_for_path(path).map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(InlineMedia {
        mime_type,
        data: BASE64.encode(bytes),
    })
}

fn ensure_media_within_ceiling(len: u64) -> Result<()> {
    if len > MAX_MEDIA_BYTES {
        return Err(SubtextError::InvalidInput(format!(
            "media file is {len} bytes, over the {MAX_MEDIA_BYTES} byte ceiling"
        )));
    }
    Ok(())
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp3" => Some("audio/mpeg"),
        "wav" => Some("audio/wav"),
        "m4a" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "ogg" => Some("audio/ogg"),
        "flac" => Some("audio/flac"),
        "mp4" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "mkv" => Some("video/x-matroska"),
        _ => None,
    }
}

fn media_part(media: &InlineMedia) -> Value {
    json!({
        "inlineData": {
            "mimeType": media.mime_type,
            "data": media.data,
        }
    })
}

/// Assemble the full local request for one analysis call.
pub fn build_analysis_request(
    input: &AnalysisInput,
    scenario: &Scenario,
    background: Option<&str>,
) -> Result<AnalysisRequest> {
    let parts = match input {
        AnalysisInput::Text(text) => vec![json!({ "text": text })],
        AnalysisInput::Media { path, mime_type } => {
            let media = encode_media_file(path, mime_type.as_deref())?;
            vec![media_part(&media), json!({ "text": MEDIA_INSPECTION_PROMPT })]
        }
    };
    Ok(AnalysisRequest {
        system_instruction: build_system_instruction(scenario, background),
        schema: analysis_response_schema(),
        parts,
    })
}

/// Stable digest of a built request, logged alongside analysis events.
pub fn request_fingerprint(request: &AnalysisRequest) -> String {
    let canonical = json!({
        "system_instruction": request.system_instruction,
        "schema": request.schema,
        "parts": request.parts,
    });
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&canonical).unwrap_or_default());
    hex::encode(hasher.finalize())
}

fn analysis_payload(request: &AnalysisRequest) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": request.parts.clone(),
        }],
        "systemInstruction": { "parts": [{ "text": request.system_instruction.clone() }] },
        "generationConfig": {
            "temperature": ANALYSIS_TEMPERATURE,
            "responseMimeType": "application/json",
            "responseSchema": request.schema.clone(),
        },
    })
}

fn parse_analysis_result(text: &str) -> Result<AnalysisResult> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SubtextError::MalformedResponse(
            "model returned no analysis payload".to_string(),
        ));
    }
    serde_json::from_str(trimmed).map_err(|err| {
        SubtextError::MalformedResponse(format!(
            "analysis payload does not match the contract: {err}"
        ))
    })
}

/// Blocking client for the `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl GeminiClient {
    pub fn from_env(model: Option<String>) -> Self {
        let api_base = non_empty_env("GEMINI_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_key = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"));
        Self::new(api_base, api_key, model)
    }

    pub fn new(api_base: impl Into<String>, api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            http: HttpClient::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            SubtextError::Configuration("GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string())
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    /// One `generateContent` call; the credential check always precedes
    /// any network activity.
    pub fn generate(&self, payload: &Value) -> Result<Value> {
        let api_key = self.require_api_key()?.to_string();
        let endpoint = self.endpoint();
        let response = self.post_with_transport_retries(&endpoint, &api_key, payload)?;
        response_json_or_error(response)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse> {
        for attempt in 0..=TRANSPORT_RETRIES {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_S))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    if !is_retryable_transport_error(&raw) || attempt >= TRANSPORT_RETRIES {
                        return Err(SubtextError::Upstream(format!(
                            "generateContent request failed ({endpoint}): {raw}"
                        )));
                    }
                    let delay_s = RETRY_BACKOFF_S * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }

        unreachable!("transport retry loop should always return a response or error")
    }
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn response_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| SubtextError::Upstream(format!("response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(SubtextError::Upstream(format!(
            "generateContent failed ({code}): {}",
            truncate_text(&body, 512)
        )));
    }
    serde_json::from_str(&body).map_err(|_| {
        SubtextError::MalformedResponse("upstream returned an invalid JSON envelope".to_string())
    })
}

fn extract_reply_text(payload: &Value) -> String {
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    return text.to_string();
                }
            }
        }
    }
    String::new()
}

/// Opaque reference to the currently open chat session.
///
/// Handles from a previous analysis cycle go stale the moment a new
/// cycle starts; sends against them are rejected without touching the
/// transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    epoch: u64,
}

impl SessionHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Debug)]
struct ChatSession {
    epoch: u64,
    system_instruction: String,
    history: Vec<Value>,
}

fn chat_payload(session: &ChatSession) -> Value {
    json!({
        "contents": session.history.clone(),
        "systemInstruction": { "parts": [{ "text": session.system_instruction.clone() }] },
    })
}

/// Orchestrates one analysis cycle at a time: analyze, report, follow-up
/// chat. The remote API is stateless, so the engine keeps the full chat
/// history and resends it on every turn.
///
/// Methods take `&mut self`; one analysis and one chat turn can be in
/// flight at a time by construction.
pub struct SubtextEngine {
    catalog: ScenarioCatalog,
    client: GeminiClient,
    events_path: Option<PathBuf>,
    events: Option<EventWriter>,
    cycle_id: String,
    epoch: u64,
    transcript: Transcript,
    session: Option<ChatSession>,
    last_result: Option<AnalysisResult>,
    last_warnings: Vec<String>,
}

impl SubtextEngine {
    pub fn new(model: Option<String>, events_path: Option<PathBuf>) -> Self {
        Self::with_client_and_events(GeminiClient::from_env(model), events_path)
    }

    pub fn with_client(client: GeminiClient) -> Self {
        Self::with_client_and_events(client, None)
    }

    pub fn with_client_and_events(client: GeminiClient, events_path: Option<PathBuf>) -> Self {
        let cycle_id = Uuid::new_v4().to_string();
        let events = events_path
            .as_ref()
            .map(|path| EventWriter::new(path, cycle_id.clone()));
        Self {
            catalog: ScenarioCatalog::default(),
            client,
            events_path,
            events,
            cycle_id,
            epoch: 0,
            transcript: Transcript::new(),
            session: None,
            last_result: None,
            last_warnings: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        self.transcript.messages()
    }

    pub fn last_result(&self) -> Option<&AnalysisResult> {
        self.last_result.as_ref()
    }

    pub fn last_warnings(&self) -> &[String] {
        &self.last_warnings
    }

    /// Discard the current session, transcript, and report; the next
    /// analysis starts from a clean cycle.
    pub fn reset(&mut self) {
        self.invalidate_session();
    }

    /// Run one analysis. Any prior chat session and transcript are
    /// invalidated before the request is built, so no follow-up can land
    /// on a stale cycle.
    pub fn analyze(
        &mut self,
        input: &AnalysisInput,
        scenario_id: &str,
        background: Option<&str>,
    ) -> Result<AnalysisResult> {
        let scenario = self.scenario(scenario_id)?;
        self.invalidate_session();
        self.emit_event(
            "analysis_started",
            json!({
                "scenario": scenario.id,
                "modality": input.modality().as_str(),
                "model": self.client.model(),
            }),
        );

        let request = build_analysis_request(input, &scenario, background)
            .map_err(|err| self.fail_analysis(err))?;
        let fingerprint = request_fingerprint(&request);
        let started = Instant::now();

        let response = self
            .client
            .generate(&analysis_payload(&request))
            .map_err(|err| self.fail_analysis(err))?;
        let reply = extract_reply_text(&response);
        let mut result = parse_analysis_result(&reply).map_err(|err| self.fail_analysis(err))?;
        let warnings = validate_result(&mut result, input.modality())
            .map_err(|err| self.fail_analysis(err))?;

        self.last_result = Some(result.clone());
        self.last_warnings = warnings.clone();
        self.emit_event(
            "analysis_completed",
            json!({
                "fingerprint": fingerprint,
                "elapsed_s": started.elapsed().as_secs_f64(),
                "warnings": warnings,
            }),
        );
        Ok(result)
    }

    /// Seed a follow-up session with the original input and the
    /// validated report. Replaces any session already open.
    pub fn open_chat(
        &mut self,
        input: &AnalysisInput,
        scenario_id: &str,
        background: Option<&str>,
        result: &AnalysisResult,
    ) -> Result<SessionHandle> {
        let scenario = self.scenario(scenario_id)?;
        self.client.require_api_key()?;

        let result_json = serde_json::to_string(result).unwrap_or_default();
        let seed_parts = match input {
            AnalysisInput::Text(text) => vec![json!({
                "text": format!("原始输入文本: \"{text}\"\n\n之前的分析结果: {result_json}"),
            })],
            AnalysisInput::Media { path, mime_type } => {
                let media = encode_media_file(path, mime_type.as_deref())?;
                vec![
                    media_part(&media),
                    json!({ "text": format!("这是原始输入文件。之前的分析结果是：{result_json}") }),
                ]
            }
        };

        self.epoch += 1;
        self.session = Some(ChatSession {
            epoch: self.epoch,
            system_instruction: build_chat_system_instruction(&scenario, background),
            history: vec![
                json!({ "role": "user", "parts": seed_parts }),
                json!({ "role": "model", "parts": [{ "text": CHAT_ACKNOWLEDGMENT }] }),
            ],
        });
        self.emit_event(
            "chat_opened",
            json!({ "scenario": scenario.id, "epoch": self.epoch }),
        );
        Ok(SessionHandle { epoch: self.epoch })
    }

    /// Send one follow-up turn. Transport failures are absorbed: the
    /// transcript records the user turn plus a fixed apology, the failed
    /// exchange is not replayed to the model, and the apology is
    /// returned as the reply.
    pub fn send_chat(&mut self, handle: SessionHandle, text: &str) -> Result<String> {
        let Some(mut session) = self.session.take() else {
            return Err(SubtextError::Session(
                "no analysis has completed yet".to_string(),
            ));
        };
        if session.epoch != handle.epoch {
            self.session = Some(session);
            return Err(SubtextError::Session("stale session handle".to_string()));
        }

        self.transcript.push_user(text);
        session
            .history
            .push(json!({ "role": "user", "parts": [{ "text": text }] }));

        let reply = match self.client.generate(&chat_payload(&session)) {
            Ok(response) => {
                let text = extract_reply_text(&response);
                let reply = if text.trim().is_empty() {
                    CHAT_EMPTY_REPLY_FALLBACK.to_string()
                } else {
                    text
                };
                session
                    .history
                    .push(json!({ "role": "model", "parts": [{ "text": reply.clone() }] }));
                self.transcript.push_model(&reply);
                self.emit_event("chat_turn", json!({ "epoch": session.epoch }));
                reply
            }
            Err(err) => {
                session.history.pop();
                self.transcript.push_model(CHAT_TRANSPORT_APOLOGY);
                self.emit_event(
                    "chat_turn_failed",
                    json!({ "epoch": session.epoch, "error": err.to_string() }),
                );
                CHAT_TRANSPORT_APOLOGY.to_string()
            }
        };

        self.session = Some(session);
        Ok(reply)
    }

    fn scenario(&self, scenario_id: &str) -> Result<Scenario> {
        self.catalog
            .get(scenario_id)
            .cloned()
            .ok_or_else(|| SubtextError::InvalidInput(format!("unknown scenario '{scenario_id}'")))
    }

    fn invalidate_session(&mut self) {
        self.epoch += 1;
        if self.session.take().is_some() {
            self.emit_event("session_invalidated", json!({ "epoch": self.epoch }));
        }
        self.transcript.clear();
        self.last_result = None;
        self.last_warnings.clear();
        self.cycle_id = Uuid::new_v4().to_string();
        self.events = self
            .events_path
            .as_ref()
            .map(|path| EventWriter::new(path, self.cycle_id.clone()));
    }

    fn fail_analysis(&self, err: SubtextError) -> SubtextError {
        self.emit_event("analysis_failed", json!({ "error": err.to_string() }));
        err
    }

    fn emit_event(&self, event_type: &str, payload: Value) {
        if let Some(events) = &self.events {
            events.emit(event_type, map_object(payload)).ok();
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::{json, Value};
    use undertone_contracts::analysis::{AnalysisInput, MAX_MEDIA_BYTES};
    use undertone_contracts::chat::ChatRole;
    use undertone_contracts::errors::SubtextError;
    use undertone_contracts::scenarios::ScenarioCatalog;

    use super::*;

    const SAMPLE_TEXT: &str = "老板说这个方案不错，回去再想想";

    fn workplace() -> Scenario {
        ScenarioCatalog::default()
            .get("workplace_meeting")
            .cloned()
            .expect("preset present")
    }

    fn conforming_report() -> Value {
        json!({
            "surfaceMeaning": "方案可以，稍后再定。",
            "hiddenMotive": "委婉否定，等你自己知难而退。",
            "heartbreakIndex": 82.0,
            "euphemismLevel": 90.0,
            "emotionalTags": ["画大饼", "阴阳怪气"],
            "communicationScore": 35.0,
            "betterResponse": "好的老板，我整理两版对比明天发您。",
            "actionableAdvice": "主动追问具体顾虑，别等回复。",
            "keyExcerpts": ["回去再想想"],
        })
    }

    fn envelope_with_text(text: &str) -> String {
        json!({
            "candidates": [{
                "content": { "parts": [{ "text": text }] }
            }]
        })
        .to_string()
    }

    fn mock_generate(server: &mut mockito::Server, body: String) -> mockito::Mock {
        server
            .mock("POST", "/models/gemini-3-flash-preview:generateContent")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create()
    }

    fn engine_against(server: &mockito::Server) -> SubtextEngine {
        SubtextEngine::with_client(GeminiClient::new(
            server.url(),
            Some("test-key".to_string()),
            None,
        ))
    }

    #[test]
    fn system_instruction_embeds_scenario_and_background() {
        let scenario = workplace();
        let instruction = build_system_instruction(&scenario, Some("他是我的直属领导"));
        assert!(instruction.contains(&scenario.prompt_context));
        assert!(instruction.contains("职场生存"));
        assert!(instruction.contains("他是我的直属领导"));

        let without = build_system_instruction(&scenario, None);
        assert!(!without.contains("用户补充背景信息"));
        assert_eq!(without, build_system_instruction(&scenario, Some("  ")));
    }

    #[test]
    fn request_construction_is_deterministic() {
        let scenario = workplace();
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let first = build_analysis_request(&input, &scenario, Some("同事也在场")).expect("builds");
        let second = build_analysis_request(&input, &scenario, Some("同事也在场")).expect("builds");

        assert_eq!(
            serde_json::to_string(&analysis_payload(&first)).expect("serializes"),
            serde_json::to_string(&analysis_payload(&second)).expect("serializes"),
        );
        assert_eq!(request_fingerprint(&first), request_fingerprint(&second));

        let other = build_analysis_request(&input, &scenario, None).expect("builds");
        assert_ne!(request_fingerprint(&first), request_fingerprint(&other));
    }

    #[test]
    fn schema_declares_required_fields_and_cue_names() {
        let schema = analysis_response_schema();
        assert_eq!(
            schema["required"],
            json!(["surfaceMeaning", "hiddenMotive", "heartbreakIndex", "emotionalTags"])
        );
        assert_eq!(
            schema["properties"]["timelineAnalysis"]["items"]["properties"]["type"]["enum"],
            json!(["speech_rate", "tone", "pause", "expression"])
        );
    }

    #[test]
    fn media_request_carries_inline_data_and_inspection_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("clip.mp4");
        std::fs::write(&path, b"fake mp4 bytes").expect("writes");

        let input = AnalysisInput::media(&path, None);
        let request = build_analysis_request(&input, &workplace(), None).expect("builds");
        assert_eq!(request.parts.len(), 2);
        assert_eq!(request.parts[0]["inlineData"]["mimeType"], json!("video/mp4"));
        assert_eq!(request.parts[1]["text"], json!(MEDIA_INSPECTION_PROMPT));
    }

    #[test]
    fn encoder_round_trips_file_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("voice.wav");
        let mut file = std::fs::File::create(&path).expect("creates");
        let bytes: Vec<u8> = (0u16..2048).map(|value| (value % 251) as u8).collect();
        file.write_all(&bytes).expect("writes");

        let media = encode_media_file(&path, Some("audio/wav")).expect("encodes");
        assert_eq!(media.mime_type, "audio/wav");
        let decoded = BASE64.decode(media.data.as_bytes()).expect("decodes");
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn encoder_rejects_unreadable_and_oversize_media() {
        let err = encode_media_file(Path::new("/nonexistent/clip.mp4"), None).unwrap_err();
        assert!(matches!(err, SubtextError::InvalidInput(_)));

        assert!(ensure_media_within_ceiling(MAX_MEDIA_BYTES).is_ok());
        let err = ensure_media_within_ceiling(MAX_MEDIA_BYTES + 1).unwrap_err();
        assert!(matches!(err, SubtextError::InvalidInput(_)));
    }

    #[test]
    fn missing_credential_fails_before_any_network_call() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/models/gemini-3-flash-preview:generateContent")
            .match_query(mockito::Matcher::Any)
            .expect(0)
            .with_status(200)
            .with_body(envelope_with_text("{}"))
            .create();

        let mut engine =
            SubtextEngine::with_client(GeminiClient::new(server.url(), None, None));
        let input = AnalysisInput::text(SAMPLE_TEXT);

        let err = engine.analyze(&input, "workplace_meeting", None).unwrap_err();
        assert!(matches!(err, SubtextError::Configuration(_)));

        let result: AnalysisResult =
            serde_json::from_value(conforming_report()).expect("parses");
        let err = engine
            .open_chat(&input, "workplace_meeting", None, &result)
            .unwrap_err();
        assert!(matches!(err, SubtextError::Configuration(_)));
        mock.assert();
    }

    #[test]
    fn analyze_validates_a_conforming_reply() {
        let mut server = mockito::Server::new();
        let mock = mock_generate(&mut server, envelope_with_text(&conforming_report().to_string()));

        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let result = engine
            .analyze(&input, "workplace_meeting", None)
            .expect("analysis succeeds");

        assert!(!result.hidden_motive.trim().is_empty());
        assert!((0.0..=100.0).contains(&result.heartbreak_index));
        assert!(!result.emotional_tags.is_empty());
        assert_eq!(engine.last_result(), Some(&result));
        mock.assert();
    }

    #[test]
    fn analyze_rejects_an_empty_payload() {
        let mut server = mockito::Server::new();
        let mock = mock_generate(&mut server, json!({ "candidates": [] }).to_string());

        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let err = engine.analyze(&input, "workplace_meeting", None).unwrap_err();
        assert!(matches!(err, SubtextError::MalformedResponse(_)));
        assert!(engine.last_result().is_none());
        mock.assert();
    }

    #[test]
    fn analyze_rejects_a_nonconforming_payload() {
        let mut server = mockito::Server::new();
        let mock = mock_generate(
            &mut server,
            envelope_with_text(&json!({ "surfaceMeaning": "客气话" }).to_string()),
        );

        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let err = engine.analyze(&input, "workplace_meeting", None).unwrap_err();
        assert!(matches!(err, SubtextError::MalformedResponse(_)));
        assert!(engine.last_result().is_none());
        mock.assert();
    }

    #[test]
    fn analyze_rejects_out_of_range_scores() {
        let mut server = mockito::Server::new();
        let mut report = conforming_report();
        report["heartbreakIndex"] = json!(140.0);
        let mock = mock_generate(&mut server, envelope_with_text(&report.to_string()));

        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let err = engine.analyze(&input, "workplace_meeting", None).unwrap_err();
        assert!(matches!(err, SubtextError::MalformedResponse(_)));
        mock.assert();
    }

    #[test]
    fn send_before_open_is_a_session_error_and_leaves_transcript_alone() {
        let server = mockito::Server::new();
        let mut engine = engine_against(&server);

        let err = engine
            .send_chat(SessionHandle { epoch: 1 }, "他什么意思？")
            .unwrap_err();
        assert!(matches!(err, SubtextError::Session(_)));
        assert!(engine.transcript().is_empty());
    }

    #[test]
    fn chat_round_trip_appends_both_turns() {
        let mut server = mockito::Server::new();
        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let result: AnalysisResult =
            serde_json::from_value(conforming_report()).expect("parses");
        let handle = engine
            .open_chat(&input, "workplace_meeting", None, &result)
            .expect("opens");

        let mock = mock_generate(&mut server, envelope_with_text("他在试探你的态度。"));
        let reply = engine.send_chat(handle, "他到底什么意思？").expect("sends");
        assert_eq!(reply, "他在试探你的态度。");

        let transcript = engine.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, ChatRole::User);
        assert_eq!(transcript[0].content, "他到底什么意思？");
        assert_eq!(transcript[1].role, ChatRole::Model);
        mock.assert();
    }

    #[test]
    fn empty_chat_reply_falls_back_to_fixed_string() {
        let mut server = mockito::Server::new();
        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let result: AnalysisResult =
            serde_json::from_value(conforming_report()).expect("parses");
        let handle = engine
            .open_chat(&input, "workplace_meeting", None, &result)
            .expect("opens");

        let mock = mock_generate(&mut server, json!({ "candidates": [] }).to_string());
        let reply = engine.send_chat(handle, "然后呢？").expect("sends");
        assert_eq!(reply, CHAT_EMPTY_REPLY_FALLBACK);
        mock.assert();
    }

    #[test]
    fn chat_transport_failure_is_absorbed_as_an_apology_turn() {
        let mut server = mockito::Server::new();
        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let result: AnalysisResult =
            serde_json::from_value(conforming_report()).expect("parses");
        let handle = engine
            .open_chat(&input, "workplace_meeting", None, &result)
            .expect("opens");

        let mock = server
            .mock("POST", "/models/gemini-3-flash-preview:generateContent")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("upstream exploded")
            .create();
        let reply = engine.send_chat(handle, "还在吗？").expect("absorbed");
        assert_eq!(reply, CHAT_TRANSPORT_APOLOGY);

        let transcript = engine.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].content, CHAT_TRANSPORT_APOLOGY);
        mock.assert();
    }

    #[test]
    fn new_analysis_invalidates_the_open_session() {
        let mut server = mockito::Server::new();
        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let result: AnalysisResult =
            serde_json::from_value(conforming_report()).expect("parses");
        let stale = engine
            .open_chat(&input, "workplace_meeting", None, &result)
            .expect("opens");

        let mock = mock_generate(&mut server, envelope_with_text(&conforming_report().to_string()));
        engine
            .analyze(&input, "workplace_meeting", None)
            .expect("second cycle");
        mock.assert();

        let err = engine.send_chat(stale, "上一个话题呢？").unwrap_err();
        assert!(matches!(err, SubtextError::Session(_)));
        assert!(engine.transcript().is_empty());
    }

    #[test]
    fn reopening_chat_invalidates_the_previous_handle() {
        let server = mockito::Server::new();
        let mut engine = engine_against(&server);
        let input = AnalysisInput::text(SAMPLE_TEXT);
        let result: AnalysisResult =
            serde_json::from_value(conforming_report()).expect("parses");

        let first = engine
            .open_chat(&input, "workplace_meeting", None, &result)
            .expect("opens");
        let second = engine
            .open_chat(&input, "workplace_meeting", None, &result)
            .expect("reopens");
        assert_ne!(first.epoch(), second.epoch());

        let err = engine.send_chat(first, "还记得我吗？").unwrap_err();
        assert!(matches!(err, SubtextError::Session(_)));
        assert!(engine.transcript().is_empty());
    }

    #[test]
    fn events_log_analysis_lifecycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events_path = temp.path().join("events.jsonl");
        let mut server = mockito::Server::new();
        let mock = mock_generate(&mut server, envelope_with_text(&conforming_report().to_string()));

        let mut engine = SubtextEngine::with_client_and_events(
            GeminiClient::new(server.url(), Some("test-key".to_string()), None),
            Some(events_path.clone()),
        );
        let input = AnalysisInput::text(SAMPLE_TEXT);
        engine
            .analyze(&input, "workplace_meeting", None)
            .expect("analysis succeeds");
        mock.assert();

        let content = std::fs::read_to_string(&events_path).expect("events written");
        let types: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert!(types.contains(&"analysis_started".to_string()));
        assert!(types.contains(&"analysis_completed".to_string()));
    }
}
