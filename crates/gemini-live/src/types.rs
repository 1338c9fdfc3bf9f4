//! Wire types for the Gemini Live `BidiGenerateContent` WebSocket protocol.
//!
//! Client frames serialize as a JSON object with a single top-level key
//! (`setup`, `realtimeInput`, `clientContent`, `toolResponse`); server frames
//! carry one of `setupComplete`, `serverContent`, `toolCall` or `goAway`.

use serde::{Deserialize, Serialize};

// --- Client -> server ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input_config: Option<RealtimeInputConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_compression: Option<ContextWindowCompression>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_resolution: Option<MediaResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaResolution {
    #[serde(rename = "MEDIA_RESOLUTION_LOW")]
    Low,
    #[serde(rename = "MEDIA_RESOLUTION_MEDIUM")]
    Medium,
    #[serde(rename = "MEDIA_RESOLUTION_HIGH")]
    High,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    /// Selects one of the prebuilt voices by name.
    pub fn prebuilt(voice_name: &str) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.to_string(),
                },
            },
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub turn_coverage: TurnCoverage,
}

/// Whether inbound audio is always attributed to the current turn.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnCoverage {
    #[serde(rename = "TURN_INCLUDES_ALL_INPUT")]
    IncludesAllInput,
    #[serde(rename = "TURN_INCLUDES_ONLY_ACTIVITY")]
    OnlyActivity,
}

/// Bounds upstream context growth over long sessions.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindowCompression {
    pub trigger_tokens: u64,
    pub sliding_window: SlidingWindow,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SlidingWindow {
    pub target_tokens: u64,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Serialize, Debug)]
pub struct Content {
    pub role: String,
    pub parts: Vec<ContentPart>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ContentPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: serde_json::Value,
}

// --- Server -> client ---

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RawServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCallMessage>,
    pub go_away: Option<GoAway>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub turn_complete: Option<bool>,
    pub interrupted: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<ServerPart>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<Blob>,
    pub file_data: Option<FileData>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub file_uri: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCallMessage {
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

/// A tagged view of everything the server can send after setup, plus the
/// terminal conditions of the connection itself. Consumers match on this
/// exhaustively instead of probing optional fields.
#[derive(Debug)]
pub enum LiveEvent {
    Content(ServerContent),
    ToolCall(Vec<FunctionCall>),
    Error(String),
    Closed(Option<String>),
}

impl LiveEvent {
    /// Maps a parsed wire message onto an event. `setupComplete` is consumed
    /// by the connection handshake and yields nothing here; `goAway` is a
    /// warning, not a termination, and is likewise dropped after logging by
    /// the reader.
    pub fn from_raw(raw: RawServerMessage) -> Option<Self> {
        if let Some(content) = raw.server_content {
            return Some(LiveEvent::Content(content));
        }
        if let Some(tool_call) = raw.tool_call {
            return Some(LiveEvent::ToolCall(tool_call.function_calls));
        }
        None
    }
}
