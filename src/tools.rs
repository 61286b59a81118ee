use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};

/// Substrings that mean "the buffer may be the start of a tool-call block";
/// the stream interceptor stops word-flushing once one appears.
pub const BEGIN_MARKERS: &[&str] = &["<tool", "<mcp-request", "```"];

static MCP_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<mcp-request>\s*(.*?)\s*</mcp-request>").unwrap());

static TOOL_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<tool\s+name="([^"]+)"\s*>(.*?)</tool>"#).unwrap());

static PARAMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<params>\s*(.*?)\s*</params>").unwrap());

static KV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([A-Za-z0-9_]+)>([^<]*)</([A-Za-z0-9_]+)>").unwrap());

static BRACKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([A-Za-z0-9_.:-]+)((?:[ \t]+[^\[\]\s]+)*)\]").unwrap());

/// Raw parameter payload as it appeared on the wire; decoding is deferred to
/// execution so a malformed payload becomes a structured failure result
/// instead of aborting detection.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolParams {
    None,
    Json(String),
    KeyValues(Vec<(String, String)>),
    Args(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSyntax {
    McpBlock,
    ToolTag,
    Bracket,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub params: ToolParams,
    pub syntax: CallSyntax,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Envelope echoed back into conversation history.
    pub fn envelope(&self) -> String {
        let body = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"success":false,"error":"unserializable result"}"#.to_string());
        format!("<tool_output>{body}</tool_output>")
    }
}

/// A named external capability callable from a streamed response.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn call(&self, params: Value) -> Result<Value>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    aliases: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, tool: Arc<dyn Tool>) {
        self.tools.insert(name.to_string(), tool);
    }

    /// Maps a bracket-shorthand alias to a registered tool name.
    pub fn alias(&mut self, alias: &str, tool_name: &str) {
        self.aliases
            .insert(alias.to_string(), tool_name.to_string());
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    /// Scans `buffer` for the earliest complete, well-formed tool-call block
    /// in any supported syntax. Bracket shorthand only counts when its alias
    /// resolves, so ordinary bracketed prose is not misread as a call.
    pub fn detect(&self, buffer: &str) -> Option<ToolCall> {
        let mut best: Option<(usize, ToolCall)> = None;

        let mut consider = |start: usize, call: ToolCall| {
            let earlier = best.as_ref().is_none_or(|(s, _)| start < *s);
            if earlier {
                best = Some((start, call));
            }
        };

        if let Some(m) = MCP_BLOCK_RE.captures(buffer)
            && let Some(whole) = m.get(0)
            && let Some(call) = parse_mcp_body(m.get(1).map_or("", |g| g.as_str()))
        {
            consider(whole.start(), call);
        }

        if let Some(m) = TOOL_TAG_RE.captures(buffer)
            && let Some(whole) = m.get(0)
        {
            // Skip a tag that is itself the body of an mcp-request block; the
            // block match already covers it.
            let inside_mcp = MCP_BLOCK_RE
                .find(buffer)
                .is_some_and(|b| b.start() < whole.start() && whole.end() <= b.end());
            if !inside_mcp {
                let name = m.get(1).map_or("", |g| g.as_str()).to_string();
                let params = parse_tag_params(m.get(2).map_or("", |g| g.as_str()));
                consider(
                    whole.start(),
                    ToolCall {
                        name,
                        params,
                        syntax: CallSyntax::ToolTag,
                    },
                );
            }
        }

        for m in BRACKET_RE.captures_iter(buffer) {
            let Some(whole) = m.get(0) else { continue };
            let alias = m.get(1).map_or("", |g| g.as_str());
            let Some(tool_name) = self.resolve_alias(alias) else {
                continue;
            };
            let args: Vec<String> = m
                .get(2)
                .map_or("", |g| g.as_str())
                .split_whitespace()
                .map(String::from)
                .collect();
            let params = if args.is_empty() {
                ToolParams::None
            } else {
                ToolParams::Args(args)
            };
            consider(
                whole.start(),
                ToolCall {
                    name: tool_name.to_string(),
                    params,
                    syntax: CallSyntax::Bracket,
                },
            );
            break;
        }

        best.map(|(_, call)| call)
    }

    /// Decodes parameters and runs the tool. Every failure mode lands in a
    /// structured result so one bad invocation never takes down the session.
    pub async fn execute(&self, call: ToolCall) -> ToolResult {
        let params = match decode_params(call.params) {
            Ok(params) => params,
            Err(e) => return ToolResult::failure(e),
        };

        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResult::failure(format!("unknown tool '{}'", call.name));
        };

        match tool.call(params).await {
            Ok(value) => ToolResult::ok(value),
            Err(e) => ToolResult::failure(format!("{e:#}")),
        }
    }
}

fn parse_mcp_body(body: &str) -> Option<ToolCall> {
    // Body is either a <tool> tag or a bare JSON request object.
    if let Some(m) = TOOL_TAG_RE.captures(body) {
        return Some(ToolCall {
            name: m.get(1).map_or("", |g| g.as_str()).to_string(),
            params: parse_tag_params(m.get(2).map_or("", |g| g.as_str())),
            syntax: CallSyntax::McpBlock,
        });
    }
    let parsed: Value = serde_json::from_str(body).ok()?;
    let name = parsed.get("tool")?.as_str()?.to_string();
    let params = match parsed.get("params") {
        Some(p) => ToolParams::Json(p.to_string()),
        None => ToolParams::None,
    };
    Some(ToolCall {
        name,
        params,
        syntax: CallSyntax::McpBlock,
    })
}

fn parse_tag_params(body: &str) -> ToolParams {
    let Some(m) = PARAMS_RE.captures(body) else {
        return ToolParams::None;
    };
    let inner = m.get(1).map_or("", |g| g.as_str()).trim();
    if inner.is_empty() {
        return ToolParams::None;
    }
    if inner.starts_with('{') {
        // Decode is deferred; a truncated or invalid object becomes a
        // failure result at execution time.
        return ToolParams::Json(inner.to_string());
    }
    let pairs: Vec<(String, String)> = KV_RE
        .captures_iter(inner)
        .filter(|c| {
            c.get(1).map(|g| g.as_str()) == c.get(3).map(|g| g.as_str())
        })
        .map(|c| {
            (
                c.get(1).map_or("", |g| g.as_str()).to_string(),
                c.get(2).map_or("", |g| g.as_str()).to_string(),
            )
        })
        .collect();
    if pairs.is_empty() {
        ToolParams::None
    } else {
        ToolParams::KeyValues(pairs)
    }
}

fn decode_params(params: ToolParams) -> Result<Value, String> {
    match params {
        ToolParams::None => Ok(json!({})),
        ToolParams::Json(raw) => serde_json::from_str(&raw)
            .map_err(|e| format!("invalid tool parameters: {e}")),
        ToolParams::KeyValues(pairs) => {
            let mut object = serde_json::Map::new();
            for (key, value) in pairs {
                object.insert(key, json!(value));
            }
            Ok(Value::Object(object))
        }
        ToolParams::Args(args) => Ok(json!({ "args": args })),
    }
}

/// Whether the buffer so far could be the start of a tool-call block.
pub fn has_begin_marker(buffer: &str) -> bool {
    BEGIN_MARKERS.iter().any(|marker| buffer.contains(marker))
}
