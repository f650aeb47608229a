//! Prompts for the LLM-backed rule-proposal oracle.
//!
//! Every prompt lives here so the wording can change without touching the
//! retry or validation logic, and so tests can inspect it directly.
//!
//! Callers can override the system prompt via
//! [`crate::oracle::LlmOracleConfig::system_prompt`].

use crate::oracle::ProposalRequest;

/// Default system prompt for proposing a conversion rule.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You write conversion rules that map extracted document content to nodes of an editor document schema.

You receive one content unit that no existing rule matched, up to two already-converted neighbouring nodes, and the node and mark types the schema defines.

Answer with ONE JSON object of this shape and nothing else:

{
  "description": "<one sentence>",
  "predicate": {
    "kind": "<content kind>",
    "text_pattern": "<regex over the unit text>",
    "font": "<font name>",
    "size": { "min": <number>, "max": <number> },
    "color": "<#rrggbb>",
    "within": "<container hint>"
  },
  "action": {
    "target": "<node or mark type>",
    "attrs": { "<attr>": { "from": "const", "value": <json> } | { "from": "level" | "text" | "media_ref" | "font" | "font_size" | "color" } },
    "policy": { "kind": "atomic" } | { "kind": "wrap", "inner": "<type>" } | { "kind": "container", "lead": "<type>", "group": "<group>" } | { "kind": "grid", "row": "<type>", "cell": "<type>", "inner": "<type>" },
    "marks": ["<mark type>"]
  }
}

Rules:
1. Omit predicate fields you do not need; an omitted field matches anything. Include at least one field.
2. The predicate must match the given unit. Prefer kind, font and size ranges over text patterns so the rule generalises to similar units.
3. "target" and every type you name must be one of the available types. Never invent types.
4. Fill every required attribute of the target.
5. Choose "container" only for types whose content expression takes further blocks after a lead child.
6. Do NOT wrap the JSON in code fences. Do NOT add commentary."#;

/// Build the user message for one proposal request.
pub fn proposal_request(request: &ProposalRequest) -> String {
    let unit = serde_json::to_string_pretty(&request.unit).unwrap_or_default();
    let neighbors = serde_json::to_string(&request.neighbors).unwrap_or_default();
    let types = serde_json::to_string(&request.available_types).unwrap_or_default();
    format!(
        "Unmatched unit:\n{unit}\n\nPreceding converted nodes:\n{neighbors}\n\nAvailable types:\n{types}\n"
    )
}
