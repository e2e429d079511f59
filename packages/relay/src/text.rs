use std::sync::OnceLock;

use regex::Regex;

fn gateway_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\[reply_to_message_id:\s*\d+\]\]\s*").expect("valid gateway tag regex")
    })
}

fn volatile_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""(?:message_id|reply_to_message_id|date)"\s*:\s*"?\d+"?\s*,?\s*"#)
            .expect("valid volatile field regex")
    })
}

fn model_date_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-(?:\d{8}|latest)$").expect("valid model suffix regex"))
}

/// Remove gateway-only metadata tags from text flowing in either direction,
/// so the model never sees or echoes them. Idempotent.
pub fn strip_gateway_tags(text: &str) -> String {
    gateway_tag_re().replace_all(text, "").into_owned()
}

/// Reduce a system prompt to the part that is stable across turns of the same
/// chat: gateway tags and dynamic per-message fields (numeric message ids,
/// reply pointers, timestamps) are dropped before hashing.
pub fn stable_system_text(system: &str) -> String {
    let stripped = strip_gateway_tags(system);
    volatile_field_re().replace_all(&stripped, "").into_owned()
}

/// Normalize a client-supplied model id: drop an ecosystem prefix
/// (`anthropic/...`) and a trailing date or `latest` suffix, then collapse to
/// the bare tier name when one is recognizable.
pub fn normalize_model(model: &str) -> String {
    let tail = model.rsplit('/').next().unwrap_or(model);
    let trimmed = model_date_suffix_re().replace(tail, "").into_owned();
    let lower = trimmed.to_lowercase();
    for tier in ["opus", "sonnet", "haiku"] {
        if lower.contains(tier) {
            return tier.to_string();
        }
    }
    trimmed
}
