//! Prompt construction for end-of-session summaries.

use crate::session::{Role, Turn};
use chrono::Utc;
use serde_json::{json, Value};

/// System instruction sent with every summary request.
pub const SUMMARY_SYSTEM_NOTE: &str = "You are YouthGuide, a supportive, empathetic AI mentor for young people. \
Summarize the user's full conversation in a youth wellness context. \
You must NOT provide any medical diagnosis. \
Detect safety concerns and reflect them as flags only. \
Return STRICT JSON only, with no markdown, no code fences and no extra text.";

const TEXT_MODEL_FALLBACK: &str = "gemini-1.5-flash";
const TEXT_MODEL_MODERN: &str = "gemini-2.0-flash-exp";

/// `ROLE: text` per turn, in transcript order. Blank turns are skipped.
pub fn flatten_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .filter_map(|turn| {
            let text = turn.text.trim();
            (!text.is_empty()).then(|| format!("{}: {}", turn.role.as_str().to_uppercase(), text))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The JSON shape the summarizer is asked to fill.
pub fn schema_hint(session_handle: Option<&str>, wellness_metrics: bool) -> Value {
    let mut schema = json!({
        "session_id": session_handle.unwrap_or_default(),
        "generated_at_utc": Utc::now().to_rfc3339(),
        "language": "auto",
        "summary": "",
        "main_points": [],
        "emotions_themes": [],
        "stressors": [],
        "protective_factors": [],
        "coping_strategies_discussed": [],
        "goals_or_hopes": [],
        "action_items_suggested": [],
        "risk_flags": {
            "mentions_self_harm": false,
            "mentions_harming_others": false,
            "mentions_abuse_or_unsafe": false,
            "urgent_support_recommended": false
        },
        "suggestions_non_clinical": []
    });

    if wellness_metrics {
        if let Some(fields) = schema.as_object_mut() {
            fields.insert("mood".into(), json!(""));
            fields.insert("mood_percentage".into(), json!(0));
            fields.insert("energy_level".into(), json!(0));
            fields.insert("stress_level".into(), json!(0));
            fields.insert("mood_stability".into(), json!(""));
            fields.insert("mood_calmness".into(), json!(""));
            fields.insert("progress_analysis".into(), json!(""));
        }
    }

    schema
}

/// The user prompt: instructions, prior context, schema and the flattened transcript.
pub fn build_summary_prompt(previous_summary: &str, schema: &Value, transcript: &str, wellness_metrics: bool) -> String {
    let mut prompt = String::from(
        "Analyze the following conversation transcript and combine it with the previous summary to create an updated summary. \
         Focus on the youth's wellness state and the core points discussed. \
         Infer language if not explicit. ",
    );

    if wellness_metrics {
        prompt.push_str(
            "If a previous summary is provided, analyze the user's progress over time in the 'progress_analysis' field. \
             Analyze the overall mood of the user based on their messages and provide: \
             a brief description in 'mood' (e.g. positive, neutral, anxious, hopeful); \
             'mood_percentage' from -100 to 100 (negative mood below 0, neutral at 0); \
             'energy_level' from 0 (very low) to 100 (very high); \
             'stress_level' from 0 (none) to 100 (extreme); \
             'mood_stability' (e.g. stable, fluctuating, improving, declining); \
             'mood_calmness' (e.g. calm, anxious, agitated, relaxed). ",
        );
    }

    let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    prompt.push_str("Fill the provided JSON schema faithfully and only return the JSON object.\n\n");
    prompt.push_str(&format!("PREVIOUS_SUMMARY:\n{}\n\n", previous_summary));
    prompt.push_str(&format!("JSON_SCHEMA_EXAMPLE:\n{}\n\n", schema_text));
    prompt.push_str(&format!("TRANSCRIPT:\n{}", transcript));
    prompt
}

/// A name volunteered in the first user turn that says "my name is ...".
pub fn volunteered_name(turns: &[Turn]) -> Option<String> {
    const PHRASE: &str = "my name is";

    turns
        .iter()
        .filter(|turn| turn.role == Role::User)
        .map(|turn| turn.text.to_lowercase())
        .find(|text| text.contains(PHRASE))
        .and_then(|text| {
            let rest = text.rsplit(PHRASE).next().unwrap_or_default();
            let name = rest.trim().trim_end_matches(&['.', '!', '?', ','][..]).trim();
            (!name.is_empty()).then(|| name.to_string())
        })
}

/// A text model that accepts `generateContent`, derived from the live model name.
///
/// Live, native-audio and realtime models reject plain text generation.
pub fn pick_summarizer_model(live_model: &str) -> String {
    let model = live_model.to_lowercase();

    if model.contains("live") || model.contains("native-audio") || model.contains("realtime") {
        if model.contains("2.5") || model.contains("2-5") || model.contains("2.0") || model.contains("2-") {
            return TEXT_MODEL_MODERN.to_string();
        }
        return TEXT_MODEL_FALLBACK.to_string();
    }

    if live_model.trim().is_empty() {
        TEXT_MODEL_FALLBACK.to_string()
    } else {
        live_model.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, text: &str) -> Turn {
        Turn { role, text: text.into(), ts: Utc::now() }
    }

    #[test]
    fn test_flatten_transcript() {
        let turns = vec![
            turn(Role::User, " hi "),
            turn(Role::Assistant, "hello, how are you?"),
            turn(Role::User, "   "),
        ];
        assert_eq!(flatten_transcript(&turns), "USER: hi\nASSISTANT: hello, how are you?");
    }

    #[test]
    fn test_volunteered_name() {
        let turns = vec![
            turn(Role::Assistant, "my name is Puck"),
            turn(Role::User, "hello"),
            turn(Role::User, "my name is Sam."),
            turn(Role::User, "my name is Alex"),
        ];
        assert_eq!(volunteered_name(&turns).as_deref(), Some("sam"));
        assert_eq!(volunteered_name(&[turn(Role::User, "My name is")]), None);
        assert_eq!(volunteered_name(&[]), None);
    }

    #[test]
    fn test_schema_hint_wellness_toggle() {
        let full = schema_hint(Some("h1"), true);
        let compact = schema_hint(None, false);

        assert_eq!(full["session_id"], "h1");
        assert!(full.get("mood_percentage").is_some());
        assert!(compact.get("mood_percentage").is_none());
        assert!(compact.get("risk_flags").is_some());
    }

    #[test]
    fn test_prompt_carries_context() {
        let prompt = build_summary_prompt("felt low last week", &schema_hint(None, false), "USER: hi", false);
        assert!(prompt.contains("PREVIOUS_SUMMARY:\nfelt low last week"));
        assert!(prompt.ends_with("TRANSCRIPT:\nUSER: hi"));
        assert!(!prompt.contains("mood_percentage"));
    }

    #[test]
    fn test_pick_summarizer_model() {
        assert_eq!(pick_summarizer_model("gemini-live-2.5-flash-preview"), "gemini-2.0-flash-exp");
        assert_eq!(pick_summarizer_model("gemini-2.0-flash-live-001"), "gemini-2.0-flash-exp");
        assert_eq!(pick_summarizer_model("some-realtime-model"), "gemini-1.5-flash");
        assert_eq!(pick_summarizer_model("gemini-2.5-flash"), "gemini-2.5-flash");
        assert_eq!(pick_summarizer_model(""), "gemini-1.5-flash");
    }
}
