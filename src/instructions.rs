//! System instruction for the live session.
//!
//! The base instruction is loaded once at startup. With the `dynamic_greeting`
//! feature, each session gets a copy extended with a greeting block built from the
//! user's profile and previous summary.

use crate::backend::ProfileBackend;
use crate::summary::{GenerationRequest, Summarizer};
use std::path::Path;
use tracing::{error, info, warn};

pub const DEFAULT_INSTRUCTION: &str = "You are a helpful AI assistant.";

const FALLBACK_QUESTION: &str = "How have you been feeling since we last talked?";
const QUESTION_TEMPERATURE: f32 = 0.7;

/// Read the instruction file. UTF-8 (with or without BOM) is expected; anything else is
/// decoded lossily so the relay still starts. A missing file yields [`DEFAULT_INSTRUCTION`].
pub fn load_system_instruction(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("{} could not be read ({}); using the default instruction", path.display(), err);
            return DEFAULT_INSTRUCTION.to_string();
        }
    };

    decode_instruction(bytes, path)
}

fn decode_instruction(bytes: Vec<u8>, path: &Path) -> String {
    const BOM: &[u8] = b"\xEF\xBB\xBF";

    let (body, encoding) = match bytes.strip_prefix(BOM) {
        Some(rest) => (rest.to_vec(), "utf-8-sig"),
        None => (bytes, "utf-8"),
    };

    match String::from_utf8(body) {
        Ok(text) => {
            info!("Loaded {} using encoding: {}", path.display(), encoding);
            text
        }
        Err(err) => {
            warn!("{} is not valid UTF-8; decoding with replacement characters", path.display());
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    }
}

/// The base instruction extended with a welcome-back block for a returning user.
///
/// Any backend failure leaves the base instruction untouched.
pub async fn personalized_instruction(
    base: &str,
    user_id: &str,
    backend: &dyn ProfileBackend,
    summarizer: &dyn Summarizer,
) -> String {
    let profile = match backend.get_user(user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            info!(user = %user_id, "No profile yet; using the base instruction");
            return base.to_string();
        }
        Err(err) => {
            error!("Failed to fetch user profile for {}: {}", user_id, err);
            return base.to_string();
        }
    };

    let questions = match &profile.latest_summary {
        Some(summary) => follow_up_questions(summary, summarizer).await,
        None => String::new(),
    };

    let name = profile.name.as_deref().unwrap_or("there");
    let mut instruction = format!(
        "{}\n\n--- Conversation Context ---\n\
         Start the conversation by warmly welcoming the user back. Greet them by name: '{}'.\n",
        base, name
    );

    if questions.is_empty() {
        instruction.push_str(
            "After the greeting, ask a general open-ended question like 'What's been on your mind lately?' \
             or 'How have things been for you?'.\n",
        );
    } else {
        instruction.push_str(
            "After the greeting, gently ask one of the following questions to help them open up, \
             based on their previous conversation. Choose the one that feels most natural.\n",
        );
        instruction.push_str(&questions);
        instruction.push('\n');
    }
    instruction.push_str("--------------------------");

    info!(user = %user_id, "Generated personalized instruction");
    instruction
}

async fn follow_up_questions(summary: &serde_json::Value, summarizer: &dyn Summarizer) -> String {
    let pretty = serde_json::to_string_pretty(summary).unwrap_or_else(|_| summary.to_string());
    let prompt = format!(
        "Based on the following summary of a user's previous session, \
         generate 2-3 thoughtful, open-ended follow-up questions to help them continue exploring their feelings. \
         The questions should be gentle, encouraging, and in line with the persona of a supportive mentor. \
         Frame them as natural conversation starters.\n\n\
         PREVIOUS SUMMARY:\n{}\n\nQUESTIONS:",
        pretty
    );

    let request = GenerationRequest {
        prompt,
        system_instruction: None,
        temperature: QUESTION_TEMPERATURE,
        json_output: false,
    };

    match summarizer.generate(request).await {
        Ok(text) => text.trim().to_string(),
        Err(err) => {
            error!("Error generating follow-up questions: {}", err);
            FALLBACK_QUESTION.to_string()
        }
    }
}
