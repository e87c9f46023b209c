//! Pure lexical detectors over message text. No I/O here so these can be
//! exercised exhaustively in tests.

use regex::Regex;
use std::sync::OnceLock;

fn affirmation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(yes|yeah|yep|yup|sure|ok(ay)?|sounds good|let'?s do it|i'?m in|count me in|absolutely|definitely)\b",
        )
        .unwrap()
    })
}

fn goal_intent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:i\s+want\s+to|i'?m\s+going\s+to|i\s+will|my\s+goal\s+is(?:\s+to)?|i\s+plan\s+to|i'?d\s+like\s+to)\s+(.{3,200}?)(?:[.!?\n]|$)")
            .unwrap()
    })
}

/// Does the message open with an affirmation ("yes", "sounds good", ...)?
pub fn is_affirmation(text: &str) -> bool {
    affirmation_regex().is_match(text)
}

/// Does outbound copy mention group accountability? Used to decide whether a
/// bare "yes" reply is confirming a group invitation.
pub fn mentions_group_accountability(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("group accountability")
        || lowered.contains("accountability group")
        || (lowered.contains("group") && lowered.contains("accountab"))
}

/// Scan free chat for goal-intent phrasing ("I want to ...", "my goal is ...")
/// and return the stated goal span, trimmed.
pub fn detect_goal_intent(text: &str) -> Option<String> {
    let captures = goal_intent_regex().captures(text)?;
    let span = captures.get(1)?.as_str().trim();
    let span = span.trim_end_matches(['.', '!', '?']).trim();
    if span.is_empty() {
        None
    } else {
        Some(span.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmations_match_common_openers() {
        assert!(is_affirmation("Yes!"));
        assert!(is_affirmation("  yeah, let's do it"));
        assert!(is_affirmation("Sounds good to me"));
        assert!(is_affirmation("I'm in"));
        assert!(!is_affirmation("No thanks"));
        assert!(!is_affirmation("Maybe later"));
        // "yesterday" must not count as "yes"
        assert!(!is_affirmation("yesterday was rough"));
    }

    #[test]
    fn group_mentions_detected_in_outbound_copy() {
        assert!(mentions_group_accountability(
            "Would you like to try group accountability with two others?"
        ));
        assert!(mentions_group_accountability(
            "We can set up an accountability group for you."
        ));
        assert!(!mentions_group_accountability("Keep up the great work!"));
    }

    #[test]
    fn goal_intent_extracts_the_stated_span() {
        assert_eq!(
            detect_goal_intent("I want to run a 5k before October.").as_deref(),
            Some("run a 5k before October")
        );
        assert_eq!(
            detect_goal_intent("honestly my goal is to write every morning").as_deref(),
            Some("write every morning")
        );
        assert_eq!(
            detect_goal_intent("I'm going to read two books this month!").as_deref(),
            Some("read two books this month")
        );
    }

    #[test]
    fn goal_intent_ignores_plain_chat() {
        assert_eq!(detect_goal_intent("Had a busy week, nothing new."), None);
        assert_eq!(detect_goal_intent(""), None);
    }

    #[test]
    fn goal_intent_stops_at_sentence_boundary() {
        let got = detect_goal_intent("I want to learn guitar. Also my cat is sick.");
        assert_eq!(got.as_deref(), Some("learn guitar"));
    }
}
