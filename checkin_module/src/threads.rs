use crate::message_store::{MessageStore, MessageStoreError};

/// Resolve which conversation thread an inbound reply belongs to.
///
/// The subject is normalized by stripping a leading reply marker and
/// whitespace; a non-empty remainder is matched as a case-insensitive
/// substring against the sender's message history, most recent first. No
/// match (or an empty subject) means a new thread: the caller sets the
/// stored inbound message's thread id to its own id.
///
/// Substring matching can attach a reply to an unrelated older thread that
/// shares common words; that is the accepted heuristic here. In-Reply-To
/// chains appear in the headers but are not consistently populated by
/// clients, so they are not used for matching.
pub fn resolve(
    messages: &MessageStore,
    sender_id: &str,
    subject: &str,
) -> Result<Option<String>, MessageStoreError> {
    let normalized = normalize_subject(subject);
    if normalized.is_empty() {
        return Ok(None);
    }
    messages.latest_thread_with_subject(sender_id, &normalized)
}

/// Strip a leading case-insensitive "re:" marker and surrounding whitespace.
/// Stacked markers ("Re: RE: x") are stripped repeatedly.
pub fn normalize_subject(subject: &str) -> String {
    let mut value = subject.trim();
    loop {
        let lowered = value.to_lowercase();
        if let Some(rest) = lowered.strip_prefix("re:") {
            let skipped = value.len() - rest.len();
            value = value[skipped..].trim_start();
        } else {
            break;
        }
    }
    value.trim().to_string()
}
