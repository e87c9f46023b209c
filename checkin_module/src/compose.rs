//! Decides the literal text of the next outbound message: fixed copy for
//! the non-AI paths, and assembly rules for model-composed replies.

use chrono::NaiveDate;

use crate::extractor::CheckinComposition;

/// Fixed, non-AI fallback sent when extraction fails terminally. Generic on
/// purpose: no internal error detail ever reaches a member's inbox.
pub const FALLBACK_MESSAGE: &str = "Thanks for your note! I'm having trouble reading messages \
right now, so I couldn't process this one. Please send it again in a little while.";

/// First contact from an unknown address: point at signup.
pub fn intro_message(signup_base_url: &str, email: &str) -> String {
    format!(
        "Hi! I'm your accountability partner. I'd love to help you set and hit a weekly goal.\n\n\
         To get started, create your account here: {}/signup?email={}\n\n\
         I'll hold on to this message so we can pick up right where you left off.",
        signup_base_url.trim_end_matches('/'),
        urlencoding::encode(email)
    )
}

/// Subsequent contact from an address that still has no account.
pub fn reminder_message(signup_base_url: &str, email: &str) -> String {
    format!(
        "Good to hear from you again! You haven't finished signing up yet, so I can't track \
         goals for you. Finish up here: {}/signup?email={}",
        signup_base_url.trim_end_matches('/'),
        urlencoding::encode(email)
    )
}

/// Welcome sent the moment onboarding completes.
pub fn welcome_message(first_name: &str, goal_description: &str, due_date: NaiveDate) -> String {
    format!(
        "Welcome aboard, {}! Your first goal is set: \"{}\", due Sunday {}. \
         I'll check in with you each week. Just reply to my emails with how it's going.",
        first_name,
        goal_description,
        due_date.format("%B %-d")
    )
}

/// Confirmation after a member accepts a group invitation.
pub fn group_confirmation_message(first_name: &str) -> String {
    format!(
        "Great, {}! Your accountability group is set up. You'll hear how the others are \
         doing in your weekly check-ins, and they'll hear about you.",
        first_name
    )
}

/// Note appended to a reply when a next goal was captured.
pub fn next_goal_note(description: &str, due_date: NaiveDate) -> String {
    format!(
        "Your next goal is locked in: \"{}\", due Sunday {}.",
        description,
        due_date.format("%B %-d")
    )
}

const ASK_FOR_NEXT_GOAL: &str = "What would you like to take on next week?";

/// Assemble the final check-in reply from the model's composition plus what
/// actually got written to the goal records: a created next goal wins over
/// the model's inclination to ask for one.
pub fn checkin_reply(
    composition: &CheckinComposition,
    created_next_goal: Option<(&str, NaiveDate)>,
) -> String {
    let mut body = composition.message.trim().to_string();
    match created_next_goal {
        Some((description, due_date)) => {
            body.push_str("\n\n");
            body.push_str(&next_goal_note(description, due_date));
        }
        None if composition.ask_for_next_goal => {
            body.push_str("\n\n");
            body.push_str(ASK_FOR_NEXT_GOAL);
        }
        None => {}
    }
    body
}

/// Reply subject for an inbound subject, adding a single reply marker.
pub fn reply_subject(original: &str) -> String {
    let trimmed = original.trim();
    if trimmed.is_empty() {
        "Re: your check-in".to_string()
    } else if trimmed.to_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}

/// Minimal HTML rendering of a plain-text body: escaped, paragraph per
/// blank-line-separated block.
pub fn render_html(text: &str) -> String {
    let mut html = String::from("<html><body>");
    for paragraph in text.split("\n\n") {
        html.push_str("<p>");
        html.push_str(&escape_html(paragraph).replace('\n', "<br/>"));
        html.push_str("</p>");
    }
    html.push_str("</body></html>");
    html
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intro_encodes_the_address_in_the_signup_link() {
        let message = intro_message("https://example.com", "jane+x@x.com");
        assert!(message.contains("https://example.com/signup?email=jane%2Bx%40x.com"));
    }

    #[test]
    fn checkin_reply_prefers_created_goal_over_asking() {
        let composition = CheckinComposition {
            message: "Amazing work this week!".to_string(),
            ask_for_next_goal: true,
        };
        let due = NaiveDate::from_ymd_opt(2026, 9, 6).unwrap();
        let body = checkin_reply(&composition, Some(("run 5k", due)));
        assert!(body.contains("run 5k"));
        assert!(!body.contains(ASK_FOR_NEXT_GOAL));
    }

    #[test]
    fn checkin_reply_asks_when_no_next_goal_was_named() {
        let composition = CheckinComposition {
            message: "Solid progress.".to_string(),
            ask_for_next_goal: true,
        };
        let body = checkin_reply(&composition, None);
        assert!(body.ends_with(ASK_FOR_NEXT_GOAL));
    }

    #[test]
    fn checkin_reply_can_stay_silent_about_goals() {
        let composition = CheckinComposition {
            message: "Keep at it!".to_string(),
            ask_for_next_goal: false,
        };
        assert_eq!(checkin_reply(&composition, None), "Keep at it!");
    }

    #[test]
    fn reply_subject_adds_one_marker() {
        assert_eq!(reply_subject("Weekly check-in"), "Re: Weekly check-in");
        assert_eq!(reply_subject("Re: Weekly check-in"), "Re: Weekly check-in");
        assert_eq!(reply_subject("  "), "Re: your check-in");
    }

    #[test]
    fn html_rendering_escapes_content() {
        let html = render_html("a < b\n\nsecond & third");
        assert!(html.contains("<p>a &lt; b</p>"));
        assert!(html.contains("<p>second &amp; third</p>"));
    }
}
