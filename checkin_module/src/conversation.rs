//! The conversation state machine: classify an inbound email by the
//! sender's derived state, run the matching flow, and send exactly one
//! reply.
//!
//! State is never stored. It is derived fresh from the stores on every
//! message, so a check-in arriving seconds after onboarding completes is
//! handled by the check-in flow without any transition bookkeeping.
//! Outbound mail is sent before it is recorded; a crash between the two
//! loses history, never a member-visible reply.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compose;
use crate::extractor::{FactExtractor, HISTORY_LIMIT};
use crate::goal_store::{GoalRecord, GoalStore, GoalStoreError};
use crate::group_store::{GroupStore, GroupStoreError};
use crate::mailer::{MailError, Mailer, OutboundEmail};
use crate::message_store::{
    Direction, MessageRecord, MessageStore, MessageStoreError, ProvisionalRecord,
};
use crate::patterns;
use crate::retry::{RetryError, RetryPolicy};
use crate::sender_store::{
    extract_emails, normalize_email, SenderRecord, SenderStore, SenderStoreError,
};
use crate::threads;
use crate::week::next_week_boundary;

/// An inbound email after envelope parsing, ready for classification.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    pub from: String,
    pub subject: String,
    pub body: String,
    /// Addresses scanned off the CC line; candidates for group membership.
    pub cc: Vec<String>,
}

/// What the service did with an inbound email, reported back to the
/// webhook caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    IntroSent,
    ReminderSent,
    OnboardingComplete,
    OnboardingIncomplete,
    Conversation,
    CheckinRecorded,
    GroupCreated,
    FallbackSent,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::IntroSent => "intro_sent",
            Action::ReminderSent => "reminder_sent",
            Action::OnboardingComplete => "onboarding_complete",
            Action::OnboardingIncomplete => "onboarding_incomplete",
            Action::Conversation => "conversation",
            Action::CheckinRecorded => "checkin_recorded",
            Action::GroupCreated => "group_created",
            Action::FallbackSent => "fallback_sent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub action: Action,
    /// Set only for unknown senders: whether this was their first contact.
    pub is_first_email: Option<bool>,
}

impl Outcome {
    fn new(action: Action) -> Self {
        Self {
            action,
            is_first_email: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("invalid sender address: {0}")]
    InvalidAddress(String),
    #[error("sender store: {0}")]
    Sender(#[from] SenderStoreError),
    #[error("goal store: {0}")]
    Goal(#[from] GoalStoreError),
    #[error("message store: {0}")]
    Message(#[from] MessageStoreError),
    #[error("group store: {0}")]
    Group(#[from] GroupStoreError),
    #[error("mail: {0}")]
    Mail(#[from] MailError),
    #[error("model: {0}")]
    Model(#[from] RetryError),
}

/// Everything a conversation turn needs, wired once at startup. Stores are
/// cheap handles; the mailer and the model sit behind trait objects so
/// tests can inject fakes.
#[derive(Clone)]
pub struct Conversation {
    pub senders: SenderStore,
    pub goals: GoalStore,
    pub messages: MessageStore,
    pub groups: GroupStore,
    pub extractor: FactExtractor,
    pub mailer: Arc<dyn Mailer>,
    pub retry: RetryPolicy,
    pub signup_base_url: String,
}

impl Conversation {
    pub async fn handle_inbound(
        &self,
        inbound: InboundEmail,
    ) -> Result<Outcome, ConversationError> {
        let email = normalize_email(&inbound.from)
            .ok_or_else(|| ConversationError::InvalidAddress(inbound.from.clone()))?;

        match self.senders.find_by_email(&email)? {
            None => self.handle_unknown(&email, &inbound).await,
            Some(sender) if !sender.onboarded => self.handle_pending(sender, &inbound).await,
            Some(sender) => match self.goals.active_goal(&sender.sender_id)? {
                Some(goal) => self.handle_active_with_goal(sender, goal, &inbound).await,
                None => self.handle_active_no_goal(sender, &inbound).await,
            },
        }
    }

    /// No account for this address: hold the mail provisionally and point
    /// at signup. No model call is made on this path.
    async fn handle_unknown(
        &self,
        email: &str,
        inbound: &InboundEmail,
    ) -> Result<Outcome, ConversationError> {
        let thread_key = provisional_thread_key(&inbound.subject);
        let first = self.messages.count_provisional(email)? == 0;
        self.messages.insert_provisional(
            email,
            Direction::Inbound,
            &inbound.subject,
            &inbound.body,
            &thread_key,
        )?;

        let body = if first {
            compose::intro_message(&self.signup_base_url, email)
        } else {
            compose::reminder_message(&self.signup_base_url, email)
        };
        let subject = compose::reply_subject(&inbound.subject);
        self.send(email, &subject, &body).await?;
        self.messages.insert_provisional(
            email,
            Direction::Outbound,
            &subject,
            &body,
            &thread_key,
        )?;

        info!("held mail from unknown sender (first: {})", first);
        Ok(Outcome {
            action: if first {
                Action::IntroSent
            } else {
                Action::ReminderSent
            },
            is_first_email: Some(first),
        })
    }

    /// Signed up but not yet onboarded: run one more onboarding turn over
    /// the accumulated history. Completion needs both a name and a goal,
    /// in any combination of past messages.
    async fn handle_pending(
        &self,
        sender: SenderRecord,
        inbound: &InboundEmail,
    ) -> Result<Outcome, ConversationError> {
        let (_, thread_id) = self.record_inbound(&sender.sender_id, inbound)?;

        let mut history: Vec<MessageRecord> = self
            .messages
            .list_provisional(&sender.email)?
            .iter()
            .map(provisional_as_message)
            .collect();
        history.extend(self.messages.sender_history(&sender.sender_id, HISTORY_LIMIT)?);

        let turn = match self
            .retry
            .run("onboarding turn", || {
                self.extractor
                    .extract_onboarding_turn(&inbound.body, &history)
            })
            .await
        {
            Ok(turn) => turn,
            Err(err) => return self.send_fallback(&sender, &thread_id, inbound, &err).await,
        };

        match (turn.complete, turn.name, turn.goal) {
            (true, Some(name), Some(goal)) => {
                self.senders.mark_onboarded(&sender.sender_id, &name)?;
                let due = next_week_boundary(Utc::now());
                self.goals.create(&sender.sender_id, &goal, due)?;
                let migrated = self
                    .messages
                    .migrate_provisional(&sender.email, &sender.sender_id)?;
                info!(
                    "onboarding complete for {} ({} held messages migrated)",
                    sender.sender_id, migrated
                );

                let body = compose::welcome_message(&name, &goal, due);
                self.send_reply(&sender, &thread_id, inbound, &body).await?;
                Ok(Outcome::new(Action::OnboardingComplete))
            }
            _ => {
                self.send_reply(&sender, &thread_id, inbound, &turn.reply)
                    .await?;
                Ok(Outcome::new(Action::OnboardingIncomplete))
            }
        }
    }

    /// Active sender with a goal: either a group-invitation acceptance or
    /// a weekly check-in reply.
    async fn handle_active_with_goal(
        &self,
        sender: SenderRecord,
        goal: GoalRecord,
        inbound: &InboundEmail,
    ) -> Result<Outcome, ConversationError> {
        let (inbound_record, thread_id) = self.record_inbound(&sender.sender_id, inbound)?;

        // A short affirmation right after a group invitation is taken as
        // acceptance, not as a check-in. Lexical on purpose: no model call.
        if patterns::is_affirmation(&inbound.body) {
            if let Some(invite) = self
                .messages
                .recent_outbound(&sender.sender_id, 3)?
                .into_iter()
                .find(|message| patterns::mentions_group_accountability(&message.body))
            {
                if let Some(outcome) = self
                    .try_create_group(&sender, &invite, &thread_id, inbound)
                    .await?
                {
                    return Ok(outcome);
                }
            }
        }

        let history = self.messages.thread_history(&thread_id, HISTORY_LIMIT)?;
        let extraction = match self
            .retry
            .run("check-in extraction", || {
                self.extractor
                    .extract_checkin_reply(&inbound.body, &goal.description, &history)
            })
            .await
        {
            Ok(extraction) => extraction,
            Err(err) => return self.send_fallback(&sender, &thread_id, inbound, &err).await,
        };

        if extraction.completed {
            let newly = self.goals.mark_completed(&goal.goal_id)?;
            if newly {
                info!("goal {} completed by {}", goal.goal_id, sender.sender_id);
            } else {
                debug!("goal {} was already completed", goal.goal_id);
            }
        }

        let created_next_goal = match extraction.next_goal.as_deref().map(str::trim) {
            Some(description) if !description.is_empty() => Some(self.goals.create(
                &sender.sender_id,
                description,
                next_week_boundary(Utc::now()),
            )?),
            _ => None,
        };

        let first_name = sender.name.as_deref().unwrap_or("there");
        let composition = match self
            .retry
            .run("check-in reply", || {
                self.extractor.compose_checkin_reply(
                    first_name,
                    &goal.description,
                    &extraction,
                    &history,
                )
            })
            .await
        {
            Ok(composition) => composition,
            Err(err) => return self.send_fallback(&sender, &thread_id, inbound, &err).await,
        };

        let body = compose::checkin_reply(
            &composition,
            created_next_goal
                .as_ref()
                .map(|created| (created.description.as_str(), created.due_date)),
        );
        self.send_reply(&sender, &thread_id, inbound, &body).await?;

        // Annotations are derived data; a failed write is logged, not fatal.
        if let Err(err) = self.messages.annotate(
            &inbound_record.message_id,
            &extraction.progress,
            extraction.mood.as_str(),
        ) {
            warn!(
                "annotation failed for message {}: {}",
                inbound_record.message_id, err
            );
        }

        self.spawn_journey_summary(&sender);
        Ok(Outcome::new(Action::CheckinRecorded))
    }

    /// Active sender between goals: free-form conversation, with a lexical
    /// scan for goal intent so "I want to run a 5k" sets one up.
    async fn handle_active_no_goal(
        &self,
        sender: SenderRecord,
        inbound: &InboundEmail,
    ) -> Result<Outcome, ConversationError> {
        let (_, thread_id) = self.record_inbound(&sender.sender_id, inbound)?;
        let history = self.messages.sender_history(&sender.sender_id, HISTORY_LIMIT)?;
        let first_name = sender.name.as_deref().unwrap_or("there");

        let reply = match self
            .retry
            .run("open conversation", || {
                self.extractor.compose_open_conversation_reply(
                    first_name,
                    &inbound.body,
                    &history,
                    None,
                )
            })
            .await
        {
            Ok(reply) => reply,
            Err(err) => return self.send_fallback(&sender, &thread_id, inbound, &err).await,
        };

        let mut body = reply;
        if let Some(description) = patterns::detect_goal_intent(&inbound.body) {
            let due = next_week_boundary(Utc::now());
            let created = self.goals.create(&sender.sender_id, &description, due)?;
            info!(
                "goal intent detected for {}: {}",
                sender.sender_id, created.goal_id
            );
            body.push_str("\n\n");
            body.push_str(&compose::next_goal_note(&created.description, due));
        }

        self.send_reply(&sender, &thread_id, inbound, &body).await?;
        self.spawn_journey_summary(&sender);
        Ok(Outcome::new(Action::Conversation))
    }

    /// Turn a group invitation acceptance into a group. Members are the
    /// accepting sender plus every address from the invitation body or the
    /// acceptance CC line that has an account. Returns None when no partner
    /// resolves, in which case the affirmation falls through to the
    /// check-in flow.
    async fn try_create_group(
        &self,
        sender: &SenderRecord,
        invite: &MessageRecord,
        thread_id: &str,
        inbound: &InboundEmail,
    ) -> Result<Option<Outcome>, ConversationError> {
        let mut candidates = extract_emails(&invite.body);
        candidates.extend(inbound.cc.iter().cloned());

        let mut members = vec![sender.sender_id.clone()];
        for address in candidates {
            if address == sender.email {
                continue;
            }
            if let Some(partner) = self.senders.find_by_email(&address)? {
                if !members.contains(&partner.sender_id) {
                    members.push(partner.sender_id);
                }
            }
        }
        if members.len() < 2 {
            return Ok(None);
        }

        let group_id = self.groups.create_with_members(&members)?;
        info!(
            "group {} created with {} members",
            group_id,
            members.len()
        );

        let first_name = sender.name.as_deref().unwrap_or("there");
        let body = compose::group_confirmation_message(first_name);
        self.send_reply(sender, thread_id, inbound, &body).await?;
        Ok(Some(Outcome::new(Action::GroupCreated)))
    }

    /// Resolve the thread for an inbound message and store it. A message
    /// that matches no existing thread becomes its own thread root.
    fn record_inbound(
        &self,
        sender_id: &str,
        inbound: &InboundEmail,
    ) -> Result<(MessageRecord, String), ConversationError> {
        match threads::resolve(&self.messages, sender_id, &inbound.subject)? {
            Some(thread_id) => {
                let record = self.messages.insert(
                    sender_id,
                    Direction::Inbound,
                    &inbound.subject,
                    &inbound.body,
                    Some(&thread_id),
                )?;
                Ok((record, thread_id))
            }
            None => {
                let record = self.messages.insert(
                    sender_id,
                    Direction::Inbound,
                    &inbound.subject,
                    &inbound.body,
                    None,
                )?;
                self.messages.start_thread(&record.message_id)?;
                let thread_id = record.message_id.clone();
                Ok((record, thread_id))
            }
        }
    }

    /// Send a reply in an existing thread, then record it.
    async fn send_reply(
        &self,
        sender: &SenderRecord,
        thread_id: &str,
        inbound: &InboundEmail,
        body: &str,
    ) -> Result<MessageRecord, ConversationError> {
        let subject = compose::reply_subject(&inbound.subject);
        self.send(&sender.email, &subject, body).await?;
        let record = self.messages.insert(
            &sender.sender_id,
            Direction::Outbound,
            &subject,
            body,
            Some(thread_id),
        )?;
        Ok(record)
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ConversationError> {
        let message_id = self
            .mailer
            .send(OutboundEmail {
                to: to.to_string(),
                subject: subject.to_string(),
                html: compose::render_html(body),
                text: body.to_string(),
            })
            .await?;
        debug!("sent message {} to {}", message_id, to);
        Ok(())
    }

    /// The model is unavailable or unauthorized: send the fixed fallback
    /// so the member still gets a reply, and record it like any outbound.
    async fn send_fallback(
        &self,
        sender: &SenderRecord,
        thread_id: &str,
        inbound: &InboundEmail,
        err: &RetryError,
    ) -> Result<Outcome, ConversationError> {
        warn!(
            "sending fallback to {} after model failure: {}",
            sender.sender_id, err
        );
        self.send_reply(sender, thread_id, inbound, compose::FALLBACK_MESSAGE)
            .await?;
        Ok(Outcome::new(Action::FallbackSent))
    }

    /// Refresh the sender's journey summary in the background. The reply
    /// has already been sent; failures here are logged and dropped.
    fn spawn_journey_summary(&self, sender: &SenderRecord) {
        let conversation = self.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            if let Err(err) = conversation.refresh_journey_summary(&sender).await {
                warn!(
                    "journey summary update failed for {}: {}",
                    sender.sender_id, err
                );
            }
        });
    }

    async fn refresh_journey_summary(
        &self,
        sender: &SenderRecord,
    ) -> Result<(), ConversationError> {
        let history = self.messages.sender_history(&sender.sender_id, HISTORY_LIMIT)?;
        let completed = self.goals.count_completed(&sender.sender_id)?;
        let current = self.goals.active_goal(&sender.sender_id)?;
        let weeks_active = (Utc::now() - sender.created_at).num_weeks().max(0) + 1;
        let first_name = sender.name.as_deref().unwrap_or("there");

        let summary = self
            .retry
            .run("journey summary", || {
                self.extractor.compose_journey_summary(
                    first_name,
                    &history,
                    completed,
                    current.as_ref().map(|goal| goal.description.as_str()),
                    weeks_active,
                )
            })
            .await?;
        self.senders
            .update_journey_summary(&sender.sender_id, &summary)?;
        Ok(())
    }
}

/// Thread key for mail held before signup. Grouped by normalized subject;
/// a blank subject gets its own key.
fn provisional_thread_key(subject: &str) -> String {
    let normalized = threads::normalize_subject(subject).to_lowercase();
    if normalized.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        normalized
    }
}

fn provisional_as_message(record: &ProvisionalRecord) -> MessageRecord {
    MessageRecord {
        message_id: record.provisional_id.clone(),
        sender_id: record.email.clone(),
        direction: record.direction,
        subject: record.subject.clone(),
        body: record.body.clone(),
        thread_id: None,
        progress_summary: None,
        mood: None,
        created_at: record.created_at,
    }
}
