use crate::error::{Error, Result};
use crate::lifecycle::TicketLifecycle;
use crate::models::{Priority, Role, Ticket, TicketMessage, TicketStatus, User};
use crate::store::{NewMessage, NewTicket, Store};
use tracing::{info, warn};

/// What an inbound channel message turned into.
#[derive(Debug)]
pub enum InboundOutcome {
    /// A non-reply message opened a fresh ticket with its first
    /// timeline entry.
    NewTicket {
        ticket: Ticket,
        message: TicketMessage,
    },
    /// A reply matched an existing ticket's correlation pair and was
    /// appended to its timeline.
    Appended {
        ticket: Ticket,
        message: TicketMessage,
    },
}

/// Maps inbound messages onto tickets. A reply is matched by the exact
/// (chat id, message id) pair recorded the last time the bot sent
/// something for a ticket; anything else opens a new ticket. An
/// unmatched reply is a deliberate `CorrelationMiss` rather than a
/// best-effort guess: better to ask the user to resend than to misfile
/// the reply into an unrelated ticket.
#[derive(Clone)]
pub struct Correlator {
    store: Store,
    lifecycle: TicketLifecycle,
}

impl Correlator {
    pub fn new(store: Store) -> Self {
        let lifecycle = TicketLifecycle::new(store.clone());
        Self { store, lifecycle }
    }

    /// Handle one inbound channel message from `author`.
    ///
    /// `inbound_message_id` is the channel id of the message itself and
    /// is kept on the timeline entry for traceability; the ticket's
    /// outbound correlation pair is only set later, via
    /// [`record_outbound`], once a confirmation actually went out.
    pub async fn inbound_message(
        &self,
        chat_id: i64,
        reply_to: Option<i64>,
        author: &User,
        text: &str,
        inbound_message_id: Option<i64>,
    ) -> Result<InboundOutcome> {
        match reply_to {
            None => {
                let ticket = self
                    .store
                    .create_ticket(&NewTicket {
                        organization_id: author.organization_id,
                        customer_id: Some(author.id),
                        title: text.to_string(),
                        description: Some(text.to_string()),
                        priority: Priority::default(),
                        telegram_chat_id: Some(chat_id),
                        telegram_message_id: None,
                    })
                    .await?;

                let message = self
                    .store
                    .create_message(&NewMessage {
                        ticket_id: ticket.id,
                        user_id: Some(author.id),
                        content: text.to_string(),
                        telegram_message_id: inbound_message_id,
                        is_from_customer: true,
                    })
                    .await?;

                info!(ticket_id = ticket.id, user_id = author.id, "new ticket from channel");
                Ok(InboundOutcome::NewTicket { ticket, message })
            }
            Some(replied_to) => {
                let ticket = self
                    .store
                    .ticket_by_correlation(author.organization_id, chat_id, replied_to)
                    .await?
                    .ok_or_else(|| {
                        warn!(chat_id, replied_to, "reply did not match any ticket");
                        Error::CorrelationMiss
                    })?;

                let message = self
                    .store
                    .create_message(&NewMessage {
                        ticket_id: ticket.id,
                        user_id: Some(author.id),
                        content: text.to_string(),
                        telegram_message_id: inbound_message_id,
                        is_from_customer: author.role == Role::Customer,
                    })
                    .await?;

                info!(ticket_id = ticket.id, user_id = author.id, "reply appended");
                Ok(InboundOutcome::Appended { ticket, message })
            }
        }
    }

    /// Record the delivered message id of an outbound send as the
    /// ticket's correlation pointer, so a future reply to that message
    /// routes back here.
    pub async fn record_outbound(
        &self,
        ticket_id: i64,
        chat_id: i64,
        message_id: i64,
    ) -> Result<()> {
        self.store
            .set_ticket_correlation(ticket_id, chat_id, message_id)
            .await
    }

    /// Append a dashboard reply to an already-identified ticket. The
    /// first non-customer reply on an open ticket moves it to
    /// in_progress as a side effect.
    pub async fn dashboard_message(
        &self,
        ticket: &Ticket,
        actor_id: i64,
        actor_role: Role,
        text: &str,
    ) -> Result<TicketMessage> {
        let message = self
            .store
            .create_message(&NewMessage {
                ticket_id: ticket.id,
                user_id: Some(actor_id),
                content: text.to_string(),
                telegram_message_id: None,
                is_from_customer: actor_role == Role::Customer,
            })
            .await?;

        if ticket.status == TicketStatus::Open && actor_role != Role::Customer {
            match self.lifecycle.set_status(ticket, TicketStatus::InProgress).await {
                Ok(_) => {}
                // A concurrent transition already moved the ticket on;
                // the reply itself still stands.
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewUser;

    struct Fixture {
        store: Store,
        correlator: Correlator,
        customer: User,
    }

    async fn fixture() -> Fixture {
        let store = Store::memory().await;
        store.ensure_organization(1, "Acme").await.unwrap();
        let customer = store
            .create_user(&NewUser {
                organization_id: 1,
                telegram_id: Some(555),
                username: None,
                email: None,
                password_hash: None,
                role: Role::Customer,
                full_name: Some("Printer Person".into()),
            })
            .await
            .unwrap();
        Fixture {
            correlator: Correlator::new(store.clone()),
            store,
            customer,
        }
    }

    async fn agent(store: &Store) -> User {
        store
            .create_user(&NewUser {
                organization_id: 1,
                telegram_id: None,
                username: None,
                email: Some("agent@acme.test".into()),
                password_hash: None,
                role: Role::Agent,
                full_name: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn non_reply_opens_a_new_ticket() {
        let f = fixture().await;

        let outcome = f
            .correlator
            .inbound_message(555, None, &f.customer, "printer broken", Some(100))
            .await
            .unwrap();

        let InboundOutcome::NewTicket { ticket, message } = outcome else {
            panic!("expected a new ticket");
        };
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.priority, Priority::Medium);
        assert_eq!(ticket.customer_id, Some(f.customer.id));
        assert_eq!(ticket.organization_id, 1);
        assert!(message.is_from_customer);
        assert_eq!(message.telegram_message_id, Some(100));
    }

    #[tokio::test]
    async fn matching_reply_appends_without_a_new_ticket() {
        let f = fixture().await;

        let outcome = f
            .correlator
            .inbound_message(555, None, &f.customer, "printer broken", Some(100))
            .await
            .unwrap();
        let InboundOutcome::NewTicket { ticket, .. } = outcome else {
            panic!("expected a new ticket");
        };

        // Confirmation goes out, delivered as channel message 9001.
        f.correlator
            .record_outbound(ticket.id, 555, 9001)
            .await
            .unwrap();

        let outcome = f
            .correlator
            .inbound_message(555, Some(9001), &f.customer, "still broken", Some(101))
            .await
            .unwrap();
        let InboundOutcome::Appended {
            ticket: matched,
            message,
        } = outcome
        else {
            panic!("expected an append");
        };

        assert_eq!(matched.id, ticket.id);
        assert!(message.is_from_customer);
        assert_eq!(f.store.count_messages(ticket.id).await.unwrap(), 2);
        assert_eq!(
            f.store.tickets_by_organization(1, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn unmatched_reply_is_a_correlation_miss_with_no_writes() {
        let f = fixture().await;

        let err = f
            .correlator
            .inbound_message(555, Some(4242), &f.customer, "hello?", Some(102))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorrelationMiss));

        assert!(f
            .store
            .tickets_by_organization(1, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reply_from_an_agent_is_not_flagged_as_customer() {
        let f = fixture().await;
        let agent = agent(&f.store).await;

        let outcome = f
            .correlator
            .inbound_message(555, None, &f.customer, "printer broken", None)
            .await
            .unwrap();
        let InboundOutcome::NewTicket { ticket, .. } = outcome else {
            panic!("expected a new ticket");
        };
        f.correlator
            .record_outbound(ticket.id, 555, 9001)
            .await
            .unwrap();

        let outcome = f
            .correlator
            .inbound_message(555, Some(9001), &agent, "on it", None)
            .await
            .unwrap();
        let InboundOutcome::Appended { message, .. } = outcome else {
            panic!("expected an append");
        };
        assert!(!message.is_from_customer);
    }

    #[tokio::test]
    async fn first_agent_dashboard_reply_activates_an_open_ticket() {
        let f = fixture().await;
        let agent = agent(&f.store).await;

        let outcome = f
            .correlator
            .inbound_message(555, None, &f.customer, "printer broken", None)
            .await
            .unwrap();
        let InboundOutcome::NewTicket { ticket, .. } = outcome else {
            panic!("expected a new ticket");
        };

        let message = f
            .correlator
            .dashboard_message(&ticket, agent.id, agent.role, "looking into it")
            .await
            .unwrap();
        assert!(!message.is_from_customer);

        let current = f.store.ticket_by_id(ticket.id).await.unwrap().unwrap();
        assert_eq!(current.status, TicketStatus::InProgress);
    }

    #[tokio::test]
    async fn customer_dashboard_reply_leaves_the_ticket_open() {
        let f = fixture().await;

        let outcome = f
            .correlator
            .inbound_message(555, None, &f.customer, "printer broken", None)
            .await
            .unwrap();
        let InboundOutcome::NewTicket { ticket, .. } = outcome else {
            panic!("expected a new ticket");
        };

        f.correlator
            .dashboard_message(&ticket, f.customer.id, Role::Customer, "any update?")
            .await
            .unwrap();

        let current = f.store.ticket_by_id(ticket.id).await.unwrap().unwrap();
        assert_eq!(current.status, TicketStatus::Open);
    }

    /// The end-to-end scenario: "printer broken" opens ticket #1, the
    /// confirmation is delivered as message 9001, and a later reply to
    /// 9001 lands on the same ticket.
    #[tokio::test]
    async fn confirmation_reply_round_trip() {
        let f = fixture().await;

        let outcome = f
            .correlator
            .inbound_message(555, None, &f.customer, "printer broken", Some(1))
            .await
            .unwrap();
        let InboundOutcome::NewTicket { ticket, message } = outcome else {
            panic!("expected a new ticket");
        };
        assert_eq!(ticket.status, TicketStatus::Open);
        assert!(message.is_from_customer);

        f.correlator
            .record_outbound(ticket.id, 555, 9001)
            .await
            .unwrap();

        let outcome = f
            .correlator
            .inbound_message(555, Some(9001), &f.customer, "still broken", Some(2))
            .await
            .unwrap();
        let InboundOutcome::Appended { ticket: matched, .. } = outcome else {
            panic!("expected an append");
        };
        assert_eq!(matched.id, ticket.id);

        let timeline = f.store.messages_by_ticket(ticket.id).await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].content, "printer broken");
        assert_eq!(timeline[1].content, "still broken");
    }
}
