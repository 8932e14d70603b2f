use crate::error::{Error, Result};
use crate::models::{Ticket, TicketStatus};
use crate::store::Store;
use tracing::info;

/// Checks whether an explicit status change is allowed. Terminal states
/// accept nothing; once a ticket is in progress it cannot fall back to
/// open.
pub fn check_transition(from: TicketStatus, to: TicketStatus) -> Result<()> {
    if from.is_terminal() || (from == TicketStatus::InProgress && to == TicketStatus::Open) {
        return Err(Error::InvalidTransition { from, to });
    }
    Ok(())
}

/// Applies ticket transitions as atomic conditional writes against the
/// store, so two concurrent transitions on the same ticket can never
/// both believe they made the first move.
#[derive(Clone)]
pub struct TicketLifecycle {
    store: Store,
}

impl TicketLifecycle {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Assign an agent. Allowed from open or in_progress; assigning
    /// always activates the ticket.
    pub async fn assign(&self, ticket: &Ticket, agent_id: i64) -> Result<Ticket> {
        if ticket.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: ticket.status,
                to: TicketStatus::InProgress,
            });
        }

        let updated = self.store.assign_ticket(ticket.id, agent_id).await?;
        if !updated {
            // A concurrent transition moved the ticket to a terminal
            // state between our read and the write.
            let current = self.current(ticket.id).await?;
            return Err(Error::InvalidTransition {
                from: current.status,
                to: TicketStatus::InProgress,
            });
        }

        info!(ticket_id = ticket.id, agent_id, "ticket assigned");
        self.current(ticket.id).await
    }

    /// Explicit status change requested by an agent or admin.
    pub async fn set_status(&self, ticket: &Ticket, to: TicketStatus) -> Result<Ticket> {
        check_transition(ticket.status, to)?;

        let updated = self
            .store
            .set_ticket_status(ticket.id, ticket.status, to)
            .await?;
        if !updated {
            let current = self.current(ticket.id).await?;
            return Err(Error::InvalidTransition {
                from: current.status,
                to,
            });
        }

        info!(ticket_id = ticket.id, status = %to, "ticket status changed");
        self.current(ticket.id).await
    }

    async fn current(&self, ticket_id: i64) -> Result<Ticket> {
        self.store
            .ticket_by_id(ticket_id)
            .await?
            .ok_or(Error::NotFound("ticket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, Role};
    use crate::store::{NewTicket, NewUser};

    async fn fixture() -> (Store, TicketLifecycle, Ticket, i64) {
        let store = Store::memory().await;
        store.ensure_organization(1, "Acme").await.unwrap();
        let agent = store
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
            .unwrap();
        let ticket = store
            .create_ticket(&NewTicket {
                organization_id: 1,
                customer_id: None,
                title: "printer broken".into(),
                description: None,
                priority: Priority::default(),
                telegram_chat_id: None,
                telegram_message_id: None,
            })
            .await
            .unwrap();
        (store.clone(), TicketLifecycle::new(store), ticket, agent.id)
    }

    #[tokio::test]
    async fn assign_from_open_activates_the_ticket() {
        let (_, lifecycle, ticket, agent_id) = fixture().await;

        let updated = lifecycle.assign(&ticket, agent_id).await.unwrap();
        assert_eq!(updated.status, TicketStatus::InProgress);
        assert_eq!(updated.assigned_agent_id, Some(agent_id));
    }

    #[tokio::test]
    async fn assign_from_resolved_fails_and_leaves_the_ticket_unchanged() {
        let (store, lifecycle, ticket, agent_id) = fixture().await;
        let resolved = lifecycle
            .set_status(&ticket, TicketStatus::Resolved)
            .await
            .unwrap();

        let err = lifecycle.assign(&resolved, agent_id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let current = store.ticket_by_id(ticket.id).await.unwrap().unwrap();
        assert_eq!(current.status, TicketStatus::Resolved);
        assert_eq!(current.assigned_agent_id, None);
    }

    #[tokio::test]
    async fn in_progress_cannot_fall_back_to_open() {
        let (_, lifecycle, ticket, agent_id) = fixture().await;
        let active = lifecycle.assign(&ticket, agent_id).await.unwrap();

        let err = lifecycle
            .set_status(&active, TicketStatus::Open)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TicketStatus::InProgress,
                to: TicketStatus::Open,
            }
        ));
    }

    #[tokio::test]
    async fn closing_is_allowed_from_open_and_in_progress() {
        let (_, lifecycle, ticket, _) = fixture().await;
        lifecycle
            .set_status(&ticket, TicketStatus::Closed)
            .await
            .unwrap();

        let (_, lifecycle, ticket, agent_id) = fixture().await;
        let active = lifecycle.assign(&ticket, agent_id).await.unwrap();
        let closed = lifecycle
            .set_status(&active, TicketStatus::Closed)
            .await
            .unwrap();
        assert_eq!(closed.status, TicketStatus::Closed);
    }

    #[tokio::test]
    async fn terminal_states_accept_no_transitions() {
        let (_, lifecycle, ticket, _) = fixture().await;
        let closed = lifecycle
            .set_status(&ticket, TicketStatus::Closed)
            .await
            .unwrap();

        for to in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Resolved,
        ] {
            let err = lifecycle.set_status(&closed, to).await.unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }));
        }
    }

    #[tokio::test]
    async fn stale_snapshot_loses_to_a_concurrent_transition() {
        let (_, lifecycle, ticket, _) = fixture().await;

        // Someone else resolves the ticket while we still hold the
        // `open` snapshot.
        lifecycle
            .set_status(&ticket, TicketStatus::Resolved)
            .await
            .unwrap();

        let err = lifecycle
            .set_status(&ticket, TicketStatus::InProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TicketStatus::Resolved,
                ..
            }
        ));
    }
}
