use crate::error::{Error, Result};
use crate::models::Ticket;
use crate::session::Session;

/// Authorization over the (session snapshot, ticket) pair. Pure
/// functions; the organization boundary is checked first and always
/// wins, regardless of role.

/// View/modify a ticket's timeline. Agents and admins see everything in
/// their organization; customers only their own tickets.
pub fn authorize_view(session: &Session, ticket: &Ticket) -> Result<()> {
    if session.organization_id != ticket.organization_id {
        return Err(Error::AccessDenied);
    }
    if session.role.can_view_any_ticket() {
        return Ok(());
    }
    if ticket.customer_id == Some(session.user_id) {
        return Ok(());
    }
    Err(Error::AccessDenied)
}

/// Status changes additionally require a role that carries the
/// capability; customers are denied outright.
pub fn authorize_set_status(session: &Session, ticket: &Ticket) -> Result<()> {
    authorize_view(session, ticket)?;
    if !session.role.can_set_status() {
        return Err(Error::AccessDenied);
    }
    Ok(())
}

pub fn authorize_assign(session: &Session, ticket: &Ticket) -> Result<()> {
    authorize_view(session, ticket)?;
    if !session.role.can_assign() {
        return Err(Error::AccessDenied);
    }
    Ok(())
}
