use crate::correlate::{Correlator, InboundOutcome};
use crate::error::Error;
use crate::identity::{ChannelProfile, IdentityResolver};
use crate::lifecycle::TicketLifecycle;
use crate::models::{Ticket, TicketStatus, User};
use crate::store::{NewMessage, Store};
use teloxide::types::{CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::{prelude::*, utils::command::BotCommands};
use tracing::{error, info, warn};

/// Customer-facing bot channel. Non-reply messages open tickets,
/// replies to bot-delivered messages continue them, and a handful of
/// commands cover the rest.
#[derive(Clone)]
pub struct TelegramInterface {
    bot: Bot,
    store: Store,
    identity: IdentityResolver,
    correlator: Correlator,
    lifecycle: TicketLifecycle,
}

/// Outbound side of the channel, handed to the web layer so dashboard
/// actions can notify the customer's chat. Every delivered send becomes
/// the ticket's new correlation pointer.
#[derive(Clone)]
pub struct Notifier {
    bot: Bot,
    store: Store,
}

#[derive(BotCommands, Clone)]
#[command(
    rename_rule = "lowercase",
    description = "These commands are supported:"
)]
enum Command {
    #[command(description = "Start the conversation.")]
    Start,
    #[command(description = "Display this text.")]
    Help,
    #[command(description = "Check a ticket: /status <ticket-id>")]
    Status(String),
}

impl TelegramInterface {
    pub fn new(token: String, store: Store, identity: IdentityResolver) -> anyhow::Result<Self> {
        // Long-polling holds the connection open for up to two minutes;
        // the client timeout has to outlast it.
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(130))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        let bot = Bot::with_client(token, client);
        Ok(Self {
            bot,
            correlator: Correlator::new(store.clone()),
            lifecycle: TicketLifecycle::new(store.clone()),
            store,
            identity,
        })
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            bot: self.bot.clone(),
            store: self.store.clone(),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting Telegram bot...");

        let handler = Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<Command>()
                    .endpoint(answer_command),
            )
            .branch(dptree::entry().endpoint(answer_message));

        let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

        Dispatcher::builder(
            self.bot.clone(),
            dptree::entry().branch(handler).branch(callback_handler),
        )
        .dependencies(dptree::deps![self.clone()])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

        Ok(())
    }

    /// Resolve the inbound sender to an internal user, creating a
    /// customer account on first contact.
    async fn resolve_author(&self, chat_id: i64, from: &teloxide::types::User) -> Option<User> {
        let profile = ChannelProfile {
            username: from.username.clone(),
            full_name: from.full_name(),
        };
        match self.identity.resolve_or_create(chat_id, &profile).await {
            Ok(user) => Some(user),
            Err(e) => {
                error!("failed to resolve channel identity {chat_id}: {e}");
                None
            }
        }
    }

    /// Post a new-ticket notice with quick actions to the organization's
    /// linked agent chat, if one is configured.
    async fn notify_org_channel(&self, ticket: &Ticket) {
        let org = match self.store.organization_by_id(ticket.organization_id).await {
            Ok(Some(org)) => org,
            Ok(None) => return,
            Err(e) => {
                error!("failed to load organization {}: {e}", ticket.organization_id);
                return;
            }
        };
        let Some(chat_id) = org.telegram_chat_id else {
            return;
        };

        let keyboard = InlineKeyboardMarkup::new([[
            InlineKeyboardButton::callback("Assign to me", format!("assign:{}", ticket.id)),
            InlineKeyboardButton::callback("Resolve", format!("resolve:{}", ticket.id)),
        ]]);

        if let Err(e) = self
            .bot
            .send_message(
                ChatId(chat_id),
                format!("New ticket #{}: {}", ticket.id, ticket.title),
            )
            .reply_markup(keyboard)
            .await
        {
            warn!("failed to notify agent chat {chat_id}: {e}");
        }
    }
}

async fn answer_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    interface: TelegramInterface,
) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let Some(user) = interface.resolve_author(msg.chat.id.0, from).await else {
        bot.send_message(msg.chat.id, "Something went wrong. Please try again later.")
            .await?;
        return Ok(());
    };

    match cmd {
        Command::Start => {
            bot.send_message(
                msg.chat.id,
                "Welcome to the helpdesk! Send a message to open a ticket.",
            )
            .await?;
        }
        Command::Help => {
            let text = format!(
                "Send a message to open a new ticket.\nReply to one of my messages to add to an existing ticket.\n\n{}",
                Command::descriptions()
            );
            bot.send_message(msg.chat.id, text).await?;
        }
        Command::Status(arg) => {
            answer_status(&bot, &msg, &interface, &user, arg.trim()).await?;
        }
    }
    Ok(())
}

async fn answer_status(
    bot: &Bot,
    msg: &Message,
    interface: &TelegramInterface,
    user: &User,
    arg: &str,
) -> ResponseResult<()> {
    let Ok(ticket_id) = arg.parse::<i64>() else {
        bot.send_message(msg.chat.id, "Usage: /status <ticket-id>")
            .await?;
        return Ok(());
    };

    let ticket = match interface.store.ticket_by_id(ticket_id).await {
        Ok(Some(ticket)) => ticket,
        Ok(None) => {
            bot.send_message(msg.chat.id, "Ticket not found.").await?;
            return Ok(());
        }
        Err(e) => {
            error!("status lookup failed: {e}");
            bot.send_message(msg.chat.id, "Something went wrong. Please try again later.")
                .await?;
            return Ok(());
        }
    };

    // Customers may only query their own tickets.
    let allowed = ticket.organization_id == user.organization_id
        && (user.role.can_view_any_ticket() || ticket.customer_id == Some(user.id));
    if !allowed {
        bot.send_message(msg.chat.id, "You don't have access to that ticket.")
            .await?;
        return Ok(());
    }

    bot.send_message(
        msg.chat.id,
        format!(
            "Ticket #{}\nStatus: {}\nPriority: {}",
            ticket.id,
            status_label(ticket.status),
            ticket.priority
        ),
    )
    .await?;
    Ok(())
}

fn status_label(status: TicketStatus) -> &'static str {
    match status {
        TicketStatus::Open => "open",
        TicketStatus::InProgress => "in progress",
        TicketStatus::Resolved => "resolved",
        TicketStatus::Closed => "closed",
    }
}

async fn answer_message(bot: Bot, msg: Message, interface: TelegramInterface) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        bot.send_message(msg.chat.id, "Please send a text message to open a ticket.")
            .await?;
        return Ok(());
    };
    if text.trim().is_empty() {
        bot.send_message(msg.chat.id, "Please send a text message to open a ticket.")
            .await?;
        return Ok(());
    }

    let chat_id = msg.chat.id.0;
    let Some(user) = interface.resolve_author(chat_id, from).await else {
        bot.send_message(msg.chat.id, "Something went wrong. Please try again later.")
            .await?;
        return Ok(());
    };

    let reply_to = msg.reply_to_message().map(|replied| i64::from(replied.id.0));
    let inbound_id = Some(i64::from(msg.id.0));

    match interface
        .correlator
        .inbound_message(chat_id, reply_to, &user, text, inbound_id)
        .await
    {
        Ok(InboundOutcome::NewTicket { ticket, .. }) => {
            let confirmation = format!(
                "Ticket #{} created.\n\nReply to this message to add more details.",
                ticket.id
            );
            let sent = bot.send_message(msg.chat.id, confirmation).await?;
            // The delivered confirmation id is what a future reply will
            // point at; losing this write would orphan those replies.
            if let Err(e) = interface
                .correlator
                .record_outbound(ticket.id, chat_id, i64::from(sent.id.0))
                .await
            {
                error!("failed to record confirmation for ticket {}: {e}", ticket.id);
            }
            interface.notify_org_channel(&ticket).await;
        }
        Ok(InboundOutcome::Appended { ticket, .. }) => {
            let sent = bot
                .send_message(msg.chat.id, format!("Added to ticket #{}.", ticket.id))
                .await?;
            if let Err(e) = interface
                .correlator
                .record_outbound(ticket.id, chat_id, i64::from(sent.id.0))
                .await
            {
                error!("failed to update correlation for ticket {}: {e}", ticket.id);
            }
        }
        Err(Error::CorrelationMiss) => {
            bot.send_message(
                msg.chat.id,
                "Ticket not found. Send a new message to open a fresh ticket.",
            )
            .await?;
        }
        Err(e) => {
            error!("inbound message handling failed: {e}");
            bot.send_message(msg.chat.id, "Something went wrong. Please try again later.")
                .await?;
        }
    }
    Ok(())
}

async fn handle_callback_query(
    bot: Bot,
    q: CallbackQuery,
    interface: TelegramInterface,
) -> ResponseResult<()> {
    let Some(data) = q.data.as_deref() else {
        bot.answer_callback_query(&q.id).await?;
        return Ok(());
    };

    let Some((action, id)) = data.split_once(':') else {
        bot.answer_callback_query(&q.id).text("Unknown action").await?;
        return Ok(());
    };
    let Ok(ticket_id) = id.parse::<i64>() else {
        bot.answer_callback_query(&q.id).text("Unknown action").await?;
        return Ok(());
    };

    // Quick actions are for agents; the sender must resolve to an
    // existing agent/admin account in the ticket's organization.
    let actor = match interface.store.user_by_telegram_id(q.from.id.0 as i64).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            bot.answer_callback_query(&q.id)
                .text("You are not registered as an agent.")
                .await?;
            return Ok(());
        }
        Err(e) => {
            error!("callback actor lookup failed: {e}");
            bot.answer_callback_query(&q.id).text("Something went wrong.").await?;
            return Ok(());
        }
    };

    let ticket = match interface.store.ticket_by_id(ticket_id).await {
        Ok(Some(ticket)) => ticket,
        Ok(None) => {
            bot.answer_callback_query(&q.id).text("Ticket not found.").await?;
            return Ok(());
        }
        Err(e) => {
            error!("callback ticket lookup failed: {e}");
            bot.answer_callback_query(&q.id).text("Something went wrong.").await?;
            return Ok(());
        }
    };

    if actor.organization_id != ticket.organization_id || !actor.role.can_set_status() {
        bot.answer_callback_query(&q.id).text("Access denied.").await?;
        return Ok(());
    }

    let result = match action {
        "assign" => interface.lifecycle.assign(&ticket, actor.id).await.map(|t| {
            format!("Ticket #{} assigned to you.", t.id)
        }),
        "resolve" => interface
            .lifecycle
            .set_status(&ticket, TicketStatus::Resolved)
            .await
            .map(|t| format!("Ticket #{} resolved.", t.id)),
        _ => {
            bot.answer_callback_query(&q.id).text("Unknown action").await?;
            return Ok(());
        }
    };

    match result {
        Ok(notice) => {
            bot.answer_callback_query(&q.id).text(notice).await?;
        }
        Err(Error::InvalidTransition { from, .. }) => {
            bot.answer_callback_query(&q.id)
                .text(format!("Ticket is already {}.", status_label(from)))
                .await?;
        }
        Err(e) => {
            error!("callback action failed: {e}");
            bot.answer_callback_query(&q.id).text("Something went wrong.").await?;
        }
    }
    Ok(())
}

impl Notifier {
    /// Send `text` to the customer's chat for this ticket, if it has
    /// one, and move the correlation pointer to the delivered message.
    /// When `record_entry` is set the notice also becomes a
    /// system-authored timeline entry. Delivery failures are logged and
    /// swallowed; the operation that triggered the notice already
    /// happened.
    pub async fn notify_ticket(&self, ticket: &Ticket, text: &str, record_entry: bool) {
        let Some(chat_id) = ticket.telegram_chat_id else {
            return;
        };

        let sent = match self.bot.send_message(ChatId(chat_id), text).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(ticket_id = ticket.id, "notification delivery failed: {e}");
                return;
            }
        };
        let message_id = i64::from(sent.id.0);

        if let Err(e) = self
            .store
            .set_ticket_correlation(ticket.id, chat_id, message_id)
            .await
        {
            error!(ticket_id = ticket.id, "failed to update correlation: {e}");
        }

        if record_entry {
            let entry = NewMessage {
                ticket_id: ticket.id,
                user_id: None,
                content: text.to_string(),
                telegram_message_id: Some(message_id),
                is_from_customer: false,
            };
            if let Err(e) = self.store.create_message(&entry).await {
                error!(ticket_id = ticket.id, "failed to record notice: {e}");
            }
        }
    }
}
