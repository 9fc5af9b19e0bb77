//! Telegram bot client - long polling, one digest message per execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::BotCommand;
use teloxide::RequestError;

use crate::config::TelegramConfig;
use crate::core::{
    Dispatch, DispatchRequest, Dispatcher, ExecutionEvent, Interest, Source, Subscription,
};
use crate::error::Error;

use super::digest::{render_digest, run_digest};
use super::handler::{format_queue, format_status, parse_chat_text, ChatCommand, HELP_TEXT};

/// Shared state behind the bot's message handler.
struct ChatBridge {
    dispatcher: Arc<Dispatcher>,
    config: TelegramConfig,
    /// Queued requests waiting for a digest: `seq -> chat`.
    pending: Mutex<HashMap<u64, ChatId>>,
}

impl ChatBridge {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ChatId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn digest_interval(&self) -> Duration {
        Duration::from_millis(self.config.digest_interval_ms)
    }

    async fn handle_message(&self, bot: Bot, msg: Message) -> Result<(), RequestError> {
        let chat_id = msg.chat.id;
        let Some(text) = msg.text() else {
            return Ok(());
        };

        if !self.config.is_chat_allowed(chat_id.0) {
            tracing::warn!("Ignoring message from unlisted chat {}", chat_id.0);
            bot.send_message(chat_id, "This chat is not allowed to dispatch work.").await?;
            return Ok(());
        }

        let command = match parse_chat_text(text) {
            Ok(command) => command,
            Err(usage) => {
                bot.send_message(chat_id, usage).await?;
                return Ok(());
            }
        };

        match command {
            ChatCommand::Help => {
                bot.send_message(chat_id, HELP_TEXT).await?;
            }
            ChatCommand::Queue => {
                let items = self.dispatcher.queue().get_all().await;
                bot.send_message(chat_id, format_queue(&items)).await?;
            }
            ChatCommand::Status => {
                let active = self.dispatcher.manager().active();
                let targets = self.dispatcher.target_statuses();
                bot.send_message(chat_id, format_status(&active, &targets)).await?;
            }
            ChatCommand::Cancel(id) => {
                let reply = if self.dispatcher.cancel(&id) {
                    format!("Cancelling {}", id)
                } else {
                    format!("Nothing running with id {}", id)
                };
                bot.send_message(chat_id, reply).await?;
            }
            ChatCommand::Dequeue(seq) => {
                let reply = if self.dispatcher.queue().remove(seq).await {
                    self.pending().remove(&seq);
                    format!("Removed #{} from the queue", seq)
                } else {
                    format!("#{} is not queued", seq)
                };
                bot.send_message(chat_id, reply).await?;
            }
            ChatCommand::Forget(target) => {
                let reply = if self.dispatcher.sessions().forget(&target.key()) {
                    format!("Next message to {} starts a fresh session", target)
                } else {
                    format!("No session stored for {}", target)
                };
                bot.send_message(chat_id, reply).await?;
            }
            ChatCommand::Prompt {
                target,
                prompt,
                continue_session,
            } => {
                let mut request = DispatchRequest::new(Source::Chat, target, prompt);
                request.continue_session = continue_session;
                self.dispatch(&bot, chat_id, request).await?;
            }
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        bot: &Bot,
        chat_id: ChatId,
        request: DispatchRequest,
    ) -> Result<(), RequestError> {
        let target = request.target();
        match self.dispatcher.dispatch(request).await {
            Err(e) => {
                bot.send_message(chat_id, format!("Failed to dispatch: {}", e)).await?;
            }
            Ok(Dispatch::Started { id, .. }) => {
                self.start_digest(bot, chat_id, &id).await?;
            }
            Ok(Dispatch::Queued { item, position }) => {
                let seq = item.seq_id;
                bot.send_message(
                    chat_id,
                    format!("Queued #{} for {} (position {})", seq, target, position),
                )
                .await?;

                self.pending().insert(seq, chat_id);
                // Promoted before the pending entry existed: the watcher
                // missed it, so start the digest here.
                if self.dispatcher.queue().position(seq).await.is_none() {
                    self.promote(bot, seq).await?;
                }
            }
        }
        Ok(())
    }

    /// Start the digest for a promoted queue item, once.
    async fn promote(&self, bot: &Bot, seq: u64) -> Result<(), RequestError> {
        let chat_id = self.pending().remove(&seq);
        let Some(chat_id) = chat_id else {
            return Ok(());
        };
        match self.dispatcher.manager().find_by_queue_seq(seq) {
            Some(execution) => self.start_digest(bot, chat_id, &execution.id).await,
            None => Ok(()),
        }
    }

    async fn start_digest(&self, bot: &Bot, chat_id: ChatId, id: &str) -> Result<(), RequestError> {
        let Some(attachment) = self.dispatcher.attach(id) else {
            return Ok(());
        };

        let message = bot
            .send_message(chat_id, render_digest(&attachment.execution, &attachment.catch_up))
            .await?;
        tokio::spawn(run_digest(
            bot.clone(),
            chat_id,
            message.id,
            attachment,
            self.digest_interval(),
        ));
        Ok(())
    }

    /// Follow queue promotions so queued chat requests get their digest.
    async fn watch_promotions(self: Arc<Self>, bot: Bot, mut events: Subscription) {
        while let Some(event) = events.recv().await {
            if let ExecutionEvent::Started { info, .. } = &event {
                if let Some(seq) = info.queue_seq {
                    if let Err(e) = self.promote(&bot, seq).await {
                        tracing::warn!("Failed to start digest for #{}: {}", seq, e);
                    }
                }
            }
        }
    }
}

/// Run the telegram bot daemon using long polling.
pub async fn run_telegram_daemon(
    dispatcher: Arc<Dispatcher>,
    config: TelegramConfig,
) -> Result<(), Error> {
    tracing::info!("Starting Telegram bot...");

    let token = config
        .bot_token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| Error::Telegram("No bot token configured".to_string()))?;

    let bot = Bot::new(token);

    if let Err(e) = bot
        .set_my_commands(vec![
            BotCommand::new("help", "Show help"),
            BotCommand::new("queue", "List queued requests"),
            BotCommand::new("status", "Show running targets"),
            BotCommand::new("cancel", "Cancel an execution"),
            BotCommand::new("dequeue", "Remove a queued request"),
            BotCommand::new("new", "Start a fresh session"),
            BotCommand::new("forget", "Forget a target's session"),
        ])
        .await
    {
        tracing::warn!("Failed to set commands: {}", e);
    }

    let bridge = Arc::new(ChatBridge {
        dispatcher: Arc::clone(&dispatcher),
        config,
        pending: Mutex::new(HashMap::new()),
    });

    tokio::spawn(
        Arc::clone(&bridge).watch_promotions(bot.clone(), dispatcher.bus().subscribe(Interest::Lifecycle)),
    );

    tracing::info!("Telegram bot listening");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let bridge = Arc::clone(&bridge);
        async move { bridge.handle_message(bot, msg).await }
    })
    .await;

    Ok(())
}
