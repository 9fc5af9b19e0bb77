//! Live status message for one execution, edited in place as output arrives.

use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tokio::time::MissedTickBehavior;

use crate::core::{Attachment, Execution, ExecutionEvent, ExecutionStatus};

/// Telegram caps messages at 4096 characters; leave room for the header.
pub const MAX_DIGEST_CHARS: usize = 3500;

fn status_icon(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "⏳",
        ExecutionStatus::Completed => "✅",
        ExecutionStatus::Error => "❌",
        ExecutionStatus::Cancelled => "⛔",
    }
}

/// Render the digest text for an execution and the output seen so far.
pub fn render_digest(execution: &Execution, output: &str) -> String {
    let mut text = format!(
        "{} {} [{}] {}\n",
        status_icon(execution.status),
        execution.target(),
        execution.status,
        execution.id
    );

    // Prefer the final answer once the CLI has reported one.
    let body = match &execution.result {
        Some(result) if !result.output.trim().is_empty() => result.output.as_str(),
        _ => output,
    };
    let body = body.trim();
    if !body.is_empty() {
        text.push('\n');
        let tail = tail_chars(body, MAX_DIGEST_CHARS);
        if tail.len() < body.len() {
            text.push('…');
        }
        text.push_str(tail);
        text.push('\n');
    } else if execution.is_running() {
        text.push_str("\nWaiting for output…\n");
    }

    if let Some(error) = &execution.error {
        text.push_str(&format!("\nError: {}\n", error));
    }

    if !execution.is_running() {
        let mut footer = Vec::new();
        if let Some(ms) = execution.elapsed_ms() {
            footer.push(format!("{:.1}s", ms as f64 / 1000.0));
        }
        if let Some(cost) = execution.result.as_ref().and_then(|r| r.cost_usd) {
            footer.push(format!("${:.4}", cost));
        }
        if !footer.is_empty() {
            text.push_str(&format!("\n{}", footer.join(" · ")));
        }
    }

    text.trim_end().to_string()
}

/// Last `max` characters of `text`, cut on a char boundary.
fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// Edit `message_id` every `interval` while output keeps arriving, then once
/// more with the terminal state.
pub async fn run_digest(
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
    attachment: Attachment,
    interval: Duration,
) {
    let Attachment {
        mut execution,
        catch_up,
        live,
    } = attachment;
    let mut output = catch_up;
    let mut last_sent = render_digest(&execution, &output);

    if let Some(mut live) = live {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = live.recv() => match event {
                    Some(ExecutionEvent::Output { chunk, .. }) => output.push_str(&chunk),
                    Some(event) => {
                        if let Some(info) = event.info() {
                            execution = info.clone();
                        }
                        if event.is_terminal() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let text = render_digest(&execution, &output);
                    if text != last_sent {
                        edit(&bot, chat_id, message_id, &text).await;
                        last_sent = text;
                    }
                }
            }
        }
    }

    let text = render_digest(&execution, &output);
    if text != last_sent {
        edit(&bot, chat_id, message_id, &text).await;
    }
    tracing::debug!("Digest for {} finished ({})", execution.id, execution.status);
}

async fn edit(bot: &Bot, chat_id: ChatId, message_id: MessageId, text: &str) {
    if let Err(e) = bot.edit_message_text(chat_id, message_id, text).await {
        tracing::debug!("Failed to edit digest message: {}", e);
    }
}
