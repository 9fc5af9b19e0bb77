//! Telegram message parsing and reply formatting.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::core::{Execution, QueueItem, Target, TargetStatus};

pub const HELP_TEXT: &str = r#"TaskRelay Commands:

/help - Show this help
/queue - List queued requests
/status - Show running targets
/cancel <execution id> - Cancel a running execution
/dequeue <seq> - Remove a queued request
/new <message> - Start a fresh session instead of continuing
/forget @type:name - Forget a target's session

Messages:
- Plain text runs on the orchestrator
- Prefix with @project:<name> or @agent:<name> to pick a target"#;

/// A parsed chat message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Help,
    Queue,
    Status,
    Cancel(String),
    Dequeue(u64),
    Forget(Target),
    Prompt {
        target: Target,
        prompt: String,
        continue_session: bool,
    },
}

fn target_prefix() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^@(orchestrator|project|agent):([A-Za-z0-9_.\-]+)\s+(.+)$").ok())
        .as_ref()
}

/// Parse message text into a command. `Err` carries a usage hint.
pub fn parse_chat_text(text: &str) -> Result<ChatCommand, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("Empty message.".to_string());
    }

    if !text.starts_with('/') {
        return parse_prompt(text, true);
    }

    let (command, rest) = match text.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (text, ""),
    };
    // Commands may be addressed as /queue@botname.
    let command = command.split('@').next().unwrap_or(command);

    match command {
        "/start" | "/help" => Ok(ChatCommand::Help),
        "/queue" => Ok(ChatCommand::Queue),
        "/status" => Ok(ChatCommand::Status),
        "/cancel" if !rest.is_empty() => Ok(ChatCommand::Cancel(rest.to_string())),
        "/cancel" => Err("Usage: /cancel <execution id>".to_string()),
        "/dequeue" => rest
            .trim_start_matches('#')
            .parse()
            .map(ChatCommand::Dequeue)
            .map_err(|_| "Usage: /dequeue <seq>".to_string()),
        "/new" if !rest.is_empty() => parse_prompt(rest, false),
        "/new" => Err("Usage: /new <message>".to_string()),
        "/forget" => rest
            .trim_start_matches('@')
            .parse()
            .map(ChatCommand::Forget)
            .map_err(|_| "Usage: /forget @type:name".to_string()),
        _ => Err(format!("Unknown command {}. Try /help.", command)),
    }
}

fn parse_prompt(text: &str, continue_session: bool) -> Result<ChatCommand, String> {
    if let Some(caps) = target_prefix().and_then(|re| re.captures(text)) {
        let target: Target = format!("{}:{}", &caps[1], &caps[2]).parse()?;
        return Ok(ChatCommand::Prompt {
            target,
            prompt: caps[3].trim().to_string(),
            continue_session,
        });
    }

    if text.starts_with('@') {
        return Err("Targets look like @project:<name> or @agent:<name>, followed by a message.".to_string());
    }

    Ok(ChatCommand::Prompt {
        target: Target::orchestrator(),
        prompt: text.to_string(),
        continue_session,
    })
}

/// Queue listing reply.
pub fn format_queue(items: &[QueueItem]) -> String {
    if items.is_empty() {
        return "Queue is empty.".to_string();
    }

    let mut response = String::from("Queued:\n");
    for item in items {
        response.push_str(&format!(
            "• #{} {} - {}\n",
            item.seq_id,
            item.request.target(),
            preview(&item.request.prompt, 60)
        ));
    }
    response
}

/// Status reply: running executions and last known target states.
pub fn format_status(active: &[Execution], targets: &BTreeMap<String, TargetStatus>) -> String {
    let mut response = String::new();

    if active.is_empty() {
        response.push_str("Nothing running.\n");
    } else {
        response.push_str("Running:\n");
        for execution in active {
            response.push_str(&format!(
                "• {} {} - {}\n",
                execution.target(),
                execution.id,
                preview(&execution.prompt, 60)
            ));
        }
    }

    let idle: Vec<String> = targets
        .iter()
        .filter(|(_, status)| !status.running)
        .map(|(key, status)| format!("• {} ({})", key, status.last_status))
        .collect();
    if !idle.is_empty() {
        response.push_str("\nIdle:\n");
        response.push_str(&idle.join("\n"));
    }

    response.trim_end().to_string()
}

/// First `max` characters of a single-line rendering of `text`.
pub fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TargetType;

    #[test]
    fn plain_text_goes_to_orchestrator_and_continues() {
        assert_eq!(
            parse_chat_text("summarize the repo"),
            Ok(ChatCommand::Prompt {
                target: Target::orchestrator(),
                prompt: "summarize the repo".into(),
                continue_session: true,
            })
        );
    }

    #[test]
    fn target_prefix_selects_target() {
        assert_eq!(
            parse_chat_text("@project:web-app fix the login\nthen test"),
            Ok(ChatCommand::Prompt {
                target: Target::new(TargetType::Project, "web-app"),
                prompt: "fix the login\nthen test".into(),
                continue_session: true,
            })
        );
        assert!(parse_chat_text("@robot:x hi").is_err());
    }

    #[test]
    fn new_starts_fresh_session() {
        let Ok(ChatCommand::Prompt { target, continue_session, .. }) =
            parse_chat_text("/new @agent:scout look around")
        else {
            panic!("expected prompt");
        };
        assert_eq!(target, Target::new(TargetType::Agent, "scout"));
        assert!(!continue_session);
    }

    #[test]
    fn commands_parse_arguments() {
        assert_eq!(parse_chat_text("/queue@relay_bot"), Ok(ChatCommand::Queue));
        assert_eq!(parse_chat_text("/dequeue #6"), Ok(ChatCommand::Dequeue(6)));
        assert_eq!(
            parse_chat_text("/cancel 01HXYZ"),
            Ok(ChatCommand::Cancel("01HXYZ".into()))
        );
        assert_eq!(
            parse_chat_text("/forget @project:site"),
            Ok(ChatCommand::Forget(Target::new(TargetType::Project, "site")))
        );
        assert!(parse_chat_text("/dequeue six").is_err());
        assert!(parse_chat_text("/cancel").is_err());
        assert!(parse_chat_text("/bogus").is_err());
    }

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(preview("a\n b", 10), "a b");
        assert_eq!(preview("abcdef", 3), "abc…");
    }
}
