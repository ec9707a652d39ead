use crate::cache::ConversationCache;
use crate::config::Config;
use crate::identity::{Credential, IdentityProvider, Principal, Role, StaticIdentity};
use crate::rest::{HistoryApi, HttpHistoryApi};
use crate::transport::TransportChannel;
use crate::types::{DeliveryState, Message};
use crate::views::{
    BuyerCommand, BuyerView, OperatorCommand, OperatorView, OrderCommand, OrderPhase,
    OrderTrackingView, StepState,
};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

const DEFAULT_SUPPORT_ID: &str = "support";

/// Who the console acts as and which view it opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleOptions {
    pub token: String,
    pub user_id: String,
    pub display_name: String,
    pub operator: bool,
    pub order_id: Option<String>,
    pub support_id: String,
}

impl ConsoleOptions {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let mut token = std::env::var("STORELINK_TOKEN").ok();
        let mut user_id = None;
        let mut display_name = None;
        let mut operator = false;
        let mut order_id = None;
        let mut support_id = DEFAULT_SUPPORT_ID.to_string();

        let mut i = 3;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--token" => token = value,
                "--user" => user_id = value,
                "--name" => display_name = value,
                "--order" => order_id = value,
                "--support" => {
                    if let Some(id) = value {
                        support_id = id;
                    }
                }
                "--operator" => {
                    operator = true;
                    i += 1;
                    continue;
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }

        let token = token.ok_or_else(|| anyhow::anyhow!("--token (or STORELINK_TOKEN) is required"))?;
        let user_id = user_id.ok_or_else(|| anyhow::anyhow!("--user is required"))?;
        Ok(Self {
            display_name: display_name.unwrap_or_else(|| user_id.clone()),
            token,
            user_id,
            operator,
            order_id,
            support_id,
        })
    }

    pub fn principal(&self) -> Principal {
        let role = if self.operator {
            Role::Operator
        } else {
            Role::Buyer
        };
        Principal::new(
            self.user_id.clone(),
            self.display_name.clone(),
            role,
            Credential::new(self.token.clone()),
        )
    }
}

/// Open the selected view and drive it from stdin until `/quit` or EOF
pub async fn run(config: Config, options: ConsoleOptions) -> anyhow::Result<()> {
    let principal = options.principal();
    let identity = StaticIdentity::new(principal.clone());
    let channel = TransportChannel::new(config.clone());
    let api: Arc<dyn HistoryApi> =
        Arc::new(HttpHistoryApi::new(&config, principal.credential.clone()));

    print_banner(&options);
    if let Err(e) = channel.connect(&identity).await {
        // REST still works; live updates come back with /reconnect
        eprintln!("{} {}", "✗".red().bold(), e.user_message().red());
    }

    if let Some(order_id) = &options.order_id {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_input(channel.clone(), identity, tx, parse_order_line);
        let mut view = OrderTrackingView::new(order_id, &channel, api);
        view.activate().await;
        render_order(&view);
        while view.step(&mut rx).await {
            render_order(&view);
        }
        view.deactivate();
    } else if principal.is_operator() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_input(channel.clone(), identity, tx, parse_operator_line);
        let mut view = OperatorView::new(principal, &channel, api);
        view.activate().await;
        render_operator(&view);
        while view.step(&mut rx).await {
            render_operator(&view);
        }
        view.deactivate();
    } else {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_input(channel.clone(), identity, tx, parse_buyer_line);
        let mut view = BuyerView::new(principal, &options.support_id, &channel, api);
        if let Some(dir) = &config.cache_dir {
            match ConversationCache::open(dir) {
                Ok(cache) => view = view.with_cache(cache),
                Err(e) => warn!("Running without cache: {}", e),
            }
        }
        view.activate().await;
        render_buyer(&view);
        while view.step(&mut rx).await {
            render_buyer(&view);
        }
        view.deactivate();
    }

    channel.close();
    Ok(())
}

/// Forward parsed stdin lines to the view. `/reconnect` is handled here
/// since it concerns the channel, not the view.
fn spawn_input<C, F>(
    channel: TransportChannel,
    identity: StaticIdentity,
    tx: mpsc::UnboundedSender<C>,
    parse: F,
) where
    C: Send + 'static,
    F: Fn(&str) -> Vec<C> + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() == "/reconnect" {
                if let Err(e) = channel.connect(&identity as &dyn IdentityProvider).await {
                    eprintln!("{} {}", "✗".red().bold(), e.user_message().red());
                }
                continue;
            }
            for command in parse(&line) {
                if tx.send(command).is_err() {
                    return;
                }
            }
        }
        // dropping tx ends the view loop
    });
}

pub fn parse_buyer_line(line: &str) -> Vec<BuyerCommand> {
    let line = line.trim();
    match line {
        "" => Vec::new(),
        "/quit" => vec![BuyerCommand::Deactivate],
        "/retry" => vec![BuyerCommand::RetryHistory],
        text => vec![
            BuyerCommand::Keystroke,
            BuyerCommand::SetDraft(text.to_string()),
            BuyerCommand::Send,
        ],
    }
}

pub fn parse_operator_line(line: &str) -> Vec<OperatorCommand> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let (head, rest) = match line.split_once(' ') {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    match head {
        "/quit" => vec![OperatorCommand::Deactivate],
        "/refresh" => vec![OperatorCommand::RefreshRoster],
        "/select" if !rest.is_empty() => vec![OperatorCommand::Select(rest.to_string())],
        "/search" => vec![OperatorCommand::Search(rest.to_string())],
        "/retry" if !rest.is_empty() => vec![OperatorCommand::Retry(rest.to_string())],
        _ if head.starts_with('/') => {
            print_operator_help();
            Vec::new()
        }
        _ => vec![
            OperatorCommand::Keystroke,
            OperatorCommand::SetDraft(line.to_string()),
            OperatorCommand::Send,
        ],
    }
}

pub fn parse_order_line(line: &str) -> Vec<OrderCommand> {
    match line.trim() {
        "/quit" => vec![OrderCommand::Deactivate],
        "/retry" => vec![OrderCommand::Retry],
        _ => Vec::new(),
    }
}

fn print_banner(options: &ConsoleOptions) {
    println!("{}", "⚡ StoreLink".bright_cyan().bold());
    let mode = match (&options.order_id, options.operator) {
        (Some(order), _) => format!("tracking order {}", order),
        (None, true) => "operator inbox".to_string(),
        (None, false) => format!("chat with {}", options.support_id),
    };
    println!(
        "  {} as {} ({})",
        mode.bright_white(),
        options.display_name.cyan(),
        options.user_id.dimmed()
    );
    println!("  {} to leave, {} to re-dial", "/quit".yellow(), "/reconnect".yellow());
    println!();
}

fn print_operator_help() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <peer_id>   Open a conversation", "/select".cyan());
    println!("  {} <text>      Filter the roster", "/search".cyan());
    println!("  {} <local_id>   Resend a failed message", "/retry".cyan());
    println!("  {}             Reload the roster", "/refresh".cyan());
    println!("  {}                Leave", "/quit".cyan());
}

fn connection_badge(connected: bool) -> ColoredString {
    if connected {
        "● live".green()
    } else {
        "○ offline".red()
    }
}

fn print_message(self_id: &str, message: &Message) {
    let who = if message.sender_id == self_id {
        "you".bright_blue()
    } else {
        message
            .sender_name
            .as_deref()
            .unwrap_or(&message.sender_id)
            .cyan()
    };
    let state = match message.delivery_state {
        DeliveryState::Confirmed => "".normal(),
        DeliveryState::Pending => " …".dimmed(),
        DeliveryState::Failed => format!(" ✗ failed ({})", message.id).red(),
    };
    println!(
        "  {} {}: {}{}",
        message.created_at.format("%H:%M").to_string().dimmed(),
        who,
        message.content,
        state
    );
}

fn render_buyer(view: &BuyerView) {
    println!("{}", "─".repeat(60).dimmed());
    println!("{}", connection_badge(view.is_connected()));
    if let Some(error) = view.history_error() {
        println!("{} {} {}", "!".yellow().bold(), error.yellow(), "(/retry)".dimmed());
    }
    if view.is_empty_state() {
        println!("  {}", "No messages yet. Say hello!".dimmed());
    }
    for message in view.messages() {
        print_message(view.self_id(), message);
    }
    if view.support_typing() {
        println!("  {}", "support is typing…".dimmed().italic());
    }
    if let Some(error) = view.send_error() {
        println!("{} {}", "✗".red().bold(), error.red());
        println!("  {} {}", "draft kept:".dimmed(), view.draft());
    }
}

fn render_operator(view: &OperatorView) {
    println!("{}", "─".repeat(60).dimmed());
    println!("{}", connection_badge(view.is_connected()));
    if view.roster_loading() {
        println!("  {}", "loading conversations…".dimmed());
    }
    if let Some(error) = view.roster_error() {
        println!("{} {}", "!".yellow().bold(), error.yellow());
    }

    let selected = view.selection().peer();
    for entry in view.visible_roster() {
        let marker = if Some(entry.peer_id.as_str()) == selected {
            "▶".bright_cyan()
        } else {
            " ".normal()
        };
        let typing = if entry.is_typing {
            " typing…".dimmed().italic()
        } else {
            "".normal()
        };
        println!(
            "{} {} {}{}  {}",
            marker,
            entry.display_name.bright_white(),
            format!("({})", entry.peer_id).dimmed(),
            typing,
            entry.preview.dimmed()
        );
    }

    if let Some(conversation) = view.conversation() {
        println!(
            "{}",
            format!("── {} ", conversation.peer_display_name).bright_cyan()
        );
        if view.is_auto_selected() {
            println!("  {}", "switched here because of a new message".yellow());
        }
        if view.history_loading() {
            println!("  {}", "loading…".dimmed());
        }
        if let Some(error) = view.history_error() {
            println!("{} {}", "!".yellow().bold(), error.yellow());
        }
        if conversation.is_empty() && view.history_error().is_none() {
            println!("  {}", "No messages yet.".dimmed());
        }
        for message in &conversation.messages {
            print_message(view.self_id(), message);
        }
        if view.is_peer_typing(&conversation.peer_id) {
            println!(
                "  {}",
                format!("{} is typing…", conversation.peer_display_name)
                    .dimmed()
                    .italic()
            );
        }
        if view.is_typing_to(&conversation.peer_id) {
            println!("  {} {}", "✎".dimmed(), view.draft().dimmed());
        }
    }
    if let Some(error) = view.send_error() {
        println!("{} {}", "✗".red().bold(), error.red());
    }
}

fn render_order(view: &OrderTrackingView) {
    println!("{}", "─".repeat(60).dimmed());
    println!(
        "{} {}",
        format!("Order {}", view.order_id()).bright_white().bold(),
        connection_badge(view.is_connected())
    );
    match view.phase() {
        OrderPhase::Loading => println!("  {}", "loading…".dimmed()),
        OrderPhase::Failed { message } => {
            println!("{} {}", "✗".red().bold(), message.red());
            println!("  {} to go back", "/quit".yellow());
        }
        OrderPhase::Tracking => {
            for step in view.progress() {
                let line = match step.state {
                    StepState::Complete => format!("✓ {}", step.status).green(),
                    StepState::Current => format!("● {}", step.status).bright_cyan().bold(),
                    StepState::NotReached => format!("○ {}", step.status).dimmed(),
                };
                println!("  {}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_options_from_args() {
        let opts = ConsoleOptions::from_args(&args(&[
            "storelink",
            "127.0.0.1:7070",
            "http://127.0.0.1:7071",
            "--token",
            "t0k",
            "--user",
            "op-1",
            "--operator",
            "--name",
            "Dana",
        ]))
        .unwrap();
        assert!(opts.operator);
        assert_eq!(opts.user_id, "op-1");
        assert_eq!(opts.display_name, "Dana");
        assert_eq!(opts.principal().role, Role::Operator);
        assert!(opts.order_id.is_none());
    }

    #[test]
    fn test_operator_line_parsing() {
        assert_eq!(
            parse_operator_line("/select 42"),
            vec![OperatorCommand::Select("42".to_string())]
        );
        assert_eq!(
            parse_operator_line("/search  ann "),
            vec![OperatorCommand::Search("ann".to_string())]
        );
        assert_eq!(
            parse_operator_line("Hello"),
            vec![
                OperatorCommand::Keystroke,
                OperatorCommand::SetDraft("Hello".to_string()),
                OperatorCommand::Send
            ]
        );
        assert!(parse_operator_line("   ").is_empty());
    }

    #[test]
    fn test_buyer_and_order_line_parsing() {
        assert_eq!(parse_buyer_line("/retry"), vec![BuyerCommand::RetryHistory]);
        assert_eq!(parse_order_line("/quit"), vec![OrderCommand::Deactivate]);
        assert!(parse_order_line("hello").is_empty());
    }
}
