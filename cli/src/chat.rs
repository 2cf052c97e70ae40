use anyhow::Result;
use console::style;
use halyard_core::agent::{AgentLoop, AssistantReply};
use halyard_core::config::get_halyard_dir;
use halyard_core::{AgentError, ChatMessage, Role, Session, ToolSpec};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio_util::sync::CancellationToken;

const TOOL_PREVIEW_LEN: usize = 400;

fn is_exit_command(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim_end();
    if trimmed.chars().count() > max_chars {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

fn print_message(message: &ChatMessage) {
    match message.role {
        Role::Assistant => {
            let text = message.text();
            if !text.trim().is_empty() {
                println!("{} {}", style("[agent]").cyan().bold(), text.trim());
            }
            for call in message.tool_calls() {
                println!(
                    "{} {}({})",
                    style("[tools]").yellow().bold(),
                    call.name,
                    render_args(call)
                );
            }
        }
        Role::Tool => {
            let label = if message.is_error {
                style("[tools]").red().bold()
            } else {
                style("[tools]").yellow().bold()
            };
            println!(
                "{} {}",
                label,
                style(preview(&message.text(), TOOL_PREVIEW_LEN)).dim()
            );
        }
        Role::System | Role::User => {}
    }
}

fn render_args(call: &halyard_core::ToolCall) -> String {
    call.arguments
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn tool_summary(specs: &[ToolSpec]) -> String {
    if specs.is_empty() {
        return "none".to_string();
    }
    specs
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_reply(reply: &AssistantReply) {
    for message in &reply.messages {
        print_message(message);
    }
}

fn print_error(err: &AgentError) {
    eprintln!("{} {}", style("Error:").red().bold(), err);
}

/// Runs one turn, letting Ctrl-C cancel it.
async fn run_turn(
    agent: &AgentLoop,
    session: &mut Session,
    input: &str,
) -> Result<AssistantReply, AgentError> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = agent.run_turn_with_cancel(session, input, &cancel).await;
    watcher.abort();
    result
}

/// Prints the reply or the error and reports whether the turn succeeded.
pub async fn run_once(agent: &AgentLoop, session: &mut Session, input: &str) -> bool {
    match run_turn(agent, session, input).await {
        Ok(reply) => {
            print_reply(&reply);
            true
        }
        Err(e) => {
            print_error(&e);
            false
        }
    }
}

pub async fn run_interactive(
    agent: &AgentLoop,
    session: &mut Session,
    ephemeral: bool,
) -> Result<()> {
    let history_path = get_halyard_dir().join("history");
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("{}", style("halyard").cyan().bold());
    if ephemeral {
        println!("{}", style("session is in memory only").dim());
    } else if session.is_empty() {
        println!("{} {}", style("session").dim(), session.id);
    } else {
        println!(
            "{} {} {}",
            style("resumed session").dim(),
            session.id,
            style(format!("({} messages)", session.len())).dim()
        );
    }
    println!(
        "{} {}",
        style("tools").dim(),
        tool_summary(agent.tool_specs())
    );
    println!(
        "{}\n",
        style("Type exit or quit to leave, Ctrl-C cancels a running query").dim()
    );

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                if is_exit_command(input) {
                    break;
                }

                match run_turn(agent, session, input).await {
                    Ok(reply) => print_reply(&reply),
                    Err(AgentError::Cancelled) => {
                        println!("{}", style("cancelled").dim());
                    }
                    Err(e) => print_error(&e),
                }
                println!();
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{} {}", style("Error:").red().bold(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    if !ephemeral && !session.is_empty() {
        println!(
            "{} halyard chat --session {}",
            style("resume with").dim(),
            session.id
        );
    }
    Ok(())
}
