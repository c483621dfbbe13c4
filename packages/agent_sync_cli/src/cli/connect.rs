use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use agent_sync::event::wire;
use agent_sync::{
    Action, Delivery, DomainEvent, EventFilter, MemoryServer, Session, SyncClient,
};

/// What a line typed on stdin asks for.
#[derive(Debug, PartialEq)]
enum Input<'a> {
    Nothing,
    Quit,
    Retry,
    Pending,
    State,
    Metrics,
    /// Demo only: sever the link to watch the client recover.
    Drop,
    Message(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Nothing,
        "/quit" | "/exit" => Input::Quit,
        "/retry" => Input::Retry,
        "/pending" => Input::Pending,
        "/state" => Input::State,
        "/metrics" => Input::Metrics,
        "/drop" => Input::Drop,
        text => Input::Message(text),
    }
}

/// Connect and pump stdin/stdout until EOF on both, `/quit` or Ctrl-C.
pub async fn run(client: SyncClient, session: Session, demo: Option<MemoryServer>) -> Result<()> {
    let mut states = client.connection_state();
    let mut deliveries = client.scheduled(EventFilter::All);
    eprintln!(
        "[agent-sync: conversation {} at {}]",
        session.conversation_id, session.server_endpoint
    );
    client
        .connect(session)
        .await
        .context("Failed to start connection")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                eprintln!("[agent-sync: {state}]");
                if state.is_failed() {
                    eprintln!("[agent-sync: type /retry to try again]");
                }
            }

            delivery = deliveries.next() => match delivery {
                Some(delivery) => print_delivery(&delivery)?,
                None => break,
            },

            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    stdin_open = false;
                    continue;
                };
                match parse_input(&line) {
                    Input::Nothing => {}
                    Input::Quit => break,
                    Input::Retry => {
                        if let Err(e) = client.retry().await {
                            eprintln!("[agent-sync: retry failed: {e}]");
                        }
                    }
                    Input::Pending => {
                        for entry in client.pending_actions().await? {
                            eprintln!(
                                "  #{} {} ({:?}, queued {})",
                                entry.sequence,
                                entry.action.type_tag(),
                                entry.delivery,
                                entry.enqueued_at.format("%H:%M:%S")
                            );
                        }
                    }
                    Input::State => eprintln!("[agent-sync: {}]", client.state()),
                    Input::Metrics => eprintln!("{}", serde_json::to_string(&client.metrics())?),
                    Input::Drop => match &demo {
                        Some(server) => server.drop_link(),
                        None => eprintln!("[agent-sync: /drop only works with --demo]"),
                    },
                    Input::Message(text) => match client.send(Action::message(text)).await {
                        Ok(sequence) => debug!(sequence, "message queued"),
                        Err(e) => eprintln!("[agent-sync: not queued: {e}]"),
                    },
                }
            }
        }
    }

    client.disconnect().await?;
    let pending = client.pending_actions().await?.len();
    if pending > 0 {
        warn!(pending, "actions still queued; they will be sent on the next connect");
    }
    eprintln!("{}", serde_json::to_string(&client.metrics())?);
    Ok(())
}

fn print_delivery(delivery: &Delivery) -> Result<()> {
    let line = serde_json::to_string(&delivery_json(delivery)?)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn delivery_json(delivery: &Delivery) -> Result<Value> {
    match delivery {
        Delivery::Single(event) => event_json(event),
        Delivery::Batch {
            event_type,
            subject,
            events,
        } => {
            let events = events.iter().map(event_json).collect::<Result<Vec<_>>>()?;
            Ok(json!({
                "batch": event_type,
                "subject": subject,
                "events": events,
            }))
        }
    }
}

fn event_json(event: &DomainEvent) -> Result<Value> {
    let bytes = wire::encode(event)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_sync::ObservationKind;
    use agent_sync::event::observation::{FileChange, FileChangedExtras};

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  "), Input::Nothing);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/retry\n"), Input::Retry);
        assert_eq!(parse_input(" fix the build "), Input::Message("fix the build"));
    }

    #[test]
    fn test_batch_json() {
        let changed = |path: &str| {
            DomainEvent::local_observation(
                "",
                ObservationKind::FileChanged(FileChangedExtras {
                    path: path.into(),
                    change: FileChange::Modified,
                }),
            )
        };
        let delivery = Delivery::Batch {
            event_type: "file_changed".into(),
            subject: Some("src/lib.rs".into()),
            events: vec![changed("src/lib.rs"), changed("src/lib.rs")],
        };

        let value = delivery_json(&delivery).unwrap();
        assert_eq!(value["batch"], "file_changed");
        assert_eq!(value["subject"], "src/lib.rs");
        assert_eq!(value["events"].as_array().unwrap().len(), 2);
        assert_eq!(value["events"][0]["observation"], "file_changed");
    }

    #[test]
    fn test_single_json() {
        let value =
            delivery_json(&Delivery::Single(DomainEvent::user_action(Action::message("hi"))))
                .unwrap();
        assert_eq!(value["action"], "message");
        assert_eq!(value["args"]["content"], "hi");
    }
}
