//! A scripted agent behind a `MemoryTransport`, for trying the client
//! without a server.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agent_sync::event::observation::{
    AgentStateExtras, FileChange, FileChangedExtras, ProgressExtras,
};
use agent_sync::event::{AgentState, wire};
use agent_sync::{Action, DomainEvent, EventSource, MemoryServer, ObservationKind};

const STEP: Duration = Duration::from_millis(120);

pub fn spawn(server: MemoryServer) -> JoinHandle<()> {
    tokio::spawn(run(server))
}

async fn run(server: MemoryServer) {
    let mut agent = DemoAgent {
        server,
        next_id: 1,
        replies: 0,
    };
    let mut handled = 0;
    loop {
        agent.server.wait_for_sent(handled + 1).await;
        let sent = agent.server.sent_events();
        for event in &sent[handled.min(sent.len())..] {
            agent.respond(event).await;
        }
        handled = sent.len();
    }
}

struct DemoAgent {
    server: MemoryServer,
    next_id: u64,
    replies: u64,
}

impl DemoAgent {
    async fn respond(&mut self, event: &DomainEvent) {
        let Some(Action::Message(args)) = event.as_action() else {
            debug!(event_type = event.type_tag(), "demo agent ignoring action");
            return;
        };
        self.replies += 1;
        let text = args.content.clone();

        self.push_state(AgentState::Running).await;

        let subject = format!("reply-{}", self.replies);
        let words: Vec<&str> = text.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            self.push_observation(
                ObservationKind::Progress(ProgressExtras {
                    subject: subject.clone(),
                    complete: i + 1 == words.len(),
                }),
                word,
            )
            .await;
        }

        // A burst of edits to one file lands as a single batch.
        let path = format!("notes/{}.md", self.replies);
        for change in [FileChange::Created, FileChange::Modified, FileChange::Modified] {
            self.push_observation(
                ObservationKind::FileChanged(FileChangedExtras {
                    path: path.clone(),
                    change,
                }),
                "",
            )
            .await;
        }

        let mut reply = DomainEvent::user_action(Action::message(format!("You said: {text}")));
        reply.source = EventSource::Agent;
        self.push(reply).await;

        self.push_state(AgentState::AwaitingUserInput).await;
    }

    async fn push_state(&mut self, agent_state: AgentState) {
        self.push_observation(
            ObservationKind::AgentStateChanged(AgentStateExtras {
                agent_state,
                reason: None,
            }),
            "",
        )
        .await;
    }

    async fn push_observation(&mut self, kind: ObservationKind, content: &str) {
        let mut event = DomainEvent::local_observation(content, kind);
        event.source = EventSource::Agent;
        self.push(event).await;
    }

    async fn push(&mut self, mut event: DomainEvent) {
        tokio::time::sleep(STEP / 4).await;
        event.id = Some(self.next_id);
        match wire::encode(&event) {
            Ok(frame) => {
                if self.server.push(frame) {
                    self.next_id += 1;
                } else {
                    debug!(id = self.next_id, "demo agent has no link, event not delivered");
                }
            }
            Err(e) => warn!(error = %e, "demo agent could not encode event"),
        }
        if event.type_tag() == "agent_state_changed" {
            tokio::time::sleep(STEP).await;
        }
    }
}
