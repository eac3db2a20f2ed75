//! Example: drive a channel against an in-process fake host
//!
//! The host acknowledges the handshake, answers every architect command and
//! pushes an environment update now and then. Nothing leaves the process.
//!
//! Run with:
//!   cargo run --example loopback_host

use archlink_channel::{
    AutonomousAction, AutonomousOutcome, Category, Channel, ChannelConfig, ChannelEvent,
    LoopbackConnector, Message,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (connector, mut host) = LoopbackConnector::pair();
    let config = ChannelConfig::new("loopback://demo", "demo-key");
    let channel = Channel::builder(config).connector(connector).build()?;

    tokio::spawn(async move {
        while let Some(mut end) = host.accept().await {
            if end.accept_handshake().await.is_none() {
                continue;
            }
            println!("host: accepted link (key {:?})", end.api_key());

            let mut served = 0;
            while let Some(command) = end.recv().await {
                if command.is(Category::System, "disconnect") {
                    println!("host: peer said goodbye");
                    break;
                }
                println!("host: got {}", command.describe());
                end.respond(&command, "completed");

                served += 1;
                if served % 2 == 0 {
                    end.send(&Message::environment(
                        "state_update",
                        "scene",
                        json!({"objects": served}),
                    ));
                }
            }
        }
    });

    let mut events = channel.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChannelEvent::StateChanged { from, to } => println!("event: {} -> {}", from, to),
                ChannelEvent::Unsolicited(message) => println!("event: push {}", message.describe()),
                ChannelEvent::ApprovalRequired(action) => println!("event: approval needed for {}", action.kind),
                other => println!("event: {:?}", other),
            }
        }
    });

    channel.connect().await?;

    for task in ["raise terrain", "place a bridge", "light the valley"] {
        let reply = channel
            .send_command(Message::architect_request(task, json!({"architect": "demo"})))
            .await?;
        println!("client: {:?} -> {}", task, reply.status().unwrap_or("?"));
    }

    for kind in ["plant_forest", "reset_scene"] {
        match channel.submit_autonomous(AutonomousAction::new(kind))? {
            AutonomousOutcome::Dispatched(command) => println!("client: dispatched {}", command.describe()),
            AutonomousOutcome::NeedsApproval(action) => println!("client: {} held for approval", action.kind),
        }
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    channel.disconnect().await;
    Ok(())
}
