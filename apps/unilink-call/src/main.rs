use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use unilink_call_core::cli::{Cli, Command, JoinArgs};
use unilink_call_core::directory::HttpCallDirectory;
use unilink_call_core::media::VirtualDevices;
use unilink_call_core::negotiation::RtcPeerLinkFactory;
use unilink_call_core::session::{
    CallHandle, CallParams, Collaborators, SessionSnapshot, start_call,
};
use unilink_call_core::signaling::WsSignalingConnector;
use unilink_call_core::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("failed to initialise logging")?;
    let config = cli.call_config().context("invalid --server url")?;
    let Command::Join(join) = &cli.command;

    let directory = HttpCallDirectory::new(config.clone(), join.token.clone())
        .context("failed to build call api client")?;
    let deps = Collaborators {
        directory: Arc::new(directory),
        devices: Arc::new(VirtualDevices::default()),
        signaling: Arc::new(WsSignalingConnector::new(config.clone())),
        links: Arc::new(RtcPeerLinkFactory::new()),
    };
    let params = CallParams {
        call_id: join.call_id.clone(),
        user_id: join.user_id.clone(),
        token: join.token.clone(),
    };
    tracing::info!(
        target = "session",
        call_id = %params.call_id,
        api = %config.api_base,
        chat = config.chat_mode.as_str(),
        "joining call"
    );

    let handle = start_call(config, params, deps);
    apply_initial_toggles(&handle, join);
    let printer = tokio::spawn(print_updates(handle.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("hanging up...");
                handle.hangup().await;
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_input(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    // stdin closed; stay in the call until it ends.
                    handle.wait_for(|s| s.is_terminal()).await;
                    break;
                }
            },
            _ = handle.wait_for(|s| s.is_terminal()) => break,
        }
    }

    let _ = printer.await;
    let last = handle.snapshot();
    if last.status == unilink_call_core::session::CallStatus::Failed {
        anyhow::bail!(
            "call failed: {}",
            last.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}

fn apply_initial_toggles(handle: &CallHandle, join: &JoinArgs) {
    if join.muted {
        handle.set_audio_enabled(false);
    }
    if join.no_camera {
        handle.set_video_enabled(false);
    }
}

/// Returns `false` once the user asked to leave.
async fn run_input(handle: &CallHandle, line: &str) -> bool {
    match line {
        "" => {}
        "/end" | "/quit" => {
            handle.hangup().await;
            return false;
        }
        "/mute" => match handle.toggle_mute().await {
            Some(enabled) => println!("microphone {}", on_off(enabled)),
            None => println!("no microphone track"),
        },
        "/camera" => match handle.toggle_camera().await {
            Some(enabled) => println!("camera {}", on_off(enabled)),
            None => println!("no camera track"),
        },
        "/retry" => handle.retry_negotiation(),
        "/help" => {
            println!("/mute  /camera  /retry  /end  or type a message to chat");
        }
        text => {
            if let Err(err) = handle.send_chat(text).await {
                println!("! chat not sent: {err}");
            }
        }
    }
    true
}

async fn print_updates(mut rx: watch::Receiver<SessionSnapshot>) {
    let mut last_status = None;
    let mut last_error: Option<String> = None;
    let mut seen_chat = 0;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if last_status != Some(snapshot.status) {
            println!(
                "[{}] {:?}{}",
                snapshot.lifecycle().as_str(),
                snapshot.status,
                snapshot
                    .role
                    .map(|r| format!(" as {}", r.as_str()))
                    .unwrap_or_default()
            );
            last_status = Some(snapshot.status);
        }
        if snapshot.error != last_error {
            if let Some(error) = snapshot.error.as_deref() {
                println!("! {error}");
            }
            last_error = snapshot.error.clone();
        }
        for message in snapshot.chat.messages().iter().skip(seen_chat) {
            if !message.is_local {
                println!("<{}> {}", message.sender, message.text);
            }
        }
        seen_chat = snapshot.chat.len();
        if snapshot.is_terminal() || rx.changed().await.is_err() {
            break;
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
