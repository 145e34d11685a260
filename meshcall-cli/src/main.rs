//! Meshcall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use meshcall_core::prelude::*;
use meshcall_core::testing::{MockMediaProvider, SignalingHub};
use meshcall_core::{EventBus, SignalingChannel, TierLimits};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Participant id (e.g., "lunar-falcon-42")
    #[arg(short, long, env = "MESHCALL_IDENTITY")]
    identity: Option<String>,

    /// JSON service configuration
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh call between simulated participants in this process
    Demo {
        /// Participants, caller included
        #[arg(short = 'n', long, default_value_t = 3)]
        participants: usize,

        /// Subscription tier of the caller
        #[arg(long, default_value = "pro")]
        tier: SubscriptionTier,

        /// Place a video call
        #[arg(long)]
        video: bool,

        /// How long the call stays up once every link is connected
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },

    /// Print the admission table
    Tiers {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Connect to a signaling server and print what it sends
    Probe {
        /// Server URL; defaults to the configured one
        #[arg(long, env = "MESHCALL_SIGNALING_URL")]
        url: Option<String>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshcall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let identity = cli.identity.unwrap_or_else(generate_random_identity);

    match cli.command {
        Commands::Demo {
            participants,
            tier,
            video,
            hold_ms,
        } => {
            println!("🔗 Using identity: {identity}");
            let call_type = if video {
                CallType::Video
            } else {
                CallType::Audio
            };
            handle_demo(
                config,
                &identity,
                participants,
                tier,
                call_type,
                Duration::from_millis(hold_ms),
            )
            .await?;
        }
        Commands::Tiers { json } => handle_tiers(&config, json)?,
        Commands::Probe { url, seconds } => {
            handle_probe(config, url, seconds.map(Duration::from_secs)).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<CallServiceConfig> {
    match path {
        Some(path) => CallServiceConfig::from_json_file(path),
        None => Ok(CallServiceConfig::default()),
    }
}

async fn handle_demo(
    config: CallServiceConfig,
    identity: &str,
    participants: usize,
    tier: SubscriptionTier,
    call_type: CallType,
    hold: Duration,
) -> Result<()> {
    anyhow::ensure!(participants >= 2, "a call needs at least 2 participants");

    let hub = SignalingHub::new();
    let names: Vec<String> = std::iter::once(identity.to_string())
        .chain((1..participants).map(|i| format!("guest-{i}")))
        .collect();

    let mut services = Vec::with_capacity(names.len());
    for name in &names {
        let service = CallService::builder()
            .with_local(name.as_str())
            .with_config(config.clone())
            .with_transport(Arc::new(hub.transport(name.as_str())))
            .with_provider(Arc::new(MockMediaProvider::new()))
            .build()?;
        spawn_trace(name.clone(), service.subscribe_events());
        service.start().await?;
        services.push(Arc::new(service));
    }
    wait_until("signaling connected", Duration::from_secs(5), || {
        services.iter().all(|s| s.is_signaling_connected())
    })
    .await?;

    for service in services.iter().skip(1) {
        spawn_auto_answer(Arc::clone(service), call_type.includes_video());
    }

    let caller = &services[0];
    let roster: Vec<ParticipantRef> = names[1..]
        .iter()
        .map(|name| ParticipantRef::new(name.as_str()))
        .collect();
    println!("📞 {identity} calling {} as {tier}", names[1..].join(", "));
    let session = match caller.start_call(roster, call_type, tier).await {
        Ok(session) => session,
        Err(e) => {
            println!("❌ Call refused: {e}");
            shutdown_all(&services).await;
            return Err(e.into());
        }
    };

    let links = participants - 1;
    wait_until("mesh connected", Duration::from_secs(10), || {
        services.iter().all(|s| {
            let peers = s.peer_links();
            peers.len() == links
                && peers
                    .iter()
                    .all(|l| l.connection_state == ConnectionState::Connected)
        })
    })
    .await?;

    println!("✅ Call {} connected", session.id);
    for service in &services {
        let peers: Vec<String> = service
            .peer_links()
            .iter()
            .map(|l| format!("{} ({:?})", l.peer_id, l.connection_state))
            .collect();
        println!("   {:<16} -> {}", service.local().label(), peers.join(", "));
    }

    tokio::time::sleep(hold).await;
    shutdown_all(&services).await;
    println!("📞 Call ended");
    Ok(())
}

async fn shutdown_all(services: &[Arc<CallService>]) {
    for service in services {
        service.shutdown().await;
    }
}

/// Answer every incoming call on `service`
fn spawn_auto_answer(service: Arc<CallService>, with_video: bool) {
    let mut incoming = service.subscribe_kinds(&[EventKind::IncomingCall]);
    tokio::spawn(async move {
        while let Some(event) = incoming.next().await {
            if let CallEvent::IncomingCall { call_id, .. } = event {
                if let Err(e) = service.answer_call(&call_id, with_video).await {
                    tracing::warn!(call_id = %call_id, error = %e, "Auto-answer failed");
                }
            }
        }
    });
}

/// Print every event of one participant
fn spawn_trace(name: String, mut events: broadcast::Receiver<CallEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("   [{name}] {}", describe(&event)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event trace lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_until(
    what: &str,
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> Result<()> {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}

fn describe(event: &CallEvent) -> String {
    match event {
        CallEvent::StateChanged { call_id, from, to } => format!("call {call_id}: {from} -> {to}"),
        CallEvent::IncomingCall {
            participants,
            call_type,
            ..
        } => {
            let caller = participants.first().map_or("?", ParticipantRef::label);
            format!("incoming {call_type:?} call from {caller}")
        }
        CallEvent::CallAnswered { with_video, .. } => {
            format!("answered (video: {with_video})")
        }
        CallEvent::CallRejected { reason, .. } => format!("rejected: {reason}"),
        CallEvent::CallEnded { call_id } => format!("call {call_id} ended"),
        CallEvent::LocalStream { tracks } => format!("local stream ({} tracks)", tracks.len()),
        CallEvent::RemoteStream { peer_id, track } => {
            format!("remote {:?} track from {peer_id}", track.kind())
        }
        CallEvent::PeerJoined { peer_id } => format!("{peer_id} joined"),
        CallEvent::PeerLeft { peer_id } => format!("{peer_id} left"),
        CallEvent::ConnectionStateChanged { peer_id, state } => {
            format!("link to {peer_id}: {state:?}")
        }
        CallEvent::ConnectionFailed { peer_id } => format!("link to {peer_id} failed"),
        CallEvent::MuteChanged { muted } => format!("muted: {muted}"),
        CallEvent::VideoChanged { video_off } => format!("video off: {video_off}"),
        CallEvent::ScreenShareStarted => "screen share started".to_string(),
        CallEvent::ScreenShareStopped => "screen share stopped".to_string(),
        CallEvent::CameraSwitched { facing } => format!("camera switched to {facing:?}"),
        CallEvent::SignalingConnected => "signaling connected".to_string(),
        CallEvent::SignalingDisconnected => "signaling disconnected".to_string(),
    }
}

#[derive(Serialize)]
struct TierRow {
    tier: SubscriptionTier,
    #[serde(flatten)]
    limits: TierLimits,
}

fn tier_rows(config: &CallServiceConfig) -> Vec<TierRow> {
    SubscriptionTier::ALL
        .into_iter()
        .map(|tier| TierRow {
            tier,
            limits: config.admission.limits(tier),
        })
        .collect()
}

fn handle_tiers(config: &CallServiceConfig, json: bool) -> Result<()> {
    let rows = tier_rows(config);
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<8} {:<7} {:<7} {}", "tier", "calls", "group", "max");
    for row in rows {
        println!(
            "{:<8} {:<7} {:<7} {}",
            row.tier.to_string(),
            yes_no(row.limits.call_access),
            yes_no(row.limits.group_calls),
            row.limits.max_participants
        );
    }
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

async fn handle_probe(
    config: CallServiceConfig,
    url: Option<String>,
    limit: Option<Duration>,
) -> Result<()> {
    let mut signaling = config.signaling;
    if let Some(url) = url {
        signaling.url = url;
    }
    println!("👂 Probing {}", signaling.url);

    let transport = Arc::new(WebSocketTransport::new(TransportConfig::from(&signaling)));
    let events = EventBus::default();
    let mut lifecycle = events.subscribe();
    let channel = Arc::new(SignalingChannel::new(transport, signaling, events));

    let (tx, mut inbound) = mpsc::unbounded_channel();
    let runner = Arc::clone(&channel);
    let task = tokio::spawn(async move { runner.run(tx).await });

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(message) = inbound.recv() => match message.to_json() {
                Ok(json) => println!("<- {json}"),
                Err(e) => tracing::warn!(error = %e, "Failed to re-encode message"),
            },
            Ok(event) = lifecycle.recv() => println!("   {}", describe(&event)),
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
        }
    }

    channel.shutdown();
    task.await.context("signaling task failed")?;
    Ok(())
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu", "atlas", "beacon",
        "comet", "dragon", "eagle", "falcon", "galaxy", "harbor", "icarus", "jupiter", "knight",
        "lunar", "meteor", "nebula", "orbit", "phoenix", "quasar", "rocket", "stellar", "titan",
        "universe", "vortex",
    ];

    let mut rng = rand::thread_rng();
    let first = WORDS[rng.gen_range(0..WORDS.len())];
    let second = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{first}-{second}-{}", rng.gen_range(10..100))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_shape() {
        let id = generate_random_identity();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].parse::<u8>().is_ok());
    }

    #[test]
    fn test_parse_demo_arguments() {
        let cli = Cli::try_parse_from([
            "meshcall", "--identity", "host", "demo", "-n", "4", "--tier", "vip", "--video",
        ])
        .unwrap();
        assert_eq!(cli.identity.as_deref(), Some("host"));
        match cli.command {
            Commands::Demo {
                participants,
                tier,
                video,
                hold_ms,
            } => {
                assert_eq!(participants, 4);
                assert_eq!(tier, SubscriptionTier::Vip);
                assert!(video);
                assert_eq!(hold_ms, 500);
            }
            _ => unreachable!("parsed a different command"),
        }
    }

    #[test]
    fn test_unknown_tier_is_rejected() {
        let res = Cli::try_parse_from(["meshcall", "demo", "--tier", "platinum"]);
        assert!(res.is_err());
    }

    #[test]
    fn test_tier_rows_follow_config() {
        let mut config = CallServiceConfig::default();
        config.admission.starter.max_participants = 3;
        let rows = tier_rows(&config);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1].tier, SubscriptionTier::Starter);
        assert_eq!(rows[1].limits.max_participants, 3);

        let json = serde_json::to_value(&rows).unwrap();
        assert_eq!(json[3]["tier"], "vip");
        assert_eq!(json[3]["max_participants"], 6);
    }

    #[test]
    fn test_describe_state_change() {
        let event = CallEvent::StateChanged {
            call_id: CallId::from("c-1"),
            from: CallState::Inviting,
            to: CallState::Active,
        };
        assert_eq!(describe(&event), "call c-1: Inviting -> Active");
    }

    #[tokio::test]
    async fn test_demo_runs_three_party_call() {
        handle_demo(
            CallServiceConfig::default(),
            "host",
            3,
            SubscriptionTier::Pro,
            CallType::Audio,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_demo_reports_refused_call() {
        let res = handle_demo(
            CallServiceConfig::default(),
            "host",
            3,
            SubscriptionTier::Starter,
            CallType::Audio,
            Duration::ZERO,
        )
        .await;
        assert!(res.is_err());
    }
}
