use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use beacon_call::audio::{CpalCapture, CpalOutput, TARGET_SAMPLE_RATE};
use beacon_call::{
    CaptureDevice, Config, Devices, EventLog, InitiationShape, OutputDevice, PlaybackScheduler,
    TurnClient, TurnSession, VoiceClient,
};

/// Beacon Call - Real-time voice agent client
#[derive(Parser)]
#[command(name = "beacon-call", version, about)]
struct Cli {
    /// Config file (default: ~/.config/omni/beacon/call.toml)
    #[arg(short, long, env = "BEACON_CALL_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Settings that win over the config file and environment
#[derive(Args)]
struct Overrides {
    /// Streaming endpoint (ws:// or wss://)
    #[arg(long)]
    url: Option<String>,

    /// Turn-based API base (http:// or https://)
    #[arg(long)]
    http_url: Option<String>,

    /// Agent name
    #[arg(long)]
    agent_name: Option<String>,

    /// Customer name
    #[arg(long)]
    customer_name: Option<String>,

    /// Amount due
    #[arg(long)]
    amount: Option<String>,

    /// Due date
    #[arg(long)]
    due_date: Option<String>,

    /// Initiation message shape
    #[arg(long, value_parser = ["flat", "nested"])]
    initiation_shape: Option<String>,

    /// Run without a microphone
    #[arg(long)]
    no_mic: bool,

    /// Run without speakers
    #[arg(long)]
    no_playback: bool,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Stream a call over WebSocket (default)
    Stream,
    /// Turn-based call over HTTP
    Turns,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_call=info",
        1 => "info,beacon_call=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::TestMic { duration }) => return test_mic(duration).await,
        Some(Command::TestSpeaker) => return test_speaker().await,
        _ => {}
    }

    let mut config = Config::load(cli.config.as_deref())?;
    apply_overrides(&mut config, cli.overrides);
    config.validate()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Some(Command::Turns) => turns(&config).await,
        _ => stream(&config).await,
    }
}

fn apply_overrides(config: &mut Config, o: Overrides) {
    if let Some(url) = o.url {
        config.agent.stream_url = url;
    }
    if let Some(url) = o.http_url {
        config.agent.http_url = url;
    }
    if let Some(name) = o.agent_name {
        config.call.agent_name = name;
    }
    if let Some(name) = o.customer_name {
        config.call.customer_name = name;
    }
    if let Some(amount) = o.amount {
        config.call.amount = amount;
    }
    if let Some(date) = o.due_date {
        config.call.due_date = date;
    }
    if let Some(shape) = o.initiation_shape {
        config.agent.initiation_shape = if shape == "nested" {
            InitiationShape::Nested
        } else {
            InitiationShape::Flat
        };
    }
    if o.no_mic {
        config.audio.capture = false;
    }
    if o.no_playback {
        config.audio.playback = false;
    }
}

/// Streaming call: stdin lines become user text, slash commands drive the call
async fn stream(config: &Config) -> anyhow::Result<()> {
    let client = VoiceClient::with_websocket(config);
    let mut events = client.events();
    let mut status = client.subscribe();

    tracing::info!(
        url = %config.agent.stream_url,
        agent = %config.call.agent_name,
        "starting call (type text to send, /mic, /mute, /end, /connect, /quit)"
    );
    client.prefetch_permission().await;
    client.connect().await;

    let (line_tx, mut lines) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = stdin.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.recv() => match line.as_deref().map(str::trim) {
                None | Some("/quit") => break,
                Some("/mic") => client.start_mic().await,
                Some("/mute") => client.stop_mic(true).await,
                Some("/end") => client.disconnect().await,
                Some("/connect") => client.connect().await,
                Some("") => {}
                Some(text) => client.send_text(text).await,
            },
            Ok(line) = events.recv() => println!("{line}"),
            Ok(()) = status.changed() => {
                let s = status.borrow_and_update().clone();
                tracing::debug!(
                    status = %s.status,
                    connected = s.connected,
                    mic_on = s.mic_on,
                    agent_ready = s.agent_ready,
                    "status"
                );
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Turn-based call over HTTP
async fn turns(config: &Config) -> anyhow::Result<()> {
    let log = EventLog::new(config.log_capacity);
    let mut events = log.subscribe();
    tokio::spawn(async move {
        while let Ok(line) = events.recv().await {
            println!("{line}");
        }
    });

    let client = TurnClient::new(&config.agent.http_url);
    let mut session = TurnSession::new(
        client,
        Devices::system(&config.audio),
        config.audio.record_window,
        Arc::new(log),
    );

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        result = async {
            session.start(&config.call.amount, &config.lang).await?;
            session.converse().await
        } => result,
    };

    session.end().await;
    outcome.map_err(Into::into)
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = CpalCapture::new();
    capture.probe()?;
    let (tx, mut rx) = mpsc::channel(64);
    let sample_rate = capture.start(tx)?;
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration {
        let mut samples = Vec::new();
        let second = tokio::time::sleep(Duration::from_secs(1));
        tokio::pin!(second);
        loop {
            tokio::select! {
                () = &mut second => break,
                Some(chunk) = rx.recv() => samples.extend(chunk),
            }
        }

        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with two back-to-back tones
///
/// The tones go through the same scheduler as agent audio, so a click or
/// gap between them means scheduling is off.
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear 440Hz then 660Hz, one second each, with no gap\n");

    let output = CpalOutput::open()?;
    println!("Output rate: {} Hz", output.sample_rate());
    let device: Box<dyn OutputDevice> = Box::new(output);
    let mut scheduler = PlaybackScheduler::new(Some(device));

    let rate = TARGET_SAMPLE_RATE;
    for frequency in [440.0_f32, 660.0] {
        let samples = tone(frequency, rate, 1.0);
        if let Some(chunk) = scheduler.schedule(&samples, rate) {
            println!("Scheduled {frequency}Hz at {:.3}s", chunk.start);
        }
    }

    tokio::time::sleep(Duration::from_secs_f64(scheduler.remaining() + 0.2)).await;

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn tone(frequency: f32, rate: u32, secs: f32) -> Vec<f32> {
    let n = (rate as f32 * secs) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect()
}
