//! hoot CLI — owl server and client.
//!
//! ```text
//! hoot serve [--port 9123] [--serial-port /dev/ttyUSB0] [--no-motion] [--greet]
//! hoot say "hello there" [--server http://localhost:9123]
//! hoot move tilt_front rotleft 5 [--duration 1.0]
//! hoot macro happy
//! hoot cancel / status [--server ...]
//! ```
//!
//! Server settings fall back to the same environment variables the owl has
//! always used (`ROBOT_PORT`, `HTTP_SERVER_PORT`, `OPENAI_API_KEY`, ...).

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use hoot_lib::annotator::OpenAiAnnotator;
use hoot_lib::events::{EventBus, spawn_dispatcher};
use hoot_lib::hoot_core::types::{
    AnnotatorConfig, LinkConfig, Macro, MotionConfig, MovementType, SpeechConfig,
};
use hoot_lib::link::Link;
use hoot_lib::motion::MotionController;
use hoot_lib::sequencer::Sequencer;
use hoot_lib::server::{AppState, router};
use hoot_lib::speech::{HookedPlayer, HttpSpeechPlayer, SpeechHooks};

const WELCOME_TEXT: &str = "Hello, I'm your owl companion. I'm here to help you with \
medication reminders, health monitoring, and to keep you company.";

const DEFAULT_SERVER: &str = "http://localhost:9123";

/// hoot — talking owl head driver
#[derive(Parser)]
#[command(name = "hoot", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the serial link and start the HTTP API
    Serve(ServeArgs),
    /// Ask the running server to say something
    Say {
        text: String,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Perform gestures by code, name or id (1-6)
    Move {
        #[arg(required = true)]
        movements: Vec<String>,
        /// Pause after each gesture, in seconds
        #[arg(long, default_value = "1.0")]
        duration: f32,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Run a named gesture batch (happy, greeting)
    Macro {
        name: String,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Cancel every sequence in progress
    Cancel {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Get server status
    Status {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Listen host
    #[arg(long, env = "HTTP_SERVER_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Listen port
    #[arg(long, env = "HTTP_SERVER_PORT", default_value = "9123")]
    port: u16,
    /// Serial device of the head controller
    #[arg(long, env = "ROBOT_PORT", default_value = "/dev/ttyUSB0")]
    serial_port: String,
    #[arg(long, env = "ROBOT_BAUDRATE", default_value = "57600")]
    baud_rate: u32,
    /// Serial read/write timeout in seconds
    #[arg(long, env = "ROBOT_TIMEOUT", default_value = "1.0", value_parser = parse_seconds)]
    serial_timeout: Duration,
    /// Seconds a gesture is held before returning to neutral
    #[arg(long, default_value = "1.0", value_parser = parse_seconds)]
    dwell: Duration,
    /// nayru-compatible TTS server
    #[arg(long, env = "HOOT_TTS_URL", default_value = "http://localhost:2003")]
    tts_url: String,
    /// Key for the annotation endpoint; without it text is spoken as written
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,
    #[arg(long, default_value = "gpt-3.5-turbo")]
    model: String,
    /// Speak only, never open the serial port
    #[arg(long)]
    no_motion: bool,
    /// Greet with a gesture and a welcome line on startup
    #[arg(long)]
    greet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hoot_lib=info,hoot_cli=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await?,

        Command::Say { text, server } => {
            post_json(&server, "owl/say", serde_json::json!({ "text": text })).await?;
        }

        Command::Move {
            movements,
            duration,
            server,
        } => {
            let batch = movements
                .iter()
                .map(|m| -> Result<serde_json::Value, Box<dyn Error>> {
                    let movement: MovementType = m.parse()?;
                    Ok(serde_json::json!({ "type": movement.code(), "duration": duration }))
                })
                .collect::<Result<Vec<_>, _>>()?;
            post_json(&server, "owl/command", serde_json::json!({ "movements": batch })).await?;
        }

        Command::Macro { name, server } => {
            let name: Macro = name.parse()?;
            post_json(&server, "owl/command", serde_json::json!({ "macro": name })).await?;
        }

        Command::Cancel { server } => {
            post_json(&server, "owl/cancel", serde_json::json!({})).await?;
        }

        Command::Status { server } => {
            let resp = reqwest::Client::new()
                .get(format!("{server}/owl/status"))
                .send()
                .await?;
            println!("{}", resp.text().await.unwrap_or_default());
        }
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let motion = if args.no_motion {
        info!("hoot: motion disabled, speech only");
        None
    } else {
        let link = Link::open(LinkConfig {
            port: args.serial_port,
            baud_rate: args.baud_rate,
            timeout: args.serial_timeout,
            ..Default::default()
        })?;
        let config = MotionConfig {
            dwell: args.dwell,
            ..Default::default()
        };
        Some(MotionController::new(link, config))
    };

    let speaking = Arc::new(AtomicUsize::new(0));
    let player = HookedPlayer::new(
        HttpSpeechPlayer::new(SpeechConfig {
            tts_url: args.tts_url,
            ..Default::default()
        }),
        SpeechHooks::tracking(speaking.clone()),
    );
    let mut sequencer = Sequencer::new(motion, Arc::new(player));

    match args.openai_api_key.filter(|k| !k.is_empty()) {
        Some(key) => {
            let annotator = OpenAiAnnotator::new(AnnotatorConfig {
                api_key: Some(key),
                model: args.model,
                ..Default::default()
            })?;
            sequencer = sequencer.with_annotator(Arc::new(annotator));
        }
        None => info!("hoot: no annotation key, markers in text are used as written"),
    }

    let bus = EventBus::default();
    let shutdown = CancellationToken::new();
    let dispatcher = spawn_dispatcher(&bus, sequencer.clone(), shutdown.clone());

    if args.greet {
        let greeter = sequencer.clone();
        tokio::spawn(async move {
            if let Some(motion) = greeter.motion() {
                motion.run_macro(Macro::Greeting).await;
            }
            greeter.perform_text(WELCOME_TEXT).wait().await;
        });
    }

    let app = router(AppState {
        sequencer: sequencer.clone(),
        bus,
        speaking,
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("hoot: listening on {addr}");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("hoot: shutting down");
            signal.cancel();
        })
        .await?;

    sequencer.cancel_all();
    let _ = dispatcher.await;
    if let Some(motion) = sequencer.motion() {
        let _ = motion.reset_posture().await;
        motion.link().close();
    }
    Ok(())
}

/// Seconds as a non-negative decimal that fits a [`Duration`].
fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f32 = s.parse().map_err(|e| format!("{e}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("expected a non-negative number of seconds, got {s}"));
    }
    Duration::try_from_secs_f32(secs).map_err(|e| format!("{s} seconds: {e}"))
}

async fn post_json(
    server: &str,
    endpoint: &str,
    body: serde_json::Value,
) -> Result<(), Box<dyn Error>> {
    let resp = reqwest::Client::new()
        .post(format!("{server}/{endpoint}"))
        .json(&body)
        .send()
        .await?;
    println!("{}", resp.text().await.unwrap_or_default());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_must_fit_a_duration() {
        assert_eq!(parse_seconds("0.5"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_seconds("0"), Ok(Duration::ZERO));
        assert!(parse_seconds("inf").is_err());
        assert!(parse_seconds("NaN").is_err());
        assert!(parse_seconds("1e30").is_err());
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
    }

    #[test]
    fn serve_rejects_unrepresentable_dwell() {
        let err = Cli::try_parse_from(["hoot", "serve", "--dwell", "inf"])
            .err()
            .expect("inf dwell accepted");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        assert!(Cli::try_parse_from(["hoot", "serve", "--serial-timeout", "1e30"]).is_err());

        let Ok(Cli { command: Command::Serve(args) }) =
            Cli::try_parse_from(["hoot", "serve", "--dwell", "0.25"])
        else {
            panic!("valid dwell rejected");
        };
        assert_eq!(args.dwell, Duration::from_millis(250));
    }
}
