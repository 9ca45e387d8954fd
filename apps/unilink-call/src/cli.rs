use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{CallConfig, ChatMode, parse_api_base};
use crate::media::MediaConstraints;
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "unilink-call",
    about = "Join a UniLink one-to-one call from the terminal",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "UNILINK_API_URL",
        value_name = "URL",
        help = "Base URL of the call service (REST and signaling)"
    )]
    pub server: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "UNILINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "UNILINK_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a call by id and stay in it until it ends
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    #[arg(value_name = "CALL_ID", help = "Identifier of the call to join")]
    pub call_id: String,

    #[arg(
        long,
        env = "UNILINK_TOKEN",
        hide_env_values = true,
        help = "Access token (with or without the `Bearer ` prefix)"
    )]
    pub token: String,

    #[arg(
        long = "user-id",
        env = "UNILINK_USER_ID",
        help = "Identifier of the local user"
    )]
    pub user_id: String,

    #[arg(
        long,
        value_enum,
        help = "Chat transport; defaults to UNILINK_CHAT_MODE or the data channel"
    )]
    pub chat: Option<ChatMode>,

    #[arg(long = "audio-only", help = "Join without a camera track")]
    pub audio_only: bool,

    #[arg(long = "no-camera", help = "Start with the camera turned off")]
    pub no_camera: bool,

    #[arg(long, help = "Start with the microphone muted")]
    pub muted: bool,
}

impl Cli {
    /// Environment-derived configuration with command line overrides applied.
    pub fn call_config(&self) -> Result<CallConfig, url::ParseError> {
        let mut config = CallConfig::from_env();
        if let Some(server) = self.server.as_deref() {
            config.api_base = parse_api_base(server)?;
        }
        let Command::Join(join) = &self.command;
        if let Some(mode) = join.chat {
            config.chat_mode = mode;
        }
        if join.audio_only {
            config.media = MediaConstraints::audio_only();
        }
        Ok(config)
    }
}
