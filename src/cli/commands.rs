use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::audit::AuditEventType;
use crate::routing::ConsentScope;

/// Privacy-aware on-device LLM runtime
#[derive(Parser, Debug)]
#[command(
    name = "edgellm",
    about = "Privacy-aware on-device LLM runtime",
    version,
    author,
    long_about = "edgellm detects what this device can run, downloads verified models, \
                  streams local inference and decides per request whether a query may \
                  leave the device. Every routing decision is written to an audit log."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,

    #[arg(
        short = 'f',
        long,
        value_enum,
        global = true,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Detect hardware capabilities and the performance tier",
        long_about = "Probes memory, cores and accelerators and derives the performance tier \
                      and inference constraints.\n\n\
                      Examples:\n  \
                      edgellm detect\n  \
                      edgellm detect --format json"
    )]
    Detect,

    #[command(
        about = "List catalog models compatible with this device",
        long_about = "Lists catalog models this device can run. Use --all for the whole \
                      catalog, --recommended for models that fit in available memory, \
                      --local for verified downloaded models.\n\n\
                      Examples:\n  \
                      edgellm models\n  \
                      edgellm models --all --format yaml"
    )]
    Models(ModelsArgs),

    #[command(
        about = "Download and verify a model",
        long_about = "Downloads a catalog model with resume support and verifies its checksum \
                      before making it available.\n\n\
                      Examples:\n  \
                      edgellm download tinyllama-1.1b-q4"
    )]
    Download(DownloadArgs),

    #[command(about = "Delete a downloaded model")]
    Remove(ModelArgs),

    #[command(
        about = "Run a prompt through routing and inference",
        long_about = "Routes the prompt according to the privacy policy and streams the \
                      answer.\n\n\
                      Examples:\n  \
                      edgellm run tinyllama-1.1b-q4 \"What is the capital of France?\"\n  \
                      edgellm run phi-2 \"Summarize this\" --max-tokens 64"
    )]
    Run(RunArgs),

    #[command(about = "Query the audit log")]
    Audit(AuditArgs),

    #[command(about = "Delete audit entries older than the retention period")]
    AuditPurge,

    #[command(about = "Show or change the privacy policy")]
    Privacy {
        #[command(subcommand)]
        action: PrivacyAction,
    },

    #[command(about = "Grant or revoke consent for external processing")]
    Consent {
        #[command(subcommand)]
        action: ConsentAction,
    },

    #[command(about = "Show the effective configuration")]
    Config,

    #[command(
        about = "Serve JSON-RPC on stdin/stdout",
        long_about = "Reads one JSON-RPC 2.0 request per line from stdin and writes responses \
                      and notifications to stdout. Logs go to stderr."
    )]
    Serve,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ModelsArgs {
    #[arg(long, conflicts_with_all = ["recommended", "local"], help = "Show the whole catalog")]
    pub all: bool,

    #[arg(long, conflicts_with = "local", help = "Only models that fit in available memory")]
    pub recommended: bool,

    #[arg(long, help = "Only verified local models")]
    pub local: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    #[arg(value_name = "MODEL_ID")]
    pub model_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    #[arg(value_name = "MODEL_ID")]
    pub model_id: String,

    #[arg(long, help = "Hide the progress bar")]
    pub no_progress: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(value_name = "MODEL_ID")]
    pub model_id: String,

    #[arg(value_name = "PROMPT")]
    pub prompt: String,

    #[arg(long, default_value = "256", help = "Maximum tokens to generate")]
    pub max_tokens: u32,

    #[arg(long, default_value = "0.7")]
    pub temperature: f32,

    #[arg(long, default_value = "0.9", help = "Nucleus sampling probability")]
    pub top_p: f32,

    #[arg(long = "stop", value_name = "TEXT", help = "Stop sequence (repeatable)")]
    pub stop_sequences: Vec<String>,

    #[arg(long, help = "Print the answer only once it is complete")]
    pub no_stream: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct AuditArgs {
    #[arg(long, help = "Show only the most recent N entries")]
    pub limit: Option<usize>,

    #[arg(long, value_parser = parse_event_type, help = "query, response, model_load or privacy_change")]
    pub event: Option<AuditEventType>,

    #[arg(long, value_name = "SESSION_ID")]
    pub session: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum PrivacyAction {
    #[command(about = "Show the current policy")]
    Show,

    #[command(about = "Change one or more policy fields")]
    Set(PrivacySetArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct PrivacySetArgs {
    #[arg(long, value_name = "BOOL")]
    pub local_only: Option<bool>,

    #[arg(long, value_name = "BOOL")]
    pub auditing: Option<bool>,

    #[arg(long, value_name = "DAYS", help = "Audit retention in days (1-365)")]
    pub retention_days: Option<u32>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConsentAction {
    #[command(about = "Grant consent for one prompt, or device-wide without --prompt")]
    Grant {
        #[arg(long)]
        prompt: Option<String>,
    },

    #[command(about = "Revoke consent")]
    Revoke {
        #[arg(long, value_enum)]
        scope: ConsentScopeArg,

        #[arg(long, help = "Revoke consent for this prompt only")]
        prompt: Option<String>,
    },

    #[command(about = "List active consent records")]
    List,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentScopeArg {
    Query,
    Device,
}

impl From<ConsentScopeArg> for ConsentScope {
    fn from(arg: ConsentScopeArg) -> Self {
        match arg {
            ConsentScopeArg::Query => ConsentScope::Query,
            ConsentScopeArg::Device => ConsentScope::Device,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}

fn parse_event_type(s: &str) -> Result<AuditEventType, String> {
    s.parse::<AuditEventType>().map_err(|_| {
        format!(
            "Invalid event type: {}. Valid options: query, response, model_load, privacy_change",
            s
        )
    })
}
