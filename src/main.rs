use edgellm::cli::commands::{CliArgs, Commands};
use edgellm::cli::handlers::{
    handle_audit, handle_audit_purge, handle_config, handle_consent, handle_detect,
    handle_download, handle_models, handle_privacy, handle_remove, handle_run, handle_serve,
};
use edgellm::cli::OutputFormat;
use edgellm::util::logging::{init_logging, parse_level, LoggingConfig};
use edgellm::VERSION;

use clap::Parser;
use tracing::{debug, Level};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("edgellm v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let format: OutputFormat = args.format.into();
    let exit_code = match &args.command {
        Commands::Detect => handle_detect(format).await,
        Commands::Models(models_args) => handle_models(models_args, format).await,
        Commands::Download(download_args) => {
            handle_download(download_args, format, args.quiet).await
        }
        Commands::Remove(model_args) => handle_remove(model_args).await,
        Commands::Run(run_args) => handle_run(run_args, format).await,
        Commands::Audit(audit_args) => handle_audit(audit_args, format).await,
        Commands::AuditPurge => handle_audit_purge().await,
        Commands::Privacy { action } => handle_privacy(action, format).await,
        Commands::Consent { action } => handle_consent(action, format).await,
        Commands::Config => handle_config(format).await,
        Commands::Serve => handle_serve().await,
    };

    std::process::exit(exit_code);
}

fn init_logging_from_args(args: &CliArgs) {
    let mut config = LoggingConfig::from_env();
    if let Some(level_str) = &args.log_level {
        config.level = parse_level(level_str);
    } else if args.verbose {
        config.level = Level::DEBUG;
    } else if args.quiet {
        config.level = Level::ERROR;
    }
    init_logging(config);
}
