//! v2fhir CLI - convert tokenised HL7 v2 messages to FHIR resources
//!
//! Loads a converter configuration and its templates, then converts a message
//! or just checks that the configuration is consistent.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use v2fhir::runtime::KEY_NAME_SUFFIX;
use v2fhir::{
    ConverterConfig, EvaluationContext, EvaluationResult, InputDataExtractor, JsonMessageData,
    MessageConverter, SystemUrlLookup, TemplateSet, TransformRegistry,
};

#[derive(Parser)]
#[command(name = "v2fhir")]
#[command(version, about = "Template-driven HL7 v2 to FHIR conversion", long_about = None)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one message and print the resources as JSON
    Convert {
        /// Path to the converter configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Directory containing template YAML files
        #[arg(short, long)]
        templates: PathBuf,

        /// Path to the message JSON
        #[arg(short, long)]
        message: PathBuf,

        /// Suffix for <key>_KEY_NAME_SUFFIX output keys
        #[arg(long)]
        key_suffix: Option<String>,

        /// Pretty-print the output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Load the configuration and templates without converting anything
    Validate {
        /// Path to the converter configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Directory containing template YAML files
        #[arg(short, long)]
        templates: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Convert {
            config,
            templates,
            message,
            key_suffix,
            pretty,
        } => convert(&config, &templates, &message, key_suffix, pretty),
        Commands::Validate { config, templates } => validate(&config, &templates),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_converter(config: &Path, templates: &Path) -> Result<MessageConverter, String> {
    let lookup = SystemUrlLookup::global().map_err(|e| format!("Failed to load terminology: {}", e))?;
    let registry = Arc::new(TransformRegistry::with_builtins(lookup));

    let config = ConverterConfig::load_from_file(config)
        .map_err(|e| format!("Failed to load converter config: {}", e))?;
    let templates = TemplateSet::load_templates(templates, registry)
        .map_err(|e| format!("Failed to load templates: {}", e))?;

    MessageConverter::new(config, templates).map_err(|e| format!("Invalid configuration: {}", e))
}

/// Convert a message and print the resources
fn convert(
    config: &Path,
    templates: &Path,
    message: &Path,
    key_suffix: Option<String>,
    pretty: bool,
) -> Result<(), String> {
    let converter = load_converter(config, templates)?;

    let contents = std::fs::read_to_string(message)
        .map_err(|e| format!("Failed to read message {}: {}", message.display(), e))?;
    let data = JsonMessageData::from_json_str(&contents).map_err(|e| format!("Invalid message: {}", e))?;

    if data.name() != converter.config().message_type {
        tracing::warn!(
            expected = %converter.config().message_type,
            actual = %data.name(),
            "Message type does not match converter configuration"
        );
    }

    let mut context = EvaluationContext::new();
    if let Some(suffix) = key_suffix {
        context.insert(KEY_NAME_SUFFIX, EvaluationResult::new(suffix));
    }

    let converted = converter.convert(&data, &context).map_err(|e| e.to_string())?;
    for skipped in converted.skipped() {
        tracing::warn!(resource = %skipped.name, phase = %skipped.phase, "Resource skipped");
    }

    let json = converted.to_json().map_err(|e| e.to_string())?;
    let output = if pretty {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    }
    .map_err(|e| e.to_string())?;

    println!("{}", output);
    Ok(())
}

/// Validate configuration and templates
fn validate(config: &Path, templates: &Path) -> Result<(), String> {
    println!("Validating {} with templates in {}...", config.display(), templates.display());

    let converter = load_converter(config, templates)?;

    println!("  ✓ {} templates loaded", converter.templates().len());
    for (name, source) in converter.describe() {
        println!("  ✓ {} <- {}", name, source);
    }
    println!("All configurations are valid!");

    Ok(())
}
