#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps
)]

use anyhow::{bail, Context, Result};
use chatbroker::{gateway, Config};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::Write;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `chatbroker` - live chat between website visitors and your support desk.
#[derive(Parser, Debug)]
#[command(name = "chatbroker")]
#[command(version)]
#[command(about = "Live chat session broker for visitor/operator support chats.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: ~/.chatbroker)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the chat broker (WebSocket + query API)
    #[command(long_about = "\
Start the chat broker.

Serves the /ws chat socket used by the visitor widget and the admin \
dashboard, plus the read-only /chat/sessions query API. Bind address \
defaults to the values in your config file (gateway.host / gateway.port).

Examples:
  chatbroker serve                  # use config defaults
  chatbroker serve -p 9000          # listen on port 9000
  chatbroker serve --host 0.0.0.0   # bind to all interfaces (needs allow_public_bind)
  chatbroker serve -p 0             # random available port")]
    Serve {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Show the effective configuration
    Status,

    /// Manage configuration
    #[command(long_about = "\
Manage chatbroker configuration.

Use 'schema' to dump the full JSON Schema for the config file, which \
documents every available key, type, and default value.

Examples:
  chatbroker config schema              # print JSON Schema to stdout
  chatbroker config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `chatbroker`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(chatbroker completions bash)
  chatbroker completions zsh > ~/.zfunc/_chatbroker
  chatbroker completions fish > ~/.config/fish/completions/chatbroker.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var(chatbroker::config::CONFIG_DIR_ENV, config_dir);
    }

    // Completions and the schema dump stay stdout-only: no config, no logging.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            return write_shell_completion(*shell, &mut stdout);
        }
        Commands::Config {
            config_command: ConfigCommands::Schema,
        } => {
            let schema = schemars::schema_for!(Config);
            let json =
                serde_json::to_string_pretty(&schema).context("failed to serialize JSON Schema")?;
            println!("{json}");
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load_or_init().await?;

    // RUST_LOG wins over the configured filter.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.observability.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Completions { .. } | Commands::Config { .. } => unreachable!(),

        Commands::Serve { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            if port == 0 {
                info!("Starting chat broker on {host} (random port)");
            } else {
                info!("Starting chat broker on {host}:{port}");
            }
            gateway::run_gateway(&host, port, config).await
        }

        Commands::Status => {
            let broker = &config.broker;
            println!("chatbroker Status");
            println!();
            println!("Version:     {}", env!("CARGO_PKG_VERSION"));
            println!("Config:      {}", config.config_path.display());
            println!();
            println!("Gateway:");
            println!(
                "  Listen:            {}:{}",
                config.gateway.host, config.gateway.port
            );
            println!("  Public bind:       {}", config.gateway.allow_public_bind);
            println!(
                "  CORS any origin:   {}",
                config.gateway.cors_allow_any_origin
            );
            println!();
            println!("Sessions:");
            println!("  Waiting timeout:   {}s", broker.waiting_timeout_secs);
            println!(
                "  Admin grace:       {}",
                describe_secs(broker.admin_disconnect_grace_secs)
            );
            println!(
                "  Ended retention:   {}",
                describe_secs(broker.ended_retention_secs)
            );
            println!("  Admin claim req'd: {}", broker.require_admin_claim);
            println!();
            println!("Relay:");
            println!("  Queue capacity:    {}", broker.outbound_queue_capacity);
            println!("  Drop budget:       {}", broker.max_dropped_frames);
            println!("  Max frame bytes:   {}", broker.max_frame_bytes);
            println!("  Ping interval:     {}s", broker.ping_interval_secs);
            println!();
            println!("Log filter:  {}", config.observability.log_filter);

            Ok(())
        }
    }
}

fn describe_secs(secs: u64) -> String {
    if secs == 0 {
        "off".to_string()
    } else {
        format!("{secs}s")
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, Parser};

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn completions_cli_parses_supported_shells() {
        for shell in ["bash", "fish", "zsh", "powershell", "elvish"] {
            let cli = Cli::try_parse_from(["chatbroker", "completions", shell])
                .expect("completions invocation should parse");
            match cli.command {
                Commands::Completions { .. } => {}
                other => panic!("expected completions command, got {other:?}"),
            }
        }
    }

    #[test]
    fn serve_accepts_port_and_host_overrides() {
        let cli = Cli::try_parse_from(["chatbroker", "serve", "-p", "0", "--host", "::1"])
            .expect("serve invocation should parse");
        match cli.command {
            Commands::Serve { port, host } => {
                assert_eq!(port, Some(0));
                assert_eq!(host.as_deref(), Some("::1"));
            }
            other => panic!("expected serve command, got {other:?}"),
        }
    }

    #[test]
    fn config_dir_is_global() {
        let cli = Cli::try_parse_from(["chatbroker", "status", "--config-dir", "/tmp/cb"])
            .expect("global flag should parse after subcommand");
        assert_eq!(cli.config_dir.as_deref(), Some("/tmp/cb"));
    }

    #[test]
    fn completion_generation_mentions_binary_name() {
        let mut output = Vec::new();
        write_shell_completion(CompletionShell::Bash, &mut output)
            .expect("completion generation should succeed");
        let script = String::from_utf8(output).expect("completion output should be valid utf-8");
        assert!(
            script.contains("chatbroker"),
            "completion script should reference binary name"
        );
    }

    #[test]
    fn describe_secs_marks_zero_as_off() {
        assert_eq!(describe_secs(0), "off");
        assert_eq!(describe_secs(90), "90s");
    }
}
