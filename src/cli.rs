use clap::{Parser, Subcommand};

/// cmdgate — human-in-the-loop command gate for AI coding assistants
#[derive(Parser)]
#[command(name = "cmdgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as a pre-tool hook: read the event from stdin, write the
    /// decision to stdout (the default when no subcommand is given)
    Hook,

    /// Start the webhook server hosting the chat callback endpoints
    Serve {
        /// Port to bind
        #[arg(short, long, default_value = "8787")]
        port: u16,
    },

    /// Classify a command offline and print the result
    Check {
        /// The command to classify
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Send a test message through the configured messenger
    Test,

    /// Verify messenger credentials and print the provider handle
    Probe,
}
