use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cproxy", about = "Local proxy for the Anthropic API")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the proxy server (the default).
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage the OAuth credential.
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum AuthCommand {
    /// Interactive PKCE login: open the printed URL, paste the code back.
    Login {
        /// Use the console authorize URL instead of claude.ai.
        #[arg(long)]
        console: bool,
    },
    /// Show whether a credential is present.
    Status,
    /// Delete the stored credential.
    Logout,
}
